//! # vibe
//!
//! Backend for a natural-language app builder. A user describes a small web
//! app; the request is stored and handed to a background job that runs an
//! LLM coding agent inside a cloud sandbox. The generated files, a preview
//! URL and a short reply are stored for the browser UI.
//!
//! ## Request flow
//!
//! ```text
//!   browser ──tRPC──► api ──event──► jobs::JobQueue
//!                                        │
//!                                        ▼
//!                          code_agent::CodeAgentFunction
//!                            ├── sandbox (E2B)
//!                            ├── agent::Network + tools
//!                            └── store (message + fragment)
//! ```
//!
//! ## Modules
//! - `api`: tRPC procedures, job webhook, SSE project stream
//! - `jobs`: durable runs with memoized steps
//! - `agent`, `tools`, `llm`: the agent loop and its providers
//! - `sandbox`: E2B sandbox client
//! - `store`, `usage`: SQLite persistence and credit accounting

pub mod agent;
pub mod api;
pub mod code_agent;
pub mod config;
pub mod jobs;
pub mod llm;
pub mod prompt;
pub mod sandbox;
pub mod store;
pub mod tools;
pub mod usage;

pub use config::Config;
