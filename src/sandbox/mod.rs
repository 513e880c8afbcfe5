//! Ephemeral cloud sandboxes the coding agent works in.
//!
//! [`SandboxProvider`] creates sandboxes and reconnects to them by id;
//! [`Sandbox`] is a live handle. Handles are cheap and can be re-obtained at
//! any point from the id alone, so job steps only ever persist the id.

mod e2b;
pub mod envelope;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use e2b::E2bProvider;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Sandbox API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Sandbox {0} not found")]
    NotFound(String),

    #[error("Command exited with code {exit_code}: {error}")]
    CommandExit {
        exit_code: i32,
        error: String,
        stdout: String,
        stderr: String,
    },

    #[error("Malformed process stream: {0}")]
    Protocol(String),

    #[error("Sandbox provider is not configured: {0}")]
    NotConfigured(String),
}

/// Collected output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// A live sandbox.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn id(&self) -> &str;

    /// Reset the sandbox's time-to-live, counted from now.
    async fn set_timeout(&self, timeout: Duration) -> Result<(), SandboxError>;

    /// Run a shell command and wait for it; a non-zero exit is
    /// [`SandboxError::CommandExit`].
    async fn run_command(&self, command: &str) -> Result<CommandOutput, SandboxError>;

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError>;

    async fn read_file(&self, path: &str) -> Result<String, SandboxError>;

    /// Public host name forwarding to `port` inside the sandbox.
    fn host(&self, port: u16) -> String;
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Start a sandbox from `template` and return its id.
    async fn create(&self, template: &str, timeout: Duration) -> Result<String, SandboxError>;

    /// Get a handle to an existing sandbox.
    async fn connect(&self, sandbox_id: &str) -> Result<Arc<dyn Sandbox>, SandboxError>;
}
