//! Runtime configuration.
//!
//! Values come from the process environment, after an optional `.env` file has
//! been loaded. API keys may be absent at startup: the read-only API keeps
//! working and the background job fails when it first needs the key.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("Missing required setting {0}")]
    Missing(&'static str),
}

/// LLM provider settings.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub openrouter_api_key: Option<String>,
    pub openrouter_base_url: String,
    /// Model used by the coding agent (tool calling).
    pub code_model: String,
    pub gemini_api_key: Option<String>,
    /// Model used for the fragment title and the user-facing reply.
    pub summary_model: String,
}

/// Sandbox provider settings.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub api_key: Option<String>,
    pub api_url: String,
    pub domain: String,
    pub template: String,
    pub timeout: Duration,
    /// Port the generated app listens on inside the sandbox.
    pub preview_port: u16,
}

/// Agent and job execution settings.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub max_iterations: usize,
    /// How many earlier project messages are fed to the agent.
    pub history_limit: usize,
    pub worker_concurrency: usize,
    pub max_retries: u32,
}

/// Credit allowance per caller.
#[derive(Debug, Clone)]
pub struct UsageConfig {
    pub free_credits: u32,
    pub window: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_path: PathBuf,
    pub llm: LlmConfig,
    pub sandbox: SandboxConfig,
    pub agent: AgentSettings,
    pub usage: UsageConfig,
}

impl Config {
    /// Load configuration from `.env` and the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("Loaded environment from {}", path.display());
        }

        Ok(Self {
            host: env_or("HOST", "127.0.0.1"),
            port: parse_env("PORT", 3000)?,
            database_path: PathBuf::from(env_or("DATABASE_PATH", "vibe.db")),
            llm: LlmConfig {
                openrouter_api_key: env_opt("OPENROUTER_API_KEY"),
                openrouter_base_url: env_or("OPENROUTER_BASE_URL", "https://openrouter.ai/api/v1"),
                code_model: env_or("CODE_AGENT_MODEL", "deepseek/deepseek-chat"),
                gemini_api_key: env_opt("GEMINI_API_KEY"),
                summary_model: env_or("GEMINI_MODEL", "gemini-2.5-flash"),
            },
            sandbox: SandboxConfig {
                api_key: env_opt("E2B_API_KEY"),
                api_url: env_or("E2B_API_URL", "https://api.e2b.dev"),
                domain: env_or("E2B_DOMAIN", "e2b.app"),
                template: env_or("SANDBOX_TEMPLATE", "vibe-nextjs-testyash-2"),
                timeout: Duration::from_secs(parse_env("SANDBOX_TIMEOUT_SECS", 30 * 60)?),
                preview_port: parse_env("PREVIEW_PORT", 3000)?,
            },
            agent: AgentSettings {
                max_iterations: parse_env("AGENT_MAX_ITERATIONS", 15)?,
                history_limit: parse_env("HISTORY_LIMIT", 5)?,
                worker_concurrency: parse_env("WORKER_CONCURRENCY", 4)?,
                max_retries: parse_env("JOB_MAX_RETRIES", 3)?,
            },
            usage: UsageConfig {
                free_credits: parse_env("FREE_CREDITS", 5)?,
                window: Duration::from_secs(parse_env("CREDIT_WINDOW_SECS", 30 * 24 * 60 * 60)?),
            },
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            database_path: PathBuf::from("vibe.db"),
            llm: LlmConfig {
                openrouter_api_key: None,
                openrouter_base_url: "https://openrouter.ai/api/v1".to_string(),
                code_model: "deepseek/deepseek-chat".to_string(),
                gemini_api_key: None,
                summary_model: "gemini-2.5-flash".to_string(),
            },
            sandbox: SandboxConfig {
                api_key: None,
                api_url: "https://api.e2b.dev".to_string(),
                domain: "e2b.app".to_string(),
                template: "vibe-nextjs-testyash-2".to_string(),
                timeout: Duration::from_secs(30 * 60),
                preview_port: 3000,
            },
            agent: AgentSettings {
                max_iterations: 15,
                history_limit: 5,
                worker_concurrency: 4,
                max_retries: 3,
            },
            usage: UsageConfig {
                free_credits: 5,
                window: Duration::from_secs(30 * 24 * 60 * 60),
            },
        }
    }
}

fn env_opt(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn env_or(var: &str, default: &str) -> String {
    env_opt(var).unwrap_or_else(|| default.to_string())
}

fn parse_env<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_opt(var) {
        None => Ok(default),
        Some(raw) => parse_value(var, &raw),
    }
}

fn parse_value<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue {
            var,
            value: raw.to_string(),
            reason: e.to_string(),
        })
}

/// Return the value or a [`ConfigError::Missing`] for the named variable.
pub fn require<'a>(value: &'a Option<String>, var: &'static str) -> Result<&'a str, ConfigError> {
    value.as_deref().ok_or(ConfigError::Missing(var))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value_rejects_garbage() {
        let err = parse_value::<u16>("PORT", "http").unwrap_err();
        assert!(err.to_string().contains("PORT"));
        assert_eq!(parse_value::<u16>("PORT", " 8080 ").unwrap(), 8080);
    }

    #[test]
    fn test_defaults_match_agent_limits() {
        let config = Config::default();
        assert_eq!(config.agent.max_iterations, 15);
        assert_eq!(config.agent.history_limit, 5);
        assert_eq!(config.sandbox.timeout, Duration::from_secs(1800));
        assert_eq!(config.sandbox.preview_port, 3000);
    }

    #[test]
    fn test_require_reports_variable() {
        let missing: Option<String> = None;
        let err = require(&missing, "E2B_API_KEY").unwrap_err();
        assert_eq!(err.to_string(), "Missing required setting E2B_API_KEY");
        let present = Some("k".to_string());
        assert_eq!(require(&present, "E2B_API_KEY").unwrap(), "k");
    }
}
