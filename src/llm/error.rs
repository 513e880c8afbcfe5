//! Error classification and retry policy shared by the LLM clients.

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

/// Broad category of an LLM request failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// 429 from the provider.
    RateLimited,
    /// 5xx from the provider.
    ServerError,
    /// 4xx other than 429; retrying will not help.
    ClientError,
    /// Timeout, connection refused, reset.
    NetworkError,
    /// The provider answered with something we could not understand.
    ParseError,
}

impl fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::ClientError => "client_error",
            Self::NetworkError => "network_error",
            Self::ParseError => "parse_error",
        };
        f.write_str(s)
    }
}

/// Map an HTTP status code to an error kind.
pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        500..=599 => LlmErrorKind::ServerError,
        400..=499 => LlmErrorKind::ClientError,
        _ => LlmErrorKind::ServerError,
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub message: String,
    pub status_code: Option<u16>,
    pub retry_after: Option<Duration>,
}

impl LlmError {
    pub fn rate_limited(message: String, retry_after: Option<Duration>) -> Self {
        Self {
            kind: LlmErrorKind::RateLimited,
            message,
            status_code: Some(429),
            retry_after,
        }
    }

    pub fn server_error(status: u16, message: String) -> Self {
        Self {
            kind: LlmErrorKind::ServerError,
            message,
            status_code: Some(status),
            retry_after: None,
        }
    }

    pub fn client_error(status: u16, message: String) -> Self {
        Self {
            kind: LlmErrorKind::ClientError,
            message,
            status_code: Some(status),
            retry_after: None,
        }
    }

    pub fn network_error(message: String) -> Self {
        Self {
            kind: LlmErrorKind::NetworkError,
            message,
            status_code: None,
            retry_after: None,
        }
    }

    pub fn parse_error(message: String) -> Self {
        Self {
            kind: LlmErrorKind::ParseError,
            message,
            status_code: None,
            retry_after: None,
        }
    }

    /// Build the error for a non-success HTTP response.
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        match classify_http_status(status) {
            LlmErrorKind::RateLimited => Self::rate_limited(body.to_string(), retry_after),
            LlmErrorKind::ClientError => Self::client_error(status, body.to_string()),
            _ => Self::server_error(status, body.to_string()),
        }
    }

    /// Build the error for a transport failure.
    pub fn from_reqwest(e: &reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::network_error(format!("Request timeout: {}", e))
        } else if e.is_connect() {
            Self::network_error(format!("Connection failed: {}", e))
        } else {
            Self::network_error(format!("Request failed: {}", e))
        }
    }

    /// Delay before the next attempt; the provider's Retry-After wins.
    pub fn suggested_delay(&self, attempt: u32, config: &RetryConfig) -> Duration {
        if let Some(after) = self.retry_after {
            return after.min(config.max_delay);
        }
        let factor = 2u32.saturating_pow(attempt);
        config.base_delay.saturating_mul(factor).min(config.max_delay)
    }
}

/// Parse a `Retry-After` header given in seconds.
pub fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Retry policy for transient provider failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Give up once this much wall time has passed, whatever the attempt count.
    pub max_retry_duration: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retry_duration: Duration::from_secs(120),
        }
    }
}

impl RetryConfig {
    pub fn should_retry(&self, error: &LlmError) -> bool {
        matches!(
            error.kind,
            LlmErrorKind::RateLimited | LlmErrorKind::ServerError | LlmErrorKind::NetworkError
        )
    }
}

/// Run `op` until it succeeds, fails permanently, or the retry budget is spent.
pub async fn retry_with_backoff<T, F, Fut>(
    config: &RetryConfig,
    label: &str,
    mut op: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let start = Instant::now();
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(
                        "{} succeeded after {} retries (total time: {:?})",
                        label,
                        attempt,
                        start.elapsed()
                    );
                }
                return Ok(value);
            }
            Err(error) => {
                let should_retry = config.should_retry(&error) && attempt < config.max_retries;
                if !should_retry {
                    if attempt > 0 {
                        tracing::error!(
                            "{} failed after {} retries (total time: {:?}): {}",
                            label,
                            attempt,
                            start.elapsed(),
                            error
                        );
                    } else {
                        tracing::error!("{} failed (non-retryable): {}", label, error);
                    }
                    return Err(error.into());
                }

                let remaining = config.max_retry_duration.saturating_sub(start.elapsed());
                let delay = error.suggested_delay(attempt, config).min(remaining);
                if delay.is_zero() {
                    tracing::warn!(
                        "{} attempt {} failed, no time remaining: {}",
                        label,
                        attempt + 1,
                        error
                    );
                    return Err(error.into());
                }

                tracing::warn!(
                    "{} attempt {} failed with {}, retrying in {:?}: {}",
                    label,
                    attempt + 1,
                    error.kind,
                    delay,
                    error.message
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
