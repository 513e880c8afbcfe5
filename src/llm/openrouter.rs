//! OpenRouter API client implementation with automatic retry for transient errors.
//!
//! Any OpenAI-compatible `/chat/completions` endpoint works; the base URL is
//! configurable.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::error::{parse_retry_after, retry_with_backoff, LlmError, RetryConfig};
use super::{ChatMessage, ChatResponse, LlmClient, TokenUsage, ToolCall, ToolDefinition};

/// OpenRouter API client with automatic retry for transient errors.
pub struct OpenRouterClient {
    client: Client,
    api_key: String,
    base_url: String,
    retry_config: RetryConfig,
}

impl OpenRouterClient {
    /// Create a new client with the default retry configuration.
    pub fn new(api_key: String, base_url: impl Into<String>) -> Self {
        Self::with_retry_config(api_key, base_url, RetryConfig::default())
    }

    /// Create a new client with a custom retry configuration.
    pub fn with_retry_config(
        api_key: String,
        base_url: impl Into<String>,
        retry_config: RetryConfig,
    ) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry_config,
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Execute a single request without retry.
    async fn execute_request(&self, request: &OpenRouterRequest) -> Result<ChatResponse, LlmError> {
        let response = self
            .client
            .post(self.completions_url())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("X-Title", "vibe")
            .json(request)
            .send()
            .await
            .map_err(|e| LlmError::from_reqwest(&e))?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(LlmError::from_status(status.as_u16(), &body, retry_after));
        }

        parse_response(&body, &request.model)
    }
}

/// Turn a completions response body into a [`ChatResponse`].
fn parse_response(body: &str, requested_model: &str) -> Result<ChatResponse, LlmError> {
    let parsed: OpenRouterResponse = serde_json::from_str(body).map_err(|e| {
        LlmError::parse_error(format!("Failed to parse response: {}, body: {}", e, body))
    })?;

    // OpenRouter reports upstream failures inside a 200 body.
    if let Some(error) = parsed.error {
        return Err(LlmError::server_error(
            error.code.unwrap_or(502),
            error.message,
        ));
    }

    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::parse_error("No choices in response".to_string()))?;

    Ok(ChatResponse {
        content: choice.message.content,
        tool_calls: choice.message.tool_calls,
        finish_reason: choice.finish_reason,
        usage: parsed
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
        model: parsed.model.or_else(|| Some(requested_model.to_string())),
    })
}

#[async_trait]
impl LlmClient for OpenRouterClient {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> anyhow::Result<ChatResponse> {
        let tools = tools.filter(|t| !t.is_empty());
        let request = OpenRouterRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            tools: tools.map(|t| t.to_vec()),
            tool_choice: tools.map(|_| "auto".to_string()),
        };

        tracing::debug!("Sending request to OpenRouter: model={}", model);

        retry_with_backoff(&self.retry_config, "OpenRouter request", || {
            self.execute_request(&request)
        })
        .await
    }
}

/// OpenRouter API request format.
#[derive(Debug, Serialize)]
struct OpenRouterRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
}

/// OpenRouter API response format.
#[derive(Debug, Deserialize)]
struct OpenRouterResponse {
    #[serde(default)]
    choices: Vec<OpenRouterChoice>,
    #[serde(default)]
    usage: Option<OpenRouterUsage>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    error: Option<OpenRouterError>,
}

#[derive(Debug, Deserialize)]
struct OpenRouterChoice {
    message: OpenRouterMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenRouterMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenRouterUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct OpenRouterError {
    message: String,
    #[serde(default)]
    code: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmErrorKind;

    #[test]
    fn test_parse_tool_call_response() {
        let body = r#"{
            "model": "deepseek/deepseek-chat",
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_0",
                        "type": "function",
                        "function": {"name": "readFiles", "arguments": "{\"files\":[\"app/page.tsx\"]}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }"#;
        let response = parse_response(body, "fallback").unwrap();
        assert!(response.content.is_none());
        let calls = response.tool_calls.unwrap();
        assert_eq!(calls[0].function.name, "readFiles");
        assert_eq!(response.usage.unwrap().total_tokens, 15);
        assert_eq!(response.model.as_deref(), Some("deepseek/deepseek-chat"));
    }

    #[test]
    fn test_parse_embedded_error() {
        let body = r#"{"error": {"message": "upstream overloaded", "code": 503}}"#;
        let err = parse_response(body, "m").unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::ServerError);
        assert_eq!(err.status_code, Some(503));
    }

    #[test]
    fn test_base_url_is_normalized() {
        let client = OpenRouterClient::new("key".into(), "https://openrouter.ai/api/v1/");
        assert_eq!(
            client.completions_url(),
            "https://openrouter.ai/api/v1/chat/completions"
        );
    }
}
