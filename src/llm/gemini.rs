//! Google Gemini `generateContent` client.
//!
//! Text only: system messages become the system instruction, assistant turns
//! map to the `model` role. Tool definitions are not supported.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::error::{parse_retry_after, retry_with_backoff, LlmError, RetryConfig};
use super::{ChatMessage, ChatResponse, LlmClient, Role, TokenUsage, ToolDefinition};

const GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    retry_config: RetryConfig,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: GEMINI_API_URL.to_string(),
            retry_config: RetryConfig::default(),
        }
    }

    async fn execute_request(
        &self,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<ChatResponse, LlmError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, model);
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
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

        parse_response(&body, model)
    }
}

/// Split chat messages into Gemini's system instruction and contents.
fn build_request(messages: &[ChatMessage]) -> GenerateContentRequest {
    let mut system = Vec::new();
    let mut contents = Vec::new();

    for message in messages {
        let Some(text) = message.text_content() else {
            continue;
        };
        match message.role {
            Role::System => system.push(Part { text }),
            Role::Assistant => contents.push(Content {
                role: "model".to_string(),
                parts: vec![Part { text }],
            }),
            Role::User | Role::Tool => contents.push(Content {
                role: "user".to_string(),
                parts: vec![Part { text }],
            }),
        }
    }

    GenerateContentRequest {
        system_instruction: (!system.is_empty()).then(|| SystemInstruction { parts: system }),
        contents,
    }
}

fn parse_response(body: &str, model: &str) -> Result<ChatResponse, LlmError> {
    let parsed: GenerateContentResponse = serde_json::from_str(body).map_err(|e| {
        LlmError::parse_error(format!("Failed to parse response: {}, body: {}", e, body))
    })?;

    let candidate = parsed
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::parse_error("No candidates in response".to_string()))?;

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    Ok(ChatResponse {
        content: (!text.is_empty()).then_some(text),
        tool_calls: None,
        finish_reason: candidate.finish_reason,
        usage: parsed
            .usage_metadata
            .map(|u| TokenUsage::new(u.prompt_token_count, u.candidates_token_count)),
        model: Some(model.to_string()),
    })
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> anyhow::Result<ChatResponse> {
        if tools.is_some_and(|t| !t.is_empty()) {
            anyhow::bail!("GeminiClient does not support tool calling");
        }
        let request = build_request(messages);

        tracing::debug!("Sending request to Gemini: model={}", model);

        retry_with_backoff(&self.retry_config, "Gemini request", || {
            self.execute_request(model, &request)
        })
        .await
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    contents: Vec<Content>,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_messages_become_instruction() {
        let request = build_request(&[
            ChatMessage::system("You write titles."),
            ChatMessage::user("<task_summary>Built a todo app</task_summary>"),
        ]);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "You write titles.");
        assert_eq!(json["contents"].as_array().unwrap().len(), 1);
        assert_eq!(json["contents"][0]["role"], "user");
    }

    #[test]
    fn test_parse_joins_candidate_parts() {
        let body = r#"{
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Todo "}, {"text": "App"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 2}
        }"#;
        let response = parse_response(body, "gemini-2.5-flash").unwrap();
        assert_eq!(response.content.as_deref(), Some("Todo App"));
        assert_eq!(response.finish_reason.as_deref(), Some("STOP"));
        assert_eq!(response.usage.unwrap().total_tokens, 14);
    }

    #[test]
    fn test_blocked_candidate_has_no_content() {
        let body = r#"{"candidates": [{"finishReason": "SAFETY"}]}"#;
        let response = parse_response(body, "gemini-2.5-flash").unwrap();
        assert!(response.content.is_none());
    }
}
