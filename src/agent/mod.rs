//! Agents and the network loop that drives them.
//!
//! An [`Agent`] is a system prompt, a model and a set of tools. Every
//! inference it makes is a memoized job step, so a retried run replays the
//! same model responses and reaches the same state.

mod network;
mod state;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::jobs::StepContext;
use crate::llm::{ChatMessage, ChatResponse, LlmClient, Role};
use crate::tools::ToolRegistry;

pub use network::{Network, NetworkRun, Router};
pub use state::AgentState;

/// Called after every inference with the result and the shared state.
pub type ResponseHook = Arc<dyn Fn(&AgentResult, &mut AgentState) + Send + Sync>;

/// Output of one tool call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub name: String,
    pub content: String,
}

/// Everything one agent produced in one inference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentResult {
    pub agent: String,
    pub output: Vec<ChatMessage>,
    pub tool_results: Vec<ToolResult>,
}

#[derive(Clone)]
pub struct Agent {
    pub name: String,
    pub system: String,
    pub model: String,
    client: Arc<dyn LlmClient>,
    tools: ToolRegistry,
    on_response: Option<ResponseHook>,
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        system: impl Into<String>,
        model: impl Into<String>,
        client: Arc<dyn LlmClient>,
    ) -> Self {
        Self {
            name: name.into(),
            system: system.into(),
            model: model.into(),
            client,
            tools: ToolRegistry::new(),
            on_response: None,
        }
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn on_response(
        mut self,
        hook: impl Fn(&AgentResult, &mut AgentState) + Send + Sync + 'static,
    ) -> Self {
        self.on_response = Some(Arc::new(hook));
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub(crate) fn apply_hook(&self, result: &AgentResult, state: &mut AgentState) {
        if let Some(hook) = &self.on_response {
            hook(result, state);
        }
    }

    /// One memoized inference over `messages`, step-named after the agent.
    pub(crate) async fn infer(
        &self,
        messages: &[ChatMessage],
        step: &StepContext,
    ) -> anyhow::Result<ChatResponse> {
        let definitions = self.tools.definitions();
        let tools = (!definitions.is_empty()).then_some(definitions.as_slice());

        step.run(&self.name, async {
            let response = self
                .client
                .chat_completion(&self.model, messages, tools)
                .await?;
            if let Some(usage) = &response.usage {
                tracing::debug!(
                    agent = %self.name,
                    model = %self.model,
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    "Inference completed"
                );
            }
            Ok(response)
        })
        .await
    }

    /// Single inference on `input` with no history and no tool execution.
    pub async fn run(&self, input: &str, step: &StepContext) -> anyhow::Result<AgentResult> {
        let messages = [ChatMessage::system(&self.system), ChatMessage::user(input)];
        let response = self.infer(&messages, step).await?;
        Ok(AgentResult {
            agent: self.name.clone(),
            output: vec![response.to_message()],
            tool_results: Vec::new(),
        })
    }
}

/// Text of the last assistant message in `result`, if any.
pub fn last_assistant_text(result: &AgentResult) -> Option<String> {
    result
        .output
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .and_then(|m| m.text_content())
}

/// Text of the first output message, or `"Fragment"` when it has none.
pub fn parse_agent_output(output: &[ChatMessage]) -> String {
    output
        .first()
        .and_then(|m| m.text_content())
        .unwrap_or_else(|| "Fragment".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{FunctionCall, ToolCall};

    fn tool_only_message() -> ChatMessage {
        ChatMessage {
            role: Role::Assistant,
            content: None,
            tool_calls: Some(vec![ToolCall {
                id: "call_1".to_string(),
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: "terminal".to_string(),
                    arguments: "{}".to_string(),
                },
            }]),
            tool_call_id: None,
        }
    }

    #[test]
    fn test_parse_agent_output() {
        assert_eq!(
            parse_agent_output(&[ChatMessage::assistant("Landing Page")]),
            "Landing Page"
        );
        assert_eq!(parse_agent_output(&[tool_only_message()]), "Fragment");
        assert_eq!(parse_agent_output(&[]), "Fragment");
    }

    #[test]
    fn test_last_assistant_text_skips_other_roles() {
        let result = AgentResult {
            agent: "code-agent".to_string(),
            output: vec![
                ChatMessage::assistant("first"),
                ChatMessage::assistant("<task_summary>done</task_summary>"),
                ChatMessage::tool_result("call_1", "ok"),
            ],
            tool_results: Vec::new(),
        };
        assert_eq!(
            last_assistant_text(&result).as_deref(),
            Some("<task_summary>done</task_summary>")
        );

        let silent = AgentResult {
            agent: "code-agent".to_string(),
            output: vec![tool_only_message()],
            tool_results: Vec::new(),
        };
        assert_eq!(last_assistant_text(&silent), None);
    }
}
