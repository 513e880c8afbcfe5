//! The `code-agent` background function.
//!
//! Triggered by `code-agent/run` with `{ value, projectId }`. It starts a
//! sandbox, lets the coding agent build the requested app inside it, names
//! and describes the result with two small agents, and stores the reply and
//! the generated files as an assistant message of the project.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::agent::{last_assistant_text, parse_agent_output, Agent, Network};
use crate::config::{require, Config};
use crate::jobs::{Event, JobFunction, StepContext};
use crate::llm::{ChatMessage, ChatResponse, GeminiClient, LlmClient, OpenRouterClient, ToolDefinition};
use crate::prompt::{FRAGMENT_TITLE_PROMPT, PROMPT, RESPONSE_PROMPT};
use crate::sandbox::{E2bProvider, Sandbox, SandboxError, SandboxProvider};
use crate::store::{MessageRole, MessageType, NewFragment, NewMessage, Store};
use crate::tools::{ToolContext, ToolRegistry};

pub const FUNCTION_ID: &str = "code-agent";
pub const EVENT_NAME: &str = "code-agent/run";

/// Reply stored when the agent produced no summary or no files.
pub const ERROR_REPLY: &str = "Something went wrong. Please try again";

const SUMMARY_TAG: &str = "<task_summary>";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeAgentEvent {
    pub value: String,
    pub project_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeAgentOutput {
    pub url: String,
    pub title: String,
    pub files: BTreeMap<String, String>,
    pub summary: String,
}

#[derive(Debug, Clone)]
pub struct CodeAgentSettings {
    pub template: String,
    pub sandbox_timeout: Duration,
    pub preview_port: u16,
    pub code_model: String,
    pub summary_model: String,
    pub max_iterations: usize,
    pub history_limit: usize,
}

impl CodeAgentSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            template: config.sandbox.template.clone(),
            sandbox_timeout: config.sandbox.timeout,
            preview_port: config.sandbox.preview_port,
            code_model: config.llm.code_model.clone(),
            summary_model: config.llm.summary_model.clone(),
            max_iterations: config.agent.max_iterations,
            history_limit: config.agent.history_limit,
        }
    }
}

/// Stands in for a provider whose API key is missing, failing on first use.
struct NotConfigured(String);

#[async_trait]
impl LlmClient for NotConfigured {
    async fn chat_completion(
        &self,
        _model: &str,
        _messages: &[ChatMessage],
        _tools: Option<&[ToolDefinition]>,
    ) -> anyhow::Result<ChatResponse> {
        anyhow::bail!("{}", self.0)
    }
}

#[async_trait]
impl SandboxProvider for NotConfigured {
    async fn create(&self, _template: &str, _timeout: Duration) -> Result<String, SandboxError> {
        Err(SandboxError::NotConfigured(self.0.clone()))
    }

    async fn connect(&self, _sandbox_id: &str) -> Result<Arc<dyn Sandbox>, SandboxError> {
        Err(SandboxError::NotConfigured(self.0.clone()))
    }
}

pub struct CodeAgentFunction {
    store: Store,
    sandboxes: Arc<dyn SandboxProvider>,
    code_client: Arc<dyn LlmClient>,
    summary_client: Arc<dyn LlmClient>,
    settings: CodeAgentSettings,
}

impl CodeAgentFunction {
    pub fn new(
        store: Store,
        sandboxes: Arc<dyn SandboxProvider>,
        code_client: Arc<dyn LlmClient>,
        summary_client: Arc<dyn LlmClient>,
        settings: CodeAgentSettings,
    ) -> Self {
        Self {
            store,
            sandboxes,
            code_client,
            summary_client,
            settings,
        }
    }

    /// Wire up the real providers. Missing keys are logged here and reported
    /// by the first run that needs them.
    pub fn from_config(store: Store, config: &Config) -> Self {
        let sandboxes: Arc<dyn SandboxProvider> = match E2bProvider::new(&config.sandbox) {
            Ok(provider) => Arc::new(provider),
            Err(e) => {
                tracing::warn!("{}", e);
                Arc::new(NotConfigured(e.to_string()))
            }
        };

        let code_client: Arc<dyn LlmClient> =
            match require(&config.llm.openrouter_api_key, "OPENROUTER_API_KEY") {
                Ok(key) => Arc::new(OpenRouterClient::new(
                    key.to_string(),
                    config.llm.openrouter_base_url.clone(),
                )),
                Err(e) => {
                    tracing::warn!("{}", e);
                    Arc::new(NotConfigured(e.to_string()))
                }
            };

        let summary_client: Arc<dyn LlmClient> =
            match require(&config.llm.gemini_api_key, "GEMINI_API_KEY") {
                Ok(key) => Arc::new(GeminiClient::new(key.to_string())),
                Err(e) => {
                    tracing::warn!("{}", e);
                    Arc::new(NotConfigured(e.to_string()))
                }
            };

        Self::new(
            store,
            sandboxes,
            code_client,
            summary_client,
            CodeAgentSettings::from_config(config),
        )
    }

    fn coding_network(&self) -> Network {
        let code_agent = Agent::new(
            "code-agent",
            PROMPT,
            self.settings.code_model.clone(),
            self.code_client.clone(),
        )
        .with_tools(ToolRegistry::sandbox_tools())
        .on_response(|result, state| {
            if let Some(text) = last_assistant_text(result) {
                if text.contains(SUMMARY_TAG) {
                    state.summary = text;
                }
            }
        });

        Network::new(
            "coding-agent-network",
            vec![code_agent],
            self.settings.max_iterations,
        )
    }

    fn summary_agent(&self, name: &str, system: &str) -> Agent {
        Agent::new(
            name,
            system,
            self.settings.summary_model.clone(),
            self.summary_client.clone(),
        )
    }

    async fn previous_messages(&self, project_id: Uuid) -> anyhow::Result<Vec<ChatMessage>> {
        let recent = self
            .store
            .recent_messages(project_id, self.settings.history_limit)
            .await?;
        Ok(recent
            .into_iter()
            .rev()
            .map(|m| match m.role {
                MessageRole::Assistant => ChatMessage::assistant(m.content),
                MessageRole::User => ChatMessage::user(m.content),
            })
            .collect())
    }
}

#[async_trait]
impl JobFunction for CodeAgentFunction {
    fn id(&self) -> &str {
        FUNCTION_ID
    }

    fn trigger(&self) -> &str {
        EVENT_NAME
    }

    async fn run(&self, event: &Event, step: &StepContext) -> anyhow::Result<Value> {
        let input: CodeAgentEvent = serde_json::from_value(event.data.clone())
            .context("Invalid code-agent/run event data")?;
        tracing::info!(
            run_id = %step.run_id(),
            project_id = %input.project_id,
            attempt = step.attempt(),
            "Code agent started"
        );

        let sandbox_id: String = step
            .run("get-sandbox-id", async {
                let id = self
                    .sandboxes
                    .create(&self.settings.template, self.settings.sandbox_timeout)
                    .await?;
                let sandbox = self.sandboxes.connect(&id).await?;
                sandbox.set_timeout(self.settings.sandbox_timeout).await?;
                Ok(id)
            })
            .await?;

        let history: Vec<ChatMessage> = step
            .run("get-previous-messages", self.previous_messages(input.project_id))
            .await?;

        let ctx = ToolContext {
            sandboxes: self.sandboxes.clone(),
            sandbox_id: sandbox_id.clone(),
            step,
        };
        let result = self
            .coding_network()
            .run(&input.value, &history, &ctx)
            .await?;
        tracing::debug!(
            project_id = %input.project_id,
            iterations = result.results.len(),
            "Coding network finished"
        );
        let state = result.state;

        let is_error = state.summary.is_empty() || state.files.is_empty();

        let generated = if is_error {
            None
        } else {
            let title = self
                .summary_agent("fragment-title-generator", FRAGMENT_TITLE_PROMPT)
                .run(&state.summary, step)
                .await?;
            let response = self
                .summary_agent("response-generator", RESPONSE_PROMPT)
                .run(&state.summary, step)
                .await?;
            Some((
                parse_agent_output(&title.output),
                parse_agent_output(&response.output),
            ))
        };

        let sandbox_url: String = step
            .run("get-sandbox-url", async {
                let sandbox = self.sandboxes.connect(&sandbox_id).await?;
                Ok(format!("https://{}", sandbox.host(self.settings.preview_port)))
            })
            .await?;

        let message_id: Uuid = step
            .run("save-to-db", async {
                let message = match &generated {
                    None => NewMessage {
                        project_id: input.project_id,
                        content: ERROR_REPLY.to_string(),
                        role: MessageRole::Assistant,
                        message_type: MessageType::Error,
                        fragment: None,
                    },
                    Some((title, response)) => NewMessage {
                        project_id: input.project_id,
                        content: response.clone(),
                        role: MessageRole::Assistant,
                        message_type: MessageType::Result,
                        fragment: Some(NewFragment {
                            sandbox_url: sandbox_url.clone(),
                            title: title.clone(),
                            files: state.files.clone(),
                        }),
                    },
                };
                Ok(self.store.create_message(message).await?.id)
            })
            .await?;

        tracing::info!(
            project_id = %input.project_id,
            %message_id,
            is_error,
            files = state.files.len(),
            "Code agent finished"
        );

        let output = CodeAgentOutput {
            url: sandbox_url,
            title: "Fragments".to_string(),
            files: state.files,
            summary: state.summary,
        };
        Ok(serde_json::to_value(output)?)
    }
}
