use std::sync::Arc;

use serde_json::Value;

use super::{Agent, AgentResult, AgentState, ToolResult};
use crate::llm::{ChatMessage, ToolCall};
use crate::tools::ToolContext;

/// Picks the next agent by name, or `None` to stop.
pub type Router = Arc<dyn Fn(&AgentState) -> Option<String> + Send + Sync>;

/// Outcome of a network run.
#[derive(Debug, Clone, Default)]
pub struct NetworkRun {
    pub state: AgentState,
    pub results: Vec<AgentResult>,
}

pub struct Network {
    pub name: String,
    agents: Vec<Agent>,
    max_iter: usize,
    router: Router,
}

impl Network {
    /// A network that keeps calling its first agent until the state has a
    /// summary.
    pub fn new(name: impl Into<String>, agents: Vec<Agent>, max_iter: usize) -> Self {
        let first = agents.first().map(|a| a.name.clone());
        Self {
            name: name.into(),
            agents,
            max_iter,
            router: Arc::new(move |state: &AgentState| {
                if state.is_done() {
                    None
                } else {
                    first.clone()
                }
            }),
        }
    }

    pub fn with_router(
        mut self,
        router: impl Fn(&AgentState) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.router = Arc::new(router);
        self
    }

    /// Drive the agents on `input` until the router stops or `max_iter`
    /// inferences have run.
    ///
    /// `history` is placed between the system prompt and `input` on every
    /// inference. Tool failures are reported back to the model as the tool's
    /// result; only inference and step storage errors abort the run.
    pub async fn run(
        &self,
        input: &str,
        history: &[ChatMessage],
        ctx: &ToolContext<'_>,
    ) -> anyhow::Result<NetworkRun> {
        let mut state = AgentState::default();
        let mut transcript: Vec<ChatMessage> = Vec::new();
        let mut results = Vec::new();

        for iteration in 0..self.max_iter {
            let Some(next) = (self.router)(&state) else {
                break;
            };
            let agent = self
                .agents
                .iter()
                .find(|a| a.name == next)
                .ok_or_else(|| anyhow::anyhow!("Network {} has no agent {}", self.name, next))?;

            tracing::debug!(network = %self.name, agent = %agent.name, iteration, "Network iteration");

            let mut messages = Vec::with_capacity(history.len() + transcript.len() + 2);
            messages.push(ChatMessage::system(&agent.system));
            messages.extend(history.iter().cloned());
            messages.push(ChatMessage::user(input));
            messages.extend(transcript.iter().cloned());

            let response = agent.infer(&messages, ctx.step).await?;
            let reply = response.to_message();
            transcript.push(reply.clone());

            let mut tool_results = Vec::new();
            for call in response.tool_calls.iter().flatten() {
                let content = execute_tool_call(agent, call, ctx, &mut state).await;
                transcript.push(ChatMessage::tool_result(&call.id, &content));
                tool_results.push(ToolResult {
                    tool_call_id: call.id.clone(),
                    name: call.function.name.clone(),
                    content,
                });
            }

            let result = AgentResult {
                agent: agent.name.clone(),
                output: vec![reply],
                tool_results,
            };
            agent.apply_hook(&result, &mut state);
            results.push(result);
        }

        if !state.is_done() {
            tracing::warn!(
                network = %self.name,
                iterations = results.len(),
                "Network stopped without a summary"
            );
        }

        Ok(NetworkRun { state, results })
    }
}

async fn execute_tool_call(
    agent: &Agent,
    call: &ToolCall,
    ctx: &ToolContext<'_>,
    state: &mut AgentState,
) -> String {
    let name = &call.function.name;
    let Some(tool) = agent.tools().get(name) else {
        tracing::warn!(agent = %agent.name, tool = %name, "Model called an unknown tool");
        return format!("Error: unknown tool '{}'", name);
    };

    let args: Value = if call.function.arguments.trim().is_empty() {
        Value::Object(Default::default())
    } else {
        match serde_json::from_str(&call.function.arguments) {
            Ok(args) => args,
            Err(e) => return format!("Error: invalid arguments for '{}': {}", name, e),
        }
    };

    match tool.execute(args, ctx, state).await {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!(agent = %agent.name, tool = %name, error = %e, "Tool call failed");
            format!("Error: {:#}", e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    use crate::agent::last_assistant_text;
    use crate::jobs::StepContext;
    use crate::llm::{ChatResponse, LlmClient, ToolDefinition};
    use crate::sandbox::{Sandbox, SandboxError, SandboxProvider};
    use crate::store::{JobRun, RunStatus, Store};

    struct NoSandboxes;

    #[async_trait]
    impl SandboxProvider for NoSandboxes {
        async fn create(&self, _template: &str, _timeout: Duration) -> Result<String, SandboxError> {
            Err(SandboxError::NotFound("none".to_string()))
        }

        async fn connect(&self, sandbox_id: &str) -> Result<Arc<dyn Sandbox>, SandboxError> {
            Err(SandboxError::NotFound(sandbox_id.to_string()))
        }
    }

    /// Answers with the system prompt it was given.
    struct EchoSystem;

    #[async_trait]
    impl LlmClient for EchoSystem {
        async fn chat_completion(
            &self,
            _model: &str,
            messages: &[ChatMessage],
            _tools: Option<&[ToolDefinition]>,
        ) -> anyhow::Result<ChatResponse> {
            Ok(ChatResponse {
                content: messages.first().and_then(|m| m.text_content()),
                tool_calls: None,
                finish_reason: Some("stop".to_string()),
                usage: None,
                model: None,
            })
        }
    }

    async fn step_context() -> StepContext {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let run = JobRun {
            id: Uuid::new_v4(),
            function_id: "f".to_string(),
            event_id: Uuid::new_v4(),
            event_name: "e".to_string(),
            event_data: Value::Null,
            status: RunStatus::Running,
            attempts: 0,
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        store.insert_run(&run).await.unwrap();
        StepContext::new(run.id, 0, store)
    }

    fn pair() -> Vec<Agent> {
        let client: Arc<dyn crate::llm::LlmClient> = Arc::new(EchoSystem);
        vec![
            Agent::new("planner", "Plan the app.", "m", client.clone()),
            Agent::new("writer", "Write the app.", "m", client),
        ]
    }

    #[tokio::test]
    async fn test_custom_router_runs_agents_in_turn() {
        let turns = AtomicUsize::new(0);
        let network = Network::new("pair", pair(), 10).with_router(move |_state: &AgentState| {
            match turns.fetch_add(1, Ordering::SeqCst) {
                0 => Some("planner".to_string()),
                1 => Some("writer".to_string()),
                _ => None,
            }
        });

        let step = step_context().await;
        let ctx = ToolContext {
            sandboxes: Arc::new(NoSandboxes),
            sandbox_id: "none".to_string(),
            step: &step,
        };
        let run = network.run("a todo app", &[], &ctx).await.unwrap();

        let order: Vec<&str> = run.results.iter().map(|r| r.agent.as_str()).collect();
        assert_eq!(order, vec!["planner", "writer"]);
        assert_eq!(
            last_assistant_text(&run.results[1]).as_deref(),
            Some("Write the app.")
        );
        assert!(!run.state.is_done());
    }

    #[tokio::test]
    async fn test_router_naming_missing_agent_fails() {
        let network = Network::new("pair", pair(), 10)
            .with_router(|_state: &AgentState| Some("reviewer".to_string()));

        let step = step_context().await;
        let ctx = ToolContext {
            sandboxes: Arc::new(NoSandboxes),
            sandbox_id: "none".to_string(),
            step: &step,
        };
        let err = network.run("a todo app", &[], &ctx).await.unwrap_err();
        assert!(err.to_string().contains("has no agent reviewer"));
    }
}
