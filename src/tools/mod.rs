//! Tools the coding agent can call inside its sandbox.
//!
//! Every tool runs its side effects inside a named job step, so a retried
//! run replays earlier tool results instead of touching the sandbox again.

mod file_ops;
mod terminal;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::agent::AgentState;
use crate::jobs::StepContext;
use crate::llm::{FunctionDefinition, ToolDefinition};
use crate::sandbox::{Sandbox, SandboxProvider};

pub use file_ops::{CreateOrUpdateFiles, ReadFiles};
pub use terminal::Terminal;

/// What a tool needs to reach the sandbox it acts on.
#[derive(Clone)]
pub struct ToolContext<'a> {
    pub sandboxes: Arc<dyn SandboxProvider>,
    pub sandbox_id: String,
    pub step: &'a StepContext,
}

impl ToolContext<'_> {
    pub async fn sandbox(&self) -> anyhow::Result<Arc<dyn Sandbox>> {
        Ok(self.sandboxes.connect(&self.sandbox_id).await?)
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the arguments object.
    fn parameters_schema(&self) -> Value;

    async fn execute(
        &self,
        args: Value,
        ctx: &ToolContext<'_>,
        state: &mut AgentState,
    ) -> anyhow::Result<String>;
}

/// Tools available to one agent, in declaration order.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The terminal and file tools, bound to whichever sandbox the
    /// [`ToolContext`] names.
    pub fn sandbox_tools() -> Self {
        Self::new()
            .with(Terminal)
            .with(CreateOrUpdateFiles)
            .with(ReadFiles)
    }

    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(Arc::new(tool));
        self
    }

    /// Register a tool, replacing any earlier tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                tool_type: "function".to_string(),
                function: FunctionDefinition {
                    name: t.name().to_string(),
                    description: t.description().to_string(),
                    parameters: t.parameters_schema(),
                },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_tools_are_ordered() {
        let registry = ToolRegistry::sandbox_tools();
        assert_eq!(
            registry.names(),
            vec!["terminal", "createOrUpdateFiles", "readFiles"]
        );

        let defs = registry.definitions();
        assert_eq!(defs[0].function.name, "terminal");
        assert_eq!(defs[1].function.parameters["required"][0], "files");
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = ToolRegistry::new().with(Terminal);
        registry.register(Arc::new(Terminal));
        assert_eq!(registry.names().len(), 1);
        assert!(registry.get("readFiles").is_none());
    }
}
