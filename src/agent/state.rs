use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Shared state the coding agent's tools and hooks write into.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    /// Final `<task_summary>` message; non-empty once the agent is done.
    pub summary: String,
    /// Every file the agent wrote, path to content.
    pub files: BTreeMap<String, String>,
}

impl AgentState {
    pub fn is_done(&self) -> bool {
        !self.summary.is_empty()
    }
}
