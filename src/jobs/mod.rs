//! Durable background functions.
//!
//! An [`Event`] sent to the [`JobQueue`] creates one persisted run for every
//! registered [`JobFunction`] whose trigger matches the event name. Runs are
//! retried as a whole; [`StepContext`] makes the retry cheap by replaying
//! completed steps.

mod queue;
mod step;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use queue::{FunctionInfo, JobQueue, QueueOptions};
pub use step::StepContext;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default = "Utc::now")]
    pub ts: DateTime<Utc>,
}

impl Event {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            data,
            ts: Utc::now(),
        }
    }
}

#[async_trait]
pub trait JobFunction: Send + Sync {
    fn id(&self) -> &str;

    /// Event name that starts this function.
    fn trigger(&self) -> &str;

    /// Execute the function body. Called again from the top on every retry.
    async fn run(&self, event: &Event, step: &StepContext) -> anyhow::Result<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_defaults_when_deserialized() {
        let event: Event =
            serde_json::from_str(r#"{"name":"code-agent/run","data":{"value":"hi"}}"#).unwrap();
        assert_eq!(event.name, "code-agent/run");
        assert_eq!(event.data["value"], "hi");
        assert!(!event.id.is_nil());
    }
}
