//! HTTP API: tRPC procedures, the job webhook and a few plain routes.

mod auth;
mod inngest;
mod messages;
mod projects;
mod routes;
mod trpc;
mod usage;

pub use auth::{Caller, ANONYMOUS, USER_ID_HEADER};
pub use projects::generate_slug;
pub use routes::{router, serve, AppState};
pub use trpc::{TrpcCode, TrpcError};

use crate::code_agent::{CodeAgentEvent, EVENT_NAME};
use crate::jobs::Event;
use trpc::TrpcResult;

/// Longest request text accepted, in characters.
pub const MAX_VALUE_CHARS: usize = 10_000;

/// Validate a request text and return it trimmed.
fn validate_value(value: &str) -> TrpcResult<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(TrpcError::bad_request("Value is required"));
    }
    if trimmed.chars().count() > MAX_VALUE_CHARS {
        return Err(TrpcError::bad_request("Value is too long"));
    }
    Ok(trimmed)
}

async fn send_code_agent_event(state: &AppState, event: CodeAgentEvent) -> TrpcResult<()> {
    let data = serde_json::to_value(&event).map_err(|e| TrpcError::internal(e.to_string()))?;
    let runs = state.jobs.send(Event::new(EVENT_NAME, data)).await?;
    tracing::debug!(project_id = %event.project_id, runs = runs.len(), "Sent code agent event");
    Ok(())
}

/// State over an in-memory store and a queue with no functions.
#[cfg(test)]
pub(crate) fn test_state() -> AppState {
    test_state_with(Vec::new())
}

#[cfg(test)]
pub(crate) fn test_state_with(
    functions: Vec<std::sync::Arc<dyn crate::jobs::JobFunction>>,
) -> AppState {
    use crate::config::Config;
    use crate::jobs::{JobQueue, QueueOptions};
    use crate::store::Store;

    let store = Store::open_in_memory().unwrap();
    let jobs = JobQueue::start(store.clone(), functions, QueueOptions::default());
    AppState::new(Config::default(), store, jobs)
}
