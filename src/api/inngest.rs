//! Durable-function webhook at `/api/inngest`.
//!
//! - `GET` lists the registered functions.
//! - `POST` accepts one event or an array of events and queues their runs.
//! - `PUT` re-queues every run that has not finished.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use super::routes::AppState;
use crate::jobs::Event;

pub async fn introspect(State(state): State<Arc<AppState>>) -> Json<Value> {
    let functions = state.jobs.functions();
    Json(json!({
        "framework": "axum",
        "functionCount": functions.len(),
        "functions": functions,
    }))
}

fn parse_events(body: Value) -> Result<Vec<Event>, String> {
    let raw = match body {
        Value::Array(items) => items,
        single => vec![single],
    };
    raw.into_iter()
        .map(|item| serde_json::from_value(item).map_err(|e| format!("Invalid event: {}", e)))
        .collect()
}

pub async fn send_events(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let events = parse_events(body).map_err(|e| (StatusCode::BAD_REQUEST, e))?;

    let mut event_ids = Vec::with_capacity(events.len());
    let mut run_ids = Vec::new();
    for event in events {
        event_ids.push(event.id);
        let runs = state
            .jobs
            .send(event)
            .await
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        run_ids.extend(runs);
    }

    Ok(Json(json!({ "ids": event_ids, "runIds": run_ids })))
}

pub async fn resync(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let count = state
        .jobs
        .resync()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({ "resynced": count })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_and_batched_events() {
        let single = parse_events(json!({ "name": "code-agent/run", "data": {} })).unwrap();
        assert_eq!(single.len(), 1);

        let batch = parse_events(json!([
            { "name": "a" },
            { "name": "b", "data": { "x": 1 } }
        ]))
        .unwrap();
        assert_eq!(batch[1].name, "b");

        assert!(parse_events(json!({ "data": {} })).is_err());
    }
}
