//! tRPC-over-HTTP wire format.
//!
//! Queries are `GET /api/trpc/{path}?input=<json>`, mutations are
//! `POST /api/trpc/{path}` with a JSON body. Responses are
//! `{"result":{"data":...}}` or `{"error":{"message","code","data"}}`.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::auth::Caller;
use super::routes::AppState;
use super::{messages, projects, usage};
use crate::store::StoreError;
use crate::usage::UsageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrpcCode {
    ParseError,
    BadRequest,
    NotFound,
    MethodNotSupported,
    TooManyRequests,
    InternalServerError,
}

impl TrpcCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrpcCode::ParseError => "PARSE_ERROR",
            TrpcCode::BadRequest => "BAD_REQUEST",
            TrpcCode::NotFound => "NOT_FOUND",
            TrpcCode::MethodNotSupported => "METHOD_NOT_SUPPORTED",
            TrpcCode::TooManyRequests => "TOO_MANY_REQUESTS",
            TrpcCode::InternalServerError => "INTERNAL_SERVER_ERROR",
        }
    }

    /// JSON-RPC error number tRPC puts in `error.code`.
    pub fn json_rpc_code(&self) -> i32 {
        match self {
            TrpcCode::ParseError => -32700,
            TrpcCode::BadRequest => -32600,
            TrpcCode::NotFound => -32004,
            TrpcCode::MethodNotSupported => -32005,
            TrpcCode::TooManyRequests => -32029,
            TrpcCode::InternalServerError => -32603,
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            TrpcCode::ParseError | TrpcCode::BadRequest => StatusCode::BAD_REQUEST,
            TrpcCode::NotFound => StatusCode::NOT_FOUND,
            TrpcCode::MethodNotSupported => StatusCode::METHOD_NOT_ALLOWED,
            TrpcCode::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            TrpcCode::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrpcError {
    pub code: TrpcCode,
    pub message: String,
    pub path: Option<String>,
}

impl TrpcError {
    pub fn new(code: TrpcCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            path: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(TrpcCode::BadRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(TrpcCode::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(TrpcCode::InternalServerError, message)
    }

    fn at(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }
}

impl From<StoreError> for TrpcError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { entity, .. } => Self::not_found(format!("{} not found", entity)),
            other => {
                tracing::error!("Store error: {}", other);
                Self::internal("Internal server error")
            }
        }
    }
}

impl From<UsageError> for TrpcError {
    fn from(e: UsageError) -> Self {
        match e {
            UsageError::Exhausted { .. } => Self::new(TrpcCode::TooManyRequests, e.to_string()),
            UsageError::Store(store) => store.into(),
        }
    }
}

impl IntoResponse for TrpcError {
    fn into_response(self) -> Response {
        let status = self.code.http_status();
        let body = json!({
            "error": {
                "message": self.message,
                "code": self.code.json_rpc_code(),
                "data": {
                    "code": self.code.as_str(),
                    "httpStatus": status.as_u16(),
                    "path": self.path,
                }
            }
        });
        (status, Json(body)).into_response()
    }
}

pub type TrpcResult<T> = Result<T, TrpcError>;

/// Deserialize a procedure's input, accepting a superjson `{"json": ...}`
/// wrapper as well as the bare value.
pub fn parse_input<T: DeserializeOwned>(input: Value) -> TrpcResult<T> {
    let input = match input {
        Value::Object(mut map) if map.len() <= 2 && map.contains_key("json") => {
            map.remove("json").unwrap_or(Value::Null)
        }
        other => other,
    };
    serde_json::from_value(input).map_err(|e| TrpcError::bad_request(format!("Invalid input: {}", e)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Query,
    Mutation,
}

impl Kind {
    fn as_str(&self) -> &'static str {
        match self {
            Kind::Query => "query",
            Kind::Mutation => "mutation",
        }
    }
}

fn procedure_kind(path: &str) -> Option<Kind> {
    match path {
        "projects.getOne" | "projects.getMany" | "messages.getMany" | "usage.status" => {
            Some(Kind::Query)
        }
        "projects.create" | "messages.create" => Some(Kind::Mutation),
        _ => None,
    }
}

fn data<T: Serialize>(value: T) -> TrpcResult<Value> {
    serde_json::to_value(value).map_err(|e| TrpcError::internal(e.to_string()))
}

async fn dispatch(state: &AppState, caller: &Caller, path: &str, input: Value) -> TrpcResult<Value> {
    match path {
        "projects.getOne" => data(projects::get_one(state, caller, parse_input(input)?).await?),
        "projects.getMany" => data(projects::get_many(state, caller).await?),
        "projects.create" => data(projects::create(state, caller, parse_input(input)?).await?),
        "messages.getMany" => data(messages::get_many(state, caller, parse_input(input)?).await?),
        "messages.create" => data(messages::create(state, caller, parse_input(input)?).await?),
        "usage.status" => data(usage::status(state, caller).await?),
        _ => Err(TrpcError::not_found(format!("No procedure found on path \"{}\"", path))),
    }
}

async fn handle(state: &AppState, caller: &Caller, path: &str, kind: Kind, input: Value) -> Response {
    let result = match procedure_kind(path) {
        None => Err(TrpcError::not_found(format!(
            "No \"{}\"-procedure on path \"{}\"",
            kind.as_str(),
            path
        ))),
        Some(expected) if expected != kind => Err(TrpcError::new(
            TrpcCode::MethodNotSupported,
            format!("Procedure \"{}\" is a {}", path, expected.as_str()),
        )),
        Some(_) => dispatch(state, caller, path, input).await,
    };

    match result {
        Ok(data) => Json(json!({ "result": { "data": data } })).into_response(),
        Err(e) => {
            if e.code == TrpcCode::InternalServerError {
                tracing::error!(path, "tRPC procedure failed: {}", e.message);
            } else {
                tracing::debug!(path, code = e.code.as_str(), "tRPC procedure rejected: {}", e.message);
            }
            e.at(path).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct QueryParams {
    input: Option<String>,
    batch: Option<String>,
}

fn reject_batch(batch: &Option<String>, path: &str) -> Option<Response> {
    batch
        .as_ref()
        .map(|_| TrpcError::bad_request("Batch calls are not supported").at(path).into_response())
}

/// `GET /api/trpc/:path`
pub async fn query(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(path): Path<String>,
    Query(params): Query<QueryParams>,
) -> Response {
    if let Some(rejected) = reject_batch(&params.batch, &path) {
        return rejected;
    }
    let input = match params.input.as_deref() {
        None | Some("") => Value::Null,
        Some(raw) => match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                return TrpcError::new(TrpcCode::ParseError, format!("Invalid JSON input: {}", e))
                    .at(&path)
                    .into_response()
            }
        },
    };
    handle(&state, &caller, &path, Kind::Query, input).await
}

/// `POST /api/trpc/:path`
pub async fn mutation(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(path): Path<String>,
    Query(params): Query<QueryParams>,
    body: Bytes,
) -> Response {
    if let Some(rejected) = reject_batch(&params.batch, &path) {
        return rejected;
    }
    let input = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(e) => {
                return TrpcError::new(TrpcCode::ParseError, format!("Invalid JSON body: {}", e))
                    .at(&path)
                    .into_response()
            }
        }
    };
    handle(&state, &caller, &path, Kind::Mutation, input).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Input {
        id: String,
    }

    #[test]
    fn test_parse_input_unwraps_superjson() {
        let bare: Input = parse_input(json!({ "id": "a" })).unwrap();
        assert_eq!(bare.id, "a");
        let wrapped: Input = parse_input(json!({ "json": { "id": "b" }, "meta": {} })).unwrap();
        assert_eq!(wrapped.id, "b");
        let err = parse_input::<Input>(json!({ "other": 1 })).unwrap_err();
        assert_eq!(err.code, TrpcCode::BadRequest);
    }

    #[test]
    fn test_procedure_kinds() {
        assert_eq!(procedure_kind("projects.create"), Some(Kind::Mutation));
        assert_eq!(procedure_kind("usage.status"), Some(Kind::Query));
        assert_eq!(procedure_kind("projects.delete"), None);
    }

    #[test]
    fn test_usage_exhaustion_maps_to_too_many_requests() {
        let err: TrpcError = UsageError::Exhausted { ms_before_next: 10 }.into();
        assert_eq!(err.code, TrpcCode::TooManyRequests);
        assert_eq!(err.message, "You have run out of credits");
        assert_eq!(err.code.json_rpc_code(), -32029);
    }
}
