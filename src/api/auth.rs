//! Caller identity.
//!
//! Sign-in is handled in front of this service; the caller id arrives in the
//! `X-User-Id` header. Requests without it act as `anonymous`.

use axum::{body::Body, http::Request, middleware::Next, response::Response};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const ANONYMOUS: &str = "anonymous";

/// Longest caller id accepted from the header.
const MAX_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub id: String,
}

fn caller_from_header(value: Option<&str>) -> Caller {
    let id = value
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= MAX_ID_LEN)
        .unwrap_or(ANONYMOUS);
    Caller { id: id.to_string() }
}

/// Attach a [`Caller`] extension to every request.
pub async fn identify_caller(mut req: Request<Body>, next: Next) -> Response {
    let caller = caller_from_header(
        req.headers()
            .get(USER_ID_HEADER)
            .and_then(|h| h.to_str().ok()),
    );
    req.extensions_mut().insert(caller);
    next.run(req).await
}
