//! `usage.*` procedures.

use super::auth::Caller;
use super::routes::AppState;
use super::trpc::TrpcResult;
use crate::usage::UsageStatus;

/// Remaining credits of the caller in the current window.
pub async fn status(state: &AppState, caller: &Caller) -> TrpcResult<UsageStatus> {
    Ok(state.usage.status(&caller.id).await?)
}
