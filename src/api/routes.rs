//! HTTP route handlers.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::middleware;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::get,
    Extension, Router,
};
use futures::stream::Stream;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::auth::{self, Caller};
use super::inngest;
use super::trpc;
use crate::code_agent::CodeAgentFunction;
use crate::config::Config;
use crate::jobs::{JobFunction, JobQueue, QueueOptions};
use crate::store::{Message, Store};
use crate::usage::UsageTracker;

/// How often the project stream checks for new messages.
const STREAM_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub store: Store,
    pub usage: UsageTracker,
    pub jobs: JobQueue,
}

impl AppState {
    pub fn new(config: Config, store: Store, jobs: JobQueue) -> Self {
        let usage = UsageTracker::new(store.clone(), &config.usage);
        Self {
            config,
            store,
            usage,
            jobs,
        }
    }
}

/// All routes, with the caller middleware, CORS and request tracing.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/api/trpc/:path", get(trpc::query).post(trpc::mutation))
        .route(
            "/api/inngest",
            get(inngest::introspect)
                .post(inngest::send_events)
                .put(inngest::resync),
        )
        .route("/api/runs/:id", get(get_run))
        .route("/api/projects/:id/stream", get(stream_project))
        .layer(middleware::from_fn(auth::identify_caller));

    Router::new()
        .route("/api/health", get(health))
        .merge(api)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server and the background job queue.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let store = Store::open(&config.database_path)?;
    tracing::info!("Database opened at {}", config.database_path.display());

    let functions: Vec<Arc<dyn JobFunction>> =
        vec![Arc::new(CodeAgentFunction::from_config(store.clone(), &config))];
    let jobs = JobQueue::start(
        store.clone(),
        functions,
        QueueOptions::from_settings(&config.agent),
    );

    // Runs interrupted by a previous shutdown pick up where their steps left off.
    let requeued = jobs.resync().await?;
    if requeued > 0 {
        tracing::info!("Resumed {} unfinished runs", requeued);
    }

    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState::new(config, store, jobs));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received; queued runs resume on next start");
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "functions": state.jobs.functions().len(),
    }))
}

/// Status of one background run.
async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<crate::store::JobRun>, (StatusCode, String)> {
    state
        .store
        .get_run(id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Run {} not found", id)))
}

/// Changes whenever a message is added or a fragment is attached.
fn list_signature(messages: &[Message]) -> (usize, Option<Uuid>, bool) {
    let last = messages.last();
    (
        messages.len(),
        last.map(|m| m.id),
        last.map(|m| m.fragment.is_some()).unwrap_or(false),
    )
}

/// Server-sent `messages` events carrying the full message list of a
/// project, sent on connect and whenever the list changes.
async fn stream_project(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    let owned = state
        .store
        .get_project(&caller.id, id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    if owned.is_none() {
        return Err((StatusCode::NOT_FOUND, format!("Project {} not found", id)));
    }

    let stream = async_stream::stream! {
        let mut last_signature = None;

        loop {
            let messages = match state.store.list_messages(id).await {
                Ok(messages) => messages,
                Err(e) => {
                    tracing::warn!(project_id = %id, "Project stream stopped: {}", e);
                    break;
                }
            };

            let signature = list_signature(&messages);
            if last_signature.as_ref() != Some(&signature) {
                match Event::default().event("messages").json_data(&messages) {
                    Ok(event) => yield Ok(event),
                    Err(e) => {
                        tracing::warn!(project_id = %id, "Failed to encode messages: {}", e);
                        break;
                    }
                }
                last_signature = Some(signature);
            }

            tokio::time::sleep(STREAM_POLL_INTERVAL).await;
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
