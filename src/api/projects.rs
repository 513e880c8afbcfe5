//! `projects.*` procedures.

use rand::seq::SliceRandom;
use serde::Deserialize;
use uuid::Uuid;

use super::auth::Caller;
use super::routes::AppState;
use super::trpc::{TrpcError, TrpcResult};
use super::validate_value;
use crate::code_agent::CodeAgentEvent;
use crate::store::{MessageRole, MessageType, NewMessage, Project};

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brave", "bright", "calm", "clever", "cosmic", "crisp", "curious", "eager",
    "fancy", "gentle", "golden", "happy", "humble", "jolly", "keen", "lively", "lucky", "mellow",
    "misty", "nimble", "quiet", "rapid", "shiny", "silent", "snowy", "sunny", "swift", "witty",
];

const NOUNS: &[&str] = &[
    "badger", "breeze", "canyon", "comet", "coral", "falcon", "forest", "galaxy", "harbor",
    "island", "lantern", "maple", "meadow", "nebula", "ocean", "otter", "panda", "pebble",
    "phoenix", "planet", "river", "rocket", "sparrow", "summit", "thunder", "tiger", "valley",
    "violet", "willow", "zephyr",
];

/// Random two-word kebab-case project name.
pub fn generate_slug() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("new");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("project");
    format!("{}-{}", adjective, noun)
}

#[derive(Debug, Deserialize)]
pub struct GetOneInput {
    pub id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct CreateInput {
    pub value: String,
}

pub async fn get_one(state: &AppState, caller: &Caller, input: GetOneInput) -> TrpcResult<Project> {
    state
        .store
        .get_project(&caller.id, input.id)
        .await?
        .ok_or_else(|| TrpcError::not_found("Project not found"))
}

pub async fn get_many(state: &AppState, caller: &Caller) -> TrpcResult<Vec<Project>> {
    Ok(state.store.list_projects(&caller.id).await?)
}

/// Start a new project from a first request and kick off generation.
pub async fn create(state: &AppState, caller: &Caller, input: CreateInput) -> TrpcResult<Project> {
    let value = validate_value(&input.value)?;
    state.usage.consume(&caller.id).await?;

    let project = state
        .store
        .create_project(&caller.id, &generate_slug())
        .await?;
    state
        .store
        .create_message(NewMessage {
            project_id: project.id,
            content: value.to_string(),
            role: MessageRole::User,
            message_type: MessageType::Result,
            fragment: None,
        })
        .await?;

    super::send_code_agent_event(
        state,
        CodeAgentEvent {
            value: value.to_string(),
            project_id: project.id,
        },
    )
    .await?;

    tracing::info!(project_id = %project.id, name = %project.name, user = %caller.id, "Created project");
    Ok(project)
}
