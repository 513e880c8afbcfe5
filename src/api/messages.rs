//! `messages.*` procedures.

use serde::Deserialize;
use uuid::Uuid;

use super::auth::Caller;
use super::routes::AppState;
use super::trpc::{TrpcError, TrpcResult};
use super::validate_value;
use crate::code_agent::CodeAgentEvent;
use crate::store::{Message, MessageRole, MessageType, NewMessage};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetManyInput {
    pub project_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInput {
    pub value: String,
    pub project_id: Uuid,
}

async fn ensure_owned(state: &AppState, caller: &Caller, project_id: Uuid) -> TrpcResult<()> {
    state
        .store
        .get_project(&caller.id, project_id)
        .await?
        .map(|_| ())
        .ok_or_else(|| TrpcError::not_found("Project not found"))
}

/// Messages of a project with their fragments, oldest first.
pub async fn get_many(state: &AppState, caller: &Caller, input: GetManyInput) -> TrpcResult<Vec<Message>> {
    ensure_owned(state, caller, input.project_id).await?;
    Ok(state.store.list_messages(input.project_id).await?)
}

/// Follow-up request on an existing project.
pub async fn create(state: &AppState, caller: &Caller, input: CreateInput) -> TrpcResult<Message> {
    let value = validate_value(&input.value)?;
    ensure_owned(state, caller, input.project_id).await?;
    state.usage.consume(&caller.id).await?;

    let message = state
        .store
        .create_message(NewMessage {
            project_id: input.project_id,
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
            project_id: input.project_id,
        },
    )
    .await?;

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::projects;
    use crate::api::test_state;
    use crate::api::trpc::TrpcCode;

    #[tokio::test]
    async fn test_follow_up_is_listed_after_first_message() {
        let state = test_state();
        let alice = Caller { id: "alice".to_string() };
        let project = projects::create(
            &state,
            &alice,
            projects::CreateInput { value: "a weather app".to_string() },
        )
        .await
        .unwrap();

        let message = create(
            &state,
            &alice,
            CreateInput {
                value: "make it dark".to_string(),
                project_id: project.id,
            },
        )
        .await
        .unwrap();
        assert_eq!(message.role, MessageRole::User);
        assert!(message.fragment.is_none());

        let listed = get_many(&state, &alice, GetManyInput { project_id: project.id })
            .await
            .unwrap();
        let contents: Vec<&str> = listed.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["a weather app", "make it dark"]);
    }

    #[tokio::test]
    async fn test_other_callers_cannot_read_or_post() {
        let state = test_state();
        let alice = Caller { id: "alice".to_string() };
        let mallory = Caller { id: "mallory".to_string() };
        let project = projects::create(&state, &alice, projects::CreateInput { value: "shop".to_string() })
            .await
            .unwrap();

        let err = get_many(&state, &mallory, GetManyInput { project_id: project.id })
            .await
            .unwrap_err();
        assert_eq!(err.code, TrpcCode::NotFound);

        let err = create(
            &state,
            &mallory,
            CreateInput {
                value: "hijack".to_string(),
                project_id: project.id,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, TrpcCode::NotFound);
        assert_eq!(state.usage.status("mallory").await.unwrap().consumed_points, 0);
    }

    #[tokio::test]
    async fn test_value_too_long_is_rejected() {
        let state = test_state();
        let err = create(
            &state,
            &Caller { id: "alice".to_string() },
            CreateInput {
                value: "x".repeat(10_001),
                project_id: Uuid::new_v4(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, TrpcCode::BadRequest);
        assert_eq!(err.message, "Value is too long");
    }
}
