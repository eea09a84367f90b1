use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::AppResult;
use crate::models::{Chat, ChatType, Participant};
use crate::services::messages::{ChatDetail, ChatDraft};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateChatRequest {
    pub workspace_id: Uuid,
    pub project_id: Option<Uuid>,
    pub chat_type: ChatType,
    pub name: Option<String>,
    #[serde(default)]
    pub participant_ids: Vec<Uuid>,
}

#[derive(Deserialize)]
pub struct ChatListQuery {
    pub workspace_id: Uuid,
}

#[derive(Deserialize)]
pub struct AddParticipantRequest {
    pub user_id: Uuid,
}

#[derive(Serialize)]
pub struct UnreadCountResponse {
    pub chat_id: Uuid,
    pub unread_count: i64,
}

pub async fn create_chat(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateChatRequest>,
) -> AppResult<(StatusCode, Json<Chat>)> {
    let chat = state
        .messages
        .create_chat(
            user.user_id,
            ChatDraft {
                workspace_id: payload.workspace_id,
                project_id: payload.project_id,
                chat_type: payload.chat_type,
                name: payload.name,
                participant_ids: payload.participant_ids,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(chat)))
}

pub async fn list_chats(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<ChatListQuery>,
) -> AppResult<Json<Vec<Chat>>> {
    let chats = state
        .messages
        .list_chats(query.workspace_id, user.user_id)
        .await?;
    Ok(Json(chats))
}

pub async fn get_chat(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(chat_id): Path<Uuid>,
) -> AppResult<Json<ChatDetail>> {
    Ok(Json(state.messages.get_chat(chat_id, user.user_id).await?))
}

pub async fn add_participant(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(chat_id): Path<Uuid>,
    Json(payload): Json<AddParticipantRequest>,
) -> AppResult<(StatusCode, Json<Participant>)> {
    let participant = state
        .messages
        .add_participant(user.user_id, chat_id, payload.user_id)
        .await?;
    Ok((StatusCode::CREATED, Json(participant)))
}

pub async fn remove_participant(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((chat_id, user_id)): Path<(Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    state
        .messages
        .remove_participant(user.user_id, chat_id, user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Marks everything in the chat up to now as read.
pub async fn mark_chat_read(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(chat_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    state
        .messages
        .update_last_read(chat_id, user.user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn unread_count(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(chat_id): Path<Uuid>,
) -> AppResult<Json<UnreadCountResponse>> {
    let unread_count = state.messages.unread_count(chat_id, user.user_id).await?;
    Ok(Json(UnreadCountResponse {
        chat_id,
        unread_count,
    }))
}
