use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::AppResult;
use crate::models::{Message, MessageType};
use crate::services::messages::{MessageDraft, PageRequest};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct MessageListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    /// Unix timestamp in milliseconds.
    pub after: Option<i64>,
}

#[derive(Deserialize)]
pub struct CreateMessageRequest {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
}

#[derive(Deserialize)]
pub struct UpdateMessageRequest {
    pub content: String,
}

#[derive(Serialize)]
pub struct ReadResponse {
    pub message_id: Uuid,
    pub newly_read: bool,
}

pub async fn list_messages(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(chat_id): Path<Uuid>,
    Query(query): Query<MessageListQuery>,
) -> AppResult<Json<Vec<Message>>> {
    let messages = state
        .messages
        .list_messages(
            chat_id,
            user.user_id,
            PageRequest {
                limit: query.limit,
                offset: query.offset,
                after: query.after,
            },
        )
        .await?;
    Ok(Json(messages))
}

pub async fn create_message(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(chat_id): Path<Uuid>,
    Json(payload): Json<CreateMessageRequest>,
) -> AppResult<(StatusCode, Json<Message>)> {
    let message = state
        .messages
        .create_message(
            chat_id,
            user.user_id,
            MessageDraft {
                content: payload.content,
                message_type: payload.message_type,
                file_url: payload.file_url,
                file_name: payload.file_name,
                file_size: payload.file_size,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn update_message(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((chat_id, message_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<UpdateMessageRequest>,
) -> AppResult<Json<Message>> {
    let message = state
        .messages
        .update_message(user.user_id, chat_id, message_id, payload.content)
        .await?;
    Ok(Json(message))
}

pub async fn delete_message(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((chat_id, message_id)): Path<(Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    state
        .messages
        .delete_message(user.user_id, chat_id, message_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn mark_message_read(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(message_id): Path<Uuid>,
) -> AppResult<Json<ReadResponse>> {
    let newly_read = state.messages.mark_read(message_id, user.user_id).await?;
    Ok(Json(ReadResponse {
        message_id,
        newly_read,
    }))
}
