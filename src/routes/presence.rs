use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::AppResult;
use crate::models::PresenceStatus;
use crate::services::presence::PresenceView;
use crate::state::AppState;

#[derive(Serialize)]
pub struct OnlineUsersResponse {
    pub workspace_id: Uuid,
    pub user_ids: Vec<Uuid>,
}

#[derive(Deserialize)]
pub struct SetStatusRequest {
    pub status: PresenceStatus,
}

/// Users connected to this instance. Other instances are not consulted.
pub async fn list_online(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Path(workspace_id): Path<Uuid>,
) -> Json<OnlineUsersResponse> {
    let user_ids = state.presence.list_online(workspace_id).await;
    Json(OnlineUsersResponse {
        workspace_id,
        user_ids,
    })
}

pub async fn set_status(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(workspace_id): Path<Uuid>,
    Json(payload): Json<SetStatusRequest>,
) -> AppResult<StatusCode> {
    state
        .presence
        .set_status(user.user_id, workspace_id, payload.status)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_user_presence(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<PresenceView>> {
    Ok(Json(state.presence.user_status(user_id).await?))
}
