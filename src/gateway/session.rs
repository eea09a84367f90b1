use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ConnectionKind, Gateway};
use crate::auth::AuthenticatedUser;
use crate::error::{ChatError, ChatResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub token: Option<String>,
}

pub async fn chat_socket(
    ws: WebSocketUpgrade,
    Path(workspace_id): Path<Uuid>,
    Query(query): Query<ConnectQuery>,
    State(state): State<AppState>,
) -> Response {
    upgrade(ws, state, workspace_id, query, ConnectionKind::Chat)
}

pub async fn presence_socket(
    ws: WebSocketUpgrade,
    Path(workspace_id): Path<Uuid>,
    Query(query): Query<ConnectQuery>,
    State(state): State<AppState>,
) -> Response {
    upgrade(ws, state, workspace_id, query, ConnectionKind::Presence)
}

/// Token problems are reported after the upgrade as a policy close so
/// browser clients can tell them apart from network failures.
fn upgrade(
    ws: WebSocketUpgrade,
    state: AppState,
    workspace_id: Uuid,
    query: ConnectQuery,
    kind: ConnectionKind,
) -> Response {
    let user = authenticate(&state, query.token.as_deref());
    let gateway = state.gateway.clone();
    let keepalive = Duration::from_secs(state.config.ws_keepalive_secs.max(1));

    ws.on_upgrade(move |socket| async move {
        match user {
            Ok(user) => run_session(socket, gateway, user, workspace_id, kind, keepalive).await,
            Err(err) => {
                debug!(%workspace_id, kind = kind.as_str(), "rejecting unauthenticated socket");
                close(socket, close_code::POLICY, err.public_message()).await;
            }
        }
    })
}

fn authenticate(state: &AppState, token: Option<&str>) -> ChatResult<AuthenticatedUser> {
    match token {
        Some(token) if !token.is_empty() => state.authenticate(token),
        _ => Err(ChatError::Unauthenticated),
    }
}

async fn close(mut socket: WebSocket, code: u16, reason: String) {
    let frame = CloseFrame {
        code,
        reason: Cow::Owned(reason),
    };
    if let Err(err) = socket.send(Message::Close(Some(frame))).await {
        debug!(error = %err, "failed to send close frame");
    }
}

async fn run_session(
    socket: WebSocket,
    gateway: Arc<Gateway>,
    user: AuthenticatedUser,
    workspace_id: Uuid,
    kind: ConnectionKind,
    keepalive: Duration,
) {
    let (connection_id, mut outbound) = match gateway.connect(&user, workspace_id, kind).await {
        Ok(registered) => registered,
        Err(err) => {
            warn!(user_id = %user.user_id, %workspace_id, error = %err, "failed to register connection");
            close(socket, close_code::ERROR, err.public_message()).await;
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(keepalive);
        ticker.tick().await;
        loop {
            tokio::select! {
                payload = outbound.recv() => {
                    let Some(payload) = payload else { break };
                    if sink.send(Message::Text(payload)).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    let reader_gateway = gateway.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => reader_gateway.handle_frame(connection_id, &text).await,
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => reader_gateway.handle_frame(connection_id, &text).await,
                    Err(_) => debug!(%connection_id, "ignoring non-utf8 binary frame"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    debug!(%connection_id, error = %err, "socket read failed");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    gateway.disconnect(connection_id).await;
}
