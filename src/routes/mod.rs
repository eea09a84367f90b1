use axum::http::HeaderValue;
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, patch, post, put},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::{
    auth::AuthenticatedUser,
    gateway::session::{chat_socket, presence_socket},
    state::AppState,
};

pub mod chats;
pub mod health;
pub mod messages;
pub mod presence;

const MAX_BODY_BYTES: usize = 1024 * 1024;

pub fn create_router(state: AppState) -> Router<()> {
    let cors = if let Some(origins) = state.config.cors_allowed_origin.as_ref() {
        let headers: Vec<HeaderValue> = origins
            .split(',')
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .filter_map(|value| match value.parse::<HeaderValue>() {
                Ok(header) => Some(header),
                Err(_) => {
                    warn!(origin = value, "ignoring invalid CORS allowed origin");
                    None
                }
            })
            .collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(headers))
            .allow_methods(tower_http::cors::AllowMethods::mirror_request())
            .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
            .allow_credentials(true)
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_methods(tower_http::cors::AllowMethods::mirror_request())
            .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
            .allow_credentials(true)
    };

    let chats_routes = Router::new()
        .route("/", get(chats::list_chats).post(chats::create_chat))
        .route("/:id", get(chats::get_chat))
        .route("/:id/participants", post(chats::add_participant))
        .route(
            "/:id/participants/:user_id",
            delete(chats::remove_participant),
        )
        .route(
            "/:id/messages",
            get(messages::list_messages).post(messages::create_message),
        )
        .route(
            "/:id/messages/:message_id",
            patch(messages::update_message).delete(messages::delete_message),
        )
        .route("/:id/read", post(chats::mark_chat_read))
        .route("/:id/unread-count", get(chats::unread_count));

    let messages_routes = Router::new().route("/:id/read", post(messages::mark_message_read));

    let presence_routes = Router::new()
        .route("/:workspace_id/online", get(presence::list_online))
        .route("/:workspace_id/status", put(presence::set_status))
        .route("/users/:user_id", get(presence::get_user_presence));

    // Sockets carry their token in the query string and authenticate after
    // the upgrade.
    let socket_routes = Router::new()
        .route("/ws/chat/:workspace_id", get(chat_socket))
        .route("/ws/presence/:workspace_id", get(presence_socket));

    let protected_state = state.clone();
    let protected_routes = Router::new()
        .nest("/api/chats", chats_routes)
        .nest("/api/messages", messages_routes)
        .nest("/api/presence", presence_routes)
        .layer(middleware::from_extractor_with_state::<AuthenticatedUser, _>(protected_state));

    Router::new()
        .merge(socket_routes)
        .merge(protected_routes)
        .route("/api/health", get(health::health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
}
