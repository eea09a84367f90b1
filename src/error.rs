use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt::Display;
use thiserror::Error;
use tracing::error;

use crate::store::StoreError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized")
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn unavailable() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "service temporarily unavailable",
        )
    }

    pub fn internal<E: Display>(error: E) -> Self {
        error!(error = %error, "internal error");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
        });
        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Failures of the chat and presence core, shared by the REST surface and the
/// socket gateway.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("{0}")]
    Forbidden(String),
    #[error("user is not a participant of this chat")]
    NotParticipant,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    BadRequest(String),
    #[error("temporarily unavailable: {0}")]
    Transient(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type ChatResult<T> = Result<T, ChatError>;

impl ChatError {
    pub fn forbidden(message: impl Into<String>) -> Self {
        ChatError::Forbidden(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        ChatError::BadRequest(message.into())
    }

    /// Stable machine-readable code sent to socket clients.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Unauthenticated => "UNAUTHENTICATED",
            ChatError::Forbidden(_) => "FORBIDDEN",
            ChatError::NotParticipant => "NOT_PARTICIPANT",
            ChatError::NotFound(_) => "NOT_FOUND",
            ChatError::BadRequest(_) => "BAD_REQUEST",
            ChatError::Transient(_) => "TRANSIENT",
            ChatError::Internal(_) => "INTERNAL",
        }
    }

    /// Message safe to show to a client. Store and internal details stay in
    /// the logs.
    pub fn public_message(&self) -> String {
        match self {
            ChatError::Transient(_) => "service temporarily unavailable".to_string(),
            ChatError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<StoreError> for ChatError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Unavailable(reason) => {
                error!(%reason, "store unavailable");
                ChatError::Transient(reason)
            }
            StoreError::Backend(err) => {
                error!(error = ?err, "store operation failed");
                ChatError::Internal(err.to_string())
            }
        }
    }
}

impl From<ChatError> for AppError {
    fn from(value: ChatError) -> Self {
        match value {
            ChatError::Unauthenticated => AppError::unauthorized(),
            ChatError::Forbidden(message) => AppError::forbidden(message),
            ChatError::NotParticipant => AppError::forbidden(ChatError::NotParticipant.to_string()),
            ChatError::NotFound(what) => {
                AppError::new(StatusCode::NOT_FOUND, format!("{what} not found"))
            }
            ChatError::BadRequest(message) => AppError::bad_request(message),
            ChatError::Transient(_) => AppError::unavailable(),
            ChatError::Internal(detail) => AppError::internal(detail),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        AppError::internal(value)
    }
}
