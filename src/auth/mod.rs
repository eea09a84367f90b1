pub mod jwt;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::TypedHeader;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{AppError, ChatError, ChatResult},
    state::AppState,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub name: String,
}

impl AppState {
    /// Validates a bearer token and returns the user it was issued to.
    pub fn authenticate(&self, token: &str) -> ChatResult<AuthenticatedUser> {
        let claims = self
            .jwt
            .verify_token(token)
            .map_err(|_| ChatError::Unauthenticated)?;
        Ok(AuthenticatedUser {
            user_id: claims.sub,
            name: claims.name,
        })
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::unauthorized())?;

        state
            .authenticate(bearer.token())
            .map_err(|_| AppError::unauthorized())
    }
}
