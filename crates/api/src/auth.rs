//! Authenticated-user extraction
//!
//! Authentication itself lives in front of this service; the gateway
//! injects the verified user id as `x-tminus-user-id`. Requests arriving
//! without it get `AUTH_REQUIRED`.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use tminus_core::types::UserId;

use crate::error::ApiError;

pub const USER_HEADER: &str = "x-tminus-user-id";

#[derive(Debug, Clone, Copy)]
pub struct AuthedUser(pub UserId);

impl<S: Send + Sync> FromRequestParts<S> for AuthedUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<UserId>().ok())
            .map(AuthedUser)
            .ok_or(ApiError::AuthRequired)
    }
}
