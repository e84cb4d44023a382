//! Uniform response envelope and error mapping
//!
//! Every response is `{ok, data|error, error_code, meta}`; the error codes
//! are part of the contract with external collaborators and never change.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tminus_core::GraphError;

#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub meta: serde_json::Value,
}

/// Wrap payload data in a success envelope
pub fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        ok: true,
        data: Some(data),
        error: None,
        error_code: None,
        meta: serde_json::json!({}),
    })
}

#[derive(Debug)]
pub enum ApiError {
    AuthRequired,
    Validation(String),
    NotFound(String),
    InvalidTransition(String),
    CommitFailed(String),
    RateLimited,
    Internal(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::AuthRequired => (
                StatusCode::UNAUTHORIZED,
                "AUTH_REQUIRED",
                "authentication required".to_string(),
            ),
            ApiError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            ApiError::InvalidTransition(msg) => {
                (StatusCode::CONFLICT, "INVALID_TRANSITION", msg.clone())
            }
            ApiError::CommitFailed(msg) => (StatusCode::CONFLICT, "COMMIT_FAILED", msg.clone()),
            ApiError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                "rate limited".to_string(),
            ),
            ApiError::Internal(msg) => {
                tracing::error!("internal error surfaced to api: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "internal error".to_string(),
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        let body = Json(Envelope::<()> {
            ok: false,
            data: None,
            error: Some(message),
            error_code: Some(code.to_string()),
            meta: serde_json::json!({}),
        });
        (status, body).into_response()
    }
}

impl From<GraphError> for ApiError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::NotFound(msg) => ApiError::NotFound(msg),
            GraphError::Validation(msg) => ApiError::Validation(msg),
            GraphError::InvalidTransition { from, to } => {
                ApiError::InvalidTransition(format!("{from} -> {to}"))
            }
            GraphError::CommitFailed(msg) => ApiError::CommitFailed(msg),
            GraphError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound("resource not found".to_string()),
            other => ApiError::Internal(format!("store error: {other}")),
        }
    }
}
