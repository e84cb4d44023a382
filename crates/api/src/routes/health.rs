//! Health endpoints

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use tminus_core::models::AccountHealth;

use crate::AppState;
use crate::auth::AuthedUser;
use crate::error::{ApiError, Envelope, ok};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// Routes mounted under `/api`
pub fn api_routes() -> Router<AppState> {
    Router::new().route("/sync/health", get(sync_health))
}

async fn health_check() -> Json<Envelope<HealthResponse>> {
    ok(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Per-account sync health for the authenticated user: last success, last
/// failure, consecutive-failure counts.
async fn sync_health(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
) -> Result<Json<Envelope<Vec<AccountHealth>>>, ApiError> {
    let health = state.graph.coordinator(user_id).get_sync_health().await?;
    Ok(ok(health))
}
