//! Policy edge endpoints

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use tminus_core::models::{CalendarKind, DetailLevel, PolicyEdge};
use tminus_core::types::AccountId;

use crate::AppState;
use crate::auth::AuthedUser;
use crate::error::{ApiError, Envelope, ok};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/policies", get(list_policies).put(upsert_policy))
        .route("/policies/link", post(link_accounts))
}

async fn list_policies(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
) -> Result<Json<Envelope<Vec<PolicyEdge>>>, ApiError> {
    let policies = state.graph.coordinator(user_id).list_policies().await?;
    Ok(ok(policies))
}

#[derive(Debug, Deserialize)]
pub struct UpsertPolicyRequest {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub detail_level: DetailLevel,
    pub calendar_kind: CalendarKind,
}

async fn upsert_policy(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Json(request): Json<UpsertPolicyRequest>,
) -> Result<Json<Envelope<PolicyEdge>>, ApiError> {
    let edge = state
        .graph
        .coordinator(user_id)
        .upsert_policy_edge(
            request.from_account_id,
            request.to_account_id,
            request.detail_level,
            request.calendar_kind,
        )
        .await?;
    Ok(ok(edge))
}

#[derive(Debug, Deserialize)]
pub struct LinkAccountsRequest {
    pub first_account_id: AccountId,
    pub second_account_id: AccountId,
}

/// Link two accounts with the default policy: BUSY overlays both ways
async fn link_accounts(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Json(request): Json<LinkAccountsRequest>,
) -> Result<Json<Envelope<Vec<PolicyEdge>>>, ApiError> {
    let (forward, backward) = state
        .graph
        .coordinator(user_id)
        .link_accounts(request.first_account_id, request.second_account_id)
        .await?;
    Ok(ok(vec![forward, backward]))
}
