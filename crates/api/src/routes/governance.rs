//! Governance endpoints: commitments, VIP policies, relationships

use axum::extract::{Path, Query, State};
use axum::routing::{delete, get};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tminus_core::models::{Commitment, CommitmentStatus, TimeAllocation, VipPolicy};
use tminus_core::types::CanonicalId;

use crate::AppState;
use crate::auth::AuthedUser;
use crate::error::{ApiError, Envelope, ok};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/governance/allocations", get(list_allocations))
        .route(
            "/governance/allocations/{event_id}",
            delete(release_allocation),
        )
        .route(
            "/governance/commitments",
            get(list_commitments).put(set_commitment),
        )
        .route(
            "/governance/commitments/{client}",
            delete(end_commitment),
        )
        .route(
            "/governance/commitments/{client}/status",
            get(commitment_status),
        )
        .route(
            "/governance/commitments/{client}/proof",
            get(commitment_proof),
        )
        .route("/governance/vips", get(list_vips).put(set_vip))
        .route("/governance/vips/{participant_hash}", delete(remove_vip))
}

#[derive(Debug, Deserialize)]
pub struct AllocationQuery {
    pub client: Option<String>,
}

async fn list_allocations(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Query(query): Query<AllocationQuery>,
) -> Result<Json<Envelope<Vec<TimeAllocation>>>, ApiError> {
    let allocations = state
        .graph
        .coordinator(user_id)
        .list_allocations(query.client.as_deref())
        .await?;
    Ok(ok(allocations))
}

async fn release_allocation(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Path(event_id): Path<String>,
) -> Result<Json<Envelope<bool>>, ApiError> {
    let released = state
        .graph
        .coordinator(user_id)
        .release_allocation(&CanonicalId::from_string(event_id))
        .await?;
    Ok(ok(released))
}

#[derive(Debug, Deserialize)]
pub struct SetCommitmentRequest {
    pub client: String,
    pub target_hours: f64,
    pub window_weeks: i64,
}

async fn set_commitment(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Json(request): Json<SetCommitmentRequest>,
) -> Result<Json<Envelope<Commitment>>, ApiError> {
    let commitment = state
        .graph
        .coordinator(user_id)
        .set_commitment(&request.client, request.target_hours, request.window_weeks)
        .await?;
    Ok(ok(commitment))
}

async fn list_commitments(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
) -> Result<Json<Envelope<Vec<Commitment>>>, ApiError> {
    let commitments = state.graph.coordinator(user_id).list_commitments().await?;
    Ok(ok(commitments))
}

async fn end_commitment(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Path(client): Path<String>,
) -> Result<Json<Envelope<bool>>, ApiError> {
    let ended = state
        .graph
        .coordinator(user_id)
        .end_commitment(&client)
        .await?;
    Ok(ok(ended))
}

async fn commitment_status(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Path(client): Path<String>,
) -> Result<Json<Envelope<CommitmentStatus>>, ApiError> {
    let status = state
        .graph
        .coordinator(user_id)
        .get_commitment_status(&client, None)
        .await?;
    Ok(ok(status))
}

#[derive(Debug, Deserialize)]
pub struct ProofQuery {
    pub window_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct ProofResponse {
    pub status: CommitmentStatus,
    /// Deterministic export: same window end, same bytes
    pub payload: String,
}

async fn commitment_proof(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Path(client): Path<String>,
    Query(query): Query<ProofQuery>,
) -> Result<Json<Envelope<ProofResponse>>, ApiError> {
    let window_end = query.window_end.unwrap_or_else(Utc::now);
    let (status, payload) = state
        .graph
        .coordinator(user_id)
        .get_commitment_proof_data(&client, window_end)
        .await?;
    Ok(ok(ProofResponse { status, payload }))
}

#[derive(Debug, Deserialize)]
pub struct SetVipRequest {
    pub participant_hash: String,
    pub priority_weight: f64,
    #[serde(default)]
    pub conditions: serde_json::Value,
}

async fn set_vip(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Json(request): Json<SetVipRequest>,
) -> Result<Json<Envelope<VipPolicy>>, ApiError> {
    let vip = state
        .graph
        .coordinator(user_id)
        .set_vip_policy(
            &request.participant_hash,
            request.priority_weight,
            request.conditions,
        )
        .await?;
    Ok(ok(vip))
}

async fn list_vips(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
) -> Result<Json<Envelope<Vec<VipPolicy>>>, ApiError> {
    let vips = state.graph.coordinator(user_id).list_vip_policies().await?;
    Ok(ok(vips))
}

async fn remove_vip(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Path(participant_hash): Path<String>,
) -> Result<Json<Envelope<bool>>, ApiError> {
    let removed = state
        .graph
        .coordinator(user_id)
        .remove_vip_policy(&participant_hash)
        .await?;
    Ok(ok(removed))
}
