//! Group scheduling session endpoints

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tminus_core::models::{SchedulingSession, SessionCandidate};
use tminus_core::types::{AccountId, CandidateId, SessionId, UserId};
use tminus_scheduler::{SessionRequest, SessionView};

use crate::AppState;
use crate::auth::AuthedUser;
use crate::error::{ApiError, Envelope, ok};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sessions", post(start_session))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/commit", post(commit_session))
        .route("/sessions/{id}/cancel", post(cancel_session))
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session: SchedulingSession,
    pub candidates: Vec<SessionCandidate>,
}

impl From<SessionView> for SessionResponse {
    fn from(view: SessionView) -> Self {
        SessionResponse {
            session: view.session,
            candidates: view.candidates,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    pub title: String,
    pub participants: Vec<UserId>,
    pub duration_minutes: i64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    #[serde(default)]
    pub required_account_ids: Vec<AccountId>,
}

async fn start_session(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Json(request): Json<StartSessionRequest>,
) -> Result<Json<Envelope<SessionResponse>>, ApiError> {
    let mut participants = request.participants;
    if !participants.contains(&user_id) {
        participants.push(user_id);
    }

    let view = state
        .scheduler
        .create_session(SessionRequest {
            creator: user_id,
            participants,
            title: request.title,
            duration_minutes: request.duration_minutes,
            window_start: request.window_start,
            window_end: request.window_end,
            required_account_ids: request.required_account_ids,
        })
        .await?;
    Ok(ok(view.into()))
}

async fn get_session(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Path(id): Path<SessionId>,
) -> Result<Json<Envelope<SessionResponse>>, ApiError> {
    let view = state.scheduler.get_session(id, user_id).await?;
    Ok(ok(view.into()))
}

#[derive(Debug, Deserialize)]
pub struct CommitSessionRequest {
    pub candidate_id: CandidateId,
}

async fn commit_session(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Path(id): Path<SessionId>,
    Json(request): Json<CommitSessionRequest>,
) -> Result<Json<Envelope<SessionResponse>>, ApiError> {
    let view = state
        .scheduler
        .commit_session(id, user_id, request.candidate_id)
        .await?;
    Ok(ok(view.into()))
}

async fn cancel_session(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Path(id): Path<SessionId>,
) -> Result<Json<Envelope<SessionResponse>>, ApiError> {
    let view = state.scheduler.cancel_session(id, user_id).await?;
    Ok(ok(view.into()))
}
