//! Canonical event endpoints

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use tminus_core::models::{
    CanonicalEvent, DeletionCertificate, EventStatus, JournalEntry, Transparency, Visibility,
};
use tminus_core::types::CanonicalId;
use tminus_graph::coordinator::{EventBriefing, EventDraft, EventPatch};
use tminus_graph::store::events::EventFilter;

use crate::AppState;
use crate::auth::AuthedUser;
use crate::error::{ApiError, Envelope, ok};
use crate::ical::event_to_ical;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/events", get(list_events).post(create_event))
        .route(
            "/events/{id}",
            get(get_event).patch(update_event).delete(delete_event),
        )
        .route("/events/{id}/journal", get(get_journal))
        .route("/events/{id}/briefing", get(get_briefing))
        .route("/events/{id}/ical", get(export_ical))
        .route("/events/{id}/allocation", post(allocate_event))
}

#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub status: Option<EventStatus>,
    pub limit: Option<i64>,
}

async fn list_events(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Query(query): Query<ListEventsQuery>,
) -> Result<Json<Envelope<Vec<CanonicalEvent>>>, ApiError> {
    let filter = EventFilter {
        from: query.from,
        to: query.to,
        status: query.status,
        include_deleted: false,
        limit: query.limit,
    };
    let events = state.graph.coordinator(user_id).list_events(&filter).await?;
    Ok(ok(events))
}

#[derive(Debug, Deserialize)]
pub struct CreateEventRequest {
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub conference_url: Option<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    #[serde(default)]
    pub all_day: bool,
    pub status: Option<EventStatus>,
    pub visibility: Option<Visibility>,
    pub transparency: Option<Transparency>,
    pub rrule: Option<String>,
    #[serde(default)]
    pub attendee_emails: Vec<String>,
}

async fn create_event(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Json(request): Json<CreateEventRequest>,
) -> Result<Json<Envelope<CanonicalEvent>>, ApiError> {
    let draft = EventDraft {
        title: request.title,
        description: request.description,
        location: request.location,
        conference_url: request.conference_url,
        start_at: request.start_at,
        end_at: request.end_at,
        all_day: request.all_day,
        status: request.status.unwrap_or(EventStatus::Confirmed),
        visibility: request.visibility.unwrap_or(Visibility::Default),
        transparency: request.transparency.unwrap_or(Transparency::Opaque),
        rrule: request.rrule,
        attendee_emails: request.attendee_emails,
    };
    let event = state
        .graph
        .coordinator(user_id)
        .create_system_event(draft)
        .await?;
    Ok(ok(event))
}

async fn get_event(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Path(id): Path<String>,
) -> Result<Json<Envelope<CanonicalEvent>>, ApiError> {
    let event = state
        .graph
        .coordinator(user_id)
        .get_event(&CanonicalId::from_string(id))
        .await?;
    Ok(ok(event))
}

#[derive(Debug, Deserialize)]
pub struct UpdateEventRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub status: Option<EventStatus>,
    pub transparency: Option<Transparency>,
}

async fn update_event(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Path(id): Path<String>,
    Json(request): Json<UpdateEventRequest>,
) -> Result<Json<Envelope<CanonicalEvent>>, ApiError> {
    let patch = EventPatch {
        title: request.title,
        description: request.description.map(Some),
        location: request.location.map(Some),
        start_at: request.start_at,
        end_at: request.end_at,
        status: request.status,
        transparency: request.transparency,
    };
    let event = state
        .graph
        .coordinator(user_id)
        .update_event(&CanonicalId::from_string(id), patch)
        .await?;
    Ok(ok(event))
}

/// Deletion tombstones the canonical row, cascades provider-side mirror
/// deletions, and returns the signed deletion certificate.
async fn delete_event(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Path(id): Path<String>,
) -> Result<Json<Envelope<DeletionCertificate>>, ApiError> {
    let certificate = state
        .graph
        .coordinator(user_id)
        .delete_event(&CanonicalId::from_string(id))
        .await?;
    Ok(ok(certificate))
}

async fn get_journal(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Path(id): Path<String>,
) -> Result<Json<Envelope<Vec<JournalEntry>>>, ApiError> {
    let id = CanonicalId::from_string(id);
    let coordinator = state.graph.coordinator(user_id);
    // Ownership check before exposing the journal
    coordinator.get_event(&id).await?;
    let journal = coordinator.journal(&id).await?;
    Ok(ok(journal))
}

async fn get_briefing(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Path(id): Path<String>,
) -> Result<Json<Envelope<EventBriefing>>, ApiError> {
    let briefing = state
        .graph
        .coordinator(user_id)
        .get_event_briefing(&CanonicalId::from_string(id))
        .await?;
    Ok(ok(briefing))
}

async fn export_ical(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let event = state
        .graph
        .coordinator(user_id)
        .get_event(&CanonicalId::from_string(id))
        .await?;
    Ok((
        [(header::CONTENT_TYPE, "text/calendar; charset=utf-8")],
        event_to_ical(&event),
    ))
}

#[derive(Debug, Deserialize)]
pub struct AllocateRequest {
    pub billing_category: String,
    pub client: String,
    pub hourly_rate: Option<f64>,
}

async fn allocate_event(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Path(id): Path<String>,
    Json(request): Json<AllocateRequest>,
) -> Result<Json<Envelope<tminus_core::models::TimeAllocation>>, ApiError> {
    let allocation = state
        .graph
        .coordinator(user_id)
        .allocate_time(
            &CanonicalId::from_string(id),
            &request.billing_category,
            &request.client,
            request.hourly_rate,
        )
        .await?;
    Ok(ok(allocation))
}
