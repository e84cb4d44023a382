//! Projection Compiler
//!
//! Pure function from (canonical event, policy edge) to the payload written
//! into a target account, plus a content hash and an idempotency key. Same
//! inputs always produce a byte-equivalent payload and identical hashes;
//! the write pipeline relies on this to skip no-op writes and to retry
//! safely.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{
    CalendarKind, CanonicalEvent, DetailLevel, EventStatus, MirrorTags, PolicyEdge, Transparency,
};
use crate::security::{canonical_json_hash, format_instant_ms, keyed_digest};

/// Provider operation a projection is compiled for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOp {
    Create,
    Patch,
    Delete,
}

impl WriteOp {
    pub fn as_str(self) -> &'static str {
        match self {
            WriteOp::Create => "create",
            WriteOp::Patch => "patch",
            WriteOp::Delete => "delete",
        }
    }
}

/// The event body written into the target calendar.
///
/// Attendees and conference links never appear here at any detail level;
/// participant identity does not cross the projection boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorPayload {
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start_at: chrono::DateTime<chrono::Utc>,
    pub end_at: chrono::DateTime<chrono::Utc>,
    pub all_day: bool,
    pub status: EventStatus,
    pub transparency: Transparency,
    pub rrule: Option<String>,
    pub calendar_kind: CalendarKind,
    /// Private extended-property tuple; the only authoritative signal the
    /// classifier uses on the way back in.
    pub tags: MirrorTags,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub payload: MirrorPayload,
    pub content_hash: String,
    pub idempotency_key: String,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProjectionError {
    #[error("event end {end} is not after start {start}")]
    EndNotAfterStart { start: String, end: String },
}

/// Localized title for BUSY-level mirrors
fn busy_marker(locale: &str) -> &'static str {
    match locale.split(['-', '_']).next().unwrap_or("en") {
        "de" => "Beschäftigt",
        "fr" => "Occupé",
        "es" => "Ocupado",
        "pt" => "Ocupado",
        "nl" => "Bezet",
        _ => "Busy",
    }
}

/// Compile a canonical event through a policy edge.
///
/// Detail transformations are fixed:
/// - BUSY strips title/description/location and titles the mirror with a
///   localized busy marker,
/// - TITLE keeps only the title,
/// - FULL keeps title, description, location, times, all-day flag and
///   recurrence.
///
/// `mirror_remote_id` feeds the idempotency key when the mirror already
/// exists provider-side (patch/delete).
pub fn compile_projection(
    event: &CanonicalEvent,
    edge: &PolicyEdge,
    op: WriteOp,
    mirror_remote_id: Option<&str>,
    locale: &str,
) -> Result<Projection, ProjectionError> {
    if event.end_at <= event.start_at {
        return Err(ProjectionError::EndNotAfterStart {
            start: format_instant_ms(event.start_at),
            end: format_instant_ms(event.end_at),
        });
    }

    let (title, description, location, rrule) = match edge.detail_level {
        DetailLevel::Busy => (busy_marker(locale).to_string(), None, None, None),
        DetailLevel::Title => (event.title.clone(), None, None, None),
        DetailLevel::Full => (
            event.title.clone(),
            event.description.clone(),
            event.location.clone(),
            event.rrule.clone(),
        ),
    };

    let content_hash = canonical_json_hash(&serde_json::json!({
        "title": title,
        "description": description,
        "location": location,
        "start": format_instant_ms(event.start_at),
        "end": format_instant_ms(event.end_at),
        "all_day": event.all_day,
        "status": event.status,
        "transparency": event.transparency,
        "rrule": rrule,
        "detail": edge.detail_level,
        "calendar_kind": edge.calendar_kind,
    }));

    let idempotency_key = keyed_digest(&[
        event.id.as_str(),
        &event.version.to_string(),
        &edge.to_account_id.to_string(),
        &edge.id.to_string(),
        mirror_remote_id.unwrap_or("-"),
        op.as_str(),
    ]);

    Ok(Projection {
        payload: MirrorPayload {
            title,
            description,
            location,
            start_at: event.start_at,
            end_at: event.end_at,
            all_day: event.all_day,
            status: event.status,
            transparency: event.transparency,
            rrule,
            calendar_kind: edge.calendar_kind,
            tags: MirrorTags {
                canonical_id: event.id.clone(),
                owning_user_id: event.user_id,
                policy_edge_id: edge.id,
                content_hash: content_hash.clone(),
            },
        },
        content_hash,
        idempotency_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventSource, Visibility};
    use crate::types::{AccountId, CanonicalId, PolicyEdgeId, UserId};
    use chrono::{TimeZone, Utc};

    fn sample_event() -> CanonicalEvent {
        CanonicalEvent {
            id: CanonicalId::generate(),
            user_id: UserId::new(),
            source: EventSource::Provider,
            origin_account_id: Some(AccountId::new()),
            origin_remote_id: Some("remote-1".into()),
            title: "Strategy review".into(),
            description: Some("Quarterly numbers".into()),
            location: Some("Room 4".into()),
            conference_url: Some("https://meet.example.com/abc".into()),
            start_at: Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap(),
            end_at: Utc.with_ymd_and_hms(2026, 3, 2, 11, 0, 0).unwrap(),
            all_day: false,
            status: EventStatus::Confirmed,
            visibility: Visibility::Default,
            transparency: Transparency::Opaque,
            rrule: Some("FREQ=WEEKLY".into()),
            participant_hashes: vec!["aa".into(), "bb".into()],
            version: 3,
            deleted_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn edge_with(detail: DetailLevel) -> PolicyEdge {
        PolicyEdge {
            id: PolicyEdgeId::new(),
            user_id: UserId::new(),
            from_account_id: AccountId::new(),
            to_account_id: AccountId::new(),
            detail_level: detail,
            calendar_kind: CalendarKind::BusyOverlay,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_busy_strips_everything_and_localizes() {
        let event = sample_event();
        let edge = edge_with(DetailLevel::Busy);

        let projection = compile_projection(&event, &edge, WriteOp::Create, None, "en").unwrap();
        assert_eq!(projection.payload.title, "Busy");
        assert_eq!(projection.payload.description, None);
        assert_eq!(projection.payload.location, None);
        assert_eq!(projection.payload.rrule, None);
        assert_eq!(projection.payload.start_at, event.start_at);

        let german = compile_projection(&event, &edge, WriteOp::Create, None, "de-DE").unwrap();
        assert_eq!(german.payload.title, "Beschäftigt");
    }

    #[test]
    fn test_title_keeps_only_title() {
        let event = sample_event();
        let edge = edge_with(DetailLevel::Title);

        let projection = compile_projection(&event, &edge, WriteOp::Create, None, "en").unwrap();
        assert_eq!(projection.payload.title, "Strategy review");
        assert_eq!(projection.payload.description, None);
        assert_eq!(projection.payload.location, None);
    }

    #[test]
    fn test_full_keeps_body_but_never_attendees() {
        let event = sample_event();
        let edge = edge_with(DetailLevel::Full);

        let projection = compile_projection(&event, &edge, WriteOp::Create, None, "en").unwrap();
        assert_eq!(projection.payload.description.as_deref(), Some("Quarterly numbers"));
        assert_eq!(projection.payload.location.as_deref(), Some("Room 4"));
        assert_eq!(projection.payload.rrule.as_deref(), Some("FREQ=WEEKLY"));

        // No attendee or conference material anywhere in the payload
        let serialized = serde_json::to_string(&projection.payload).unwrap();
        assert!(!serialized.contains("aa"));
        assert!(!serialized.contains("meet.example.com"));
    }

    #[test]
    fn test_same_inputs_same_hash_and_key() {
        let event = sample_event();
        let edge = edge_with(DetailLevel::Busy);

        let one = compile_projection(&event, &edge, WriteOp::Create, None, "en").unwrap();
        let two = compile_projection(&event, &edge, WriteOp::Create, None, "en").unwrap();

        assert_eq!(one.content_hash, two.content_hash);
        assert_eq!(one.idempotency_key, two.idempotency_key);
        assert_eq!(one.payload, two.payload);
    }

    #[test]
    fn test_busy_hash_survives_title_edits() {
        // A BUSY projection carries no title, so retitling the canonical
        // event must not force a rewrite.
        let mut event = sample_event();
        let edge = edge_with(DetailLevel::Busy);

        let before = compile_projection(&event, &edge, WriteOp::Create, None, "en").unwrap();
        event.title = "Renamed".into();
        let after = compile_projection(&event, &edge, WriteOp::Create, None, "en").unwrap();

        assert_eq!(before.content_hash, after.content_hash);
    }

    #[test]
    fn test_key_distinguishes_op_and_mirror() {
        let event = sample_event();
        let edge = edge_with(DetailLevel::Busy);

        let create = compile_projection(&event, &edge, WriteOp::Create, None, "en").unwrap();
        let patch =
            compile_projection(&event, &edge, WriteOp::Patch, Some("m-1"), "en").unwrap();
        let delete =
            compile_projection(&event, &edge, WriteOp::Delete, Some("m-1"), "en").unwrap();

        assert_ne!(create.idempotency_key, patch.idempotency_key);
        assert_ne!(patch.idempotency_key, delete.idempotency_key);
        // Content is op-independent
        assert_eq!(create.content_hash, patch.content_hash);
    }

    #[test]
    fn test_tags_carry_the_full_tuple() {
        let event = sample_event();
        let edge = edge_with(DetailLevel::Title);

        let projection = compile_projection(&event, &edge, WriteOp::Create, None, "en").unwrap();
        let tags = &projection.payload.tags;
        assert_eq!(tags.canonical_id, event.id);
        assert_eq!(tags.owning_user_id, event.user_id);
        assert_eq!(tags.policy_edge_id, edge.id);
        assert_eq!(tags.content_hash, projection.content_hash);
    }

    #[test]
    fn test_rejects_inverted_times() {
        let mut event = sample_event();
        event.end_at = event.start_at;
        let edge = edge_with(DetailLevel::Busy);

        let err = compile_projection(&event, &edge, WriteOp::Create, None, "en").unwrap_err();
        assert!(matches!(err, ProjectionError::EndNotAfterStart { .. }));
    }
}
