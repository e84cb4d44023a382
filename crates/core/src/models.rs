//! Core domain models for T-Minus
//!
//! These models represent the core business entities and map to store
//! tables. Participant identity only ever appears as salted SHA-256 hashes;
//! plaintext attendee emails exist transiently in normalized provider
//! payloads and are hashed at ingestion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    AccountId, CandidateId, CanonicalId, HoldId, PolicyEdgeId, ProviderKind, SessionId, UserId,
};

pub use crate::projection::MirrorPayload;

/// Where a canonical event was authored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    /// Ingested from an external provider account
    Provider,
    /// Authored through our API (no external origin yet)
    System,
}

/// Event status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Confirmed,
    Tentative,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Default,
    Public,
    Private,
}

/// Whether an event contributes to busy time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Transparency {
    Opaque,
    Transparent,
}

/// How much of a canonical event a policy edge lets through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DetailLevel {
    Busy,
    Title,
    Full,
}

/// Which calendar in the target account receives mirrors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CalendarKind {
    /// Dedicated side calendar auto-provisioned in the target account
    BusyOverlay,
    PrimaryMirror,
}

/// Canonical event: the system's source-of-truth representation
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CanonicalEvent {
    pub id: CanonicalId,
    pub user_id: UserId,
    pub source: EventSource,
    pub origin_account_id: Option<AccountId>,
    pub origin_remote_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub conference_url: Option<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub all_day: bool,
    pub status: EventStatus,
    pub visibility: Visibility,
    pub transparency: Transparency,
    pub rrule: Option<String>,
    /// Salted SHA-256 participant hashes, never plaintext emails
    #[sqlx(json)]
    pub participant_hashes: Vec<String>,
    pub version: i64,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalEvent {
    /// Whether this event blocks time for availability queries
    pub fn is_busy(&self) -> bool {
        self.transparency == Transparency::Opaque
            && self.status != EventStatus::Cancelled
            && self.deleted_at.is_none()
    }
}

/// Mirror record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MirrorStatus {
    /// Projection emitted, provider write not yet confirmed
    Pending,
    Live,
    /// Write retries exhausted; drift reconciliation will repair
    Error,
    /// Canonical deleted, provider-side removal in flight
    Deleting,
}

/// One managed copy of a canonical event in a target account
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MirrorRecord {
    pub canonical_id: CanonicalId,
    pub target_account_id: AccountId,
    pub policy_edge_id: PolicyEdgeId,
    /// Resolved on first successful provider write
    pub target_calendar_id: Option<String>,
    pub remote_mirror_id: Option<String>,
    pub last_written_hash: Option<String>,
    pub detail_level: DetailLevel,
    pub status: MirrorStatus,
    pub updated_at: DateTime<Utc>,
}

/// Directional projection rule (source account -> target account)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PolicyEdge {
    pub id: PolicyEdgeId,
    pub user_id: UserId,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub detail_level: DetailLevel,
    pub calendar_kind: CalendarKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Journal change kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
    MirrorWriteFailed,
    DriftDetected,
}

/// Append-only record of one canonical mutation
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JournalEntry {
    pub seq: i64,
    pub user_id: UserId,
    pub canonical_id: CanonicalId,
    pub actor: String,
    pub change_kind: ChangeKind,
    #[sqlx(json)]
    pub patch: serde_json::Value,
    pub reason: String,
    pub idempotency_key: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Scheduling session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Open,
    CandidatesReady,
    Committed,
    Cancelled,
    Expired,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Committed | SessionState::Cancelled | SessionState::Expired
        )
    }

    /// open -> candidates_ready -> (committed | cancelled | expired).
    /// Terminal states accept nothing.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        match (self, next) {
            (SessionState::Open, SessionState::CandidatesReady) => true,
            (SessionState::Open | SessionState::CandidatesReady, s) if s.is_terminal() => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SchedulingSession {
    pub id: SessionId,
    pub user_id: UserId,
    pub state: SessionState,
    pub title: String,
    pub duration_minutes: i64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    #[sqlx(json)]
    pub participant_user_ids: Vec<UserId>,
    #[sqlx(json)]
    pub required_account_ids: Vec<AccountId>,
    pub committed_candidate_id: Option<CandidateId>,
    pub committed_event_id: Option<CanonicalId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionCandidate {
    pub id: CandidateId,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub score: f64,
    pub explanation: String,
    pub rank: i64,
}

/// Hold state machine: held -> (committed | released)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum HoldStatus {
    Held,
    Committed,
    Released,
}

impl HoldStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, HoldStatus::Committed | HoldStatus::Released)
    }

    pub fn can_transition_to(self, next: HoldStatus) -> bool {
        self == HoldStatus::Held && next.is_terminal()
    }
}

/// Tentative time reservation placed during a group scheduling session
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Hold {
    pub id: HoldId,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub account_id: AccountId,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub provider_mirror_id: Option<String>,
    pub status: HoldStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Event -> billing category/client mapping
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TimeAllocation {
    pub id: uuid::Uuid,
    pub user_id: UserId,
    pub canonical_id: CanonicalId,
    pub billing_category: String,
    pub client: String,
    pub hourly_rate: Option<f64>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Client -> target hours over a rolling window
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Commitment {
    pub id: uuid::Uuid,
    pub user_id: UserId,
    pub client: String,
    pub target_hours: f64,
    pub window_weeks: i64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceStatus {
    Compliant,
    Behind,
}

/// Rolling-window compliance evaluation for one commitment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitmentStatus {
    pub commitment_id: uuid::Uuid,
    pub client: String,
    pub target_hours: f64,
    pub actual_hours: f64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub status: ComplianceStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct VipPolicy {
    pub id: uuid::Uuid,
    pub user_id: UserId,
    pub participant_hash: String,
    pub priority_weight: f64,
    #[sqlx(json)]
    pub conditions: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Relationship graph row, keyed by participant hash
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Relationship {
    pub user_id: UserId,
    pub participant_hash: String,
    pub display_name: Option<String>,
    pub category: Option<String>,
    pub city: Option<String>,
    pub timezone: Option<String>,
    pub cadence_target_days: Option<i64>,
    pub last_interaction_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InteractionEntry {
    pub seq: i64,
    pub user_id: UserId,
    pub participant_hash: String,
    pub canonical_id: Option<CanonicalId>,
    pub kind: String,
    pub occurred_at: DateTime<Utc>,
}

/// Per-account sync health counters
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AccountHealth {
    pub account_id: AccountId,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_failure_reason: Option<String>,
    pub consecutive_failures: i64,
    pub orphan_sightings: i64,
}

/// User entity
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    /// IANA timezone (e.g. "Europe/Berlin")
    pub timezone: String,
    pub locale: String,
    /// Per-user salt for participant hashing
    pub participant_salt: String,
    pub created_at: DateTime<Utc>,
}

/// Account directory entry (global registry)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AccountRecord {
    pub account_id: AccountId,
    pub user_id: UserId,
    pub provider: ProviderKind,
    pub remote_id: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Signed proof emitted when a canonical event is deleted
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeletionCertificate {
    pub canonical_id: CanonicalId,
    pub user_id: UserId,
    pub journal_digest: String,
    pub signature: String,
    pub issued_at: DateTime<Utc>,
}

/// Event payload normalized from a provider into the canonical schema.
///
/// `attendee_emails` is the only place plaintext participant identity is
/// allowed to appear; ingestion hashes it before anything is stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub remote_id: String,
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub conference_url: Option<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub all_day: bool,
    pub status: EventStatus,
    pub transparency: Transparency,
    pub rrule: Option<String>,
    pub attendee_emails: Vec<String>,
    pub tags: Option<RawMirrorTags>,
}

/// Extended-property tags as read off the wire, before validation.
///
/// Providers can hand back partially-scrubbed tag sets (users editing
/// mirrors, third-party tools stripping keys), so every field is optional
/// here and the classifier decides what the shape means.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMirrorTags {
    pub canonical_id: Option<String>,
    pub owning_user_id: Option<String>,
    pub policy_edge_id: Option<String>,
    pub content_hash: Option<String>,
}

/// Fully-validated mirror tag tuple
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorTags {
    pub canonical_id: CanonicalId,
    pub owning_user_id: UserId,
    pub policy_edge_id: PolicyEdgeId,
    pub content_hash: String,
}

impl RawMirrorTags {
    pub fn is_empty(&self) -> bool {
        self.canonical_id.is_none()
            && self.owning_user_id.is_none()
            && self.policy_edge_id.is_none()
            && self.content_hash.is_none()
    }

    /// Parse into the validated tuple; `None` when any field is missing or
    /// malformed.
    pub fn validate(&self) -> Option<MirrorTags> {
        Some(MirrorTags {
            canonical_id: CanonicalId::from_string(self.canonical_id.clone()?),
            owning_user_id: self.owning_user_id.as_deref()?.parse().ok()?,
            policy_edge_id: self.policy_edge_id.as_deref()?.parse().ok()?,
            content_hash: self.content_hash.clone()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_state_machine() {
        use SessionState::*;

        assert!(Open.can_transition_to(CandidatesReady));
        assert!(Open.can_transition_to(Cancelled));
        assert!(CandidatesReady.can_transition_to(Committed));
        assert!(CandidatesReady.can_transition_to(Expired));

        assert!(!Committed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Open));
        assert!(!Expired.can_transition_to(CandidatesReady));
        assert!(!CandidatesReady.can_transition_to(Open));
    }

    #[test]
    fn test_hold_state_machine() {
        use HoldStatus::*;

        assert!(Held.can_transition_to(Committed));
        assert!(Held.can_transition_to(Released));
        assert!(!Committed.can_transition_to(Released));
        assert!(!Released.can_transition_to(Held));
        assert!(!Held.can_transition_to(Held));
    }

    #[test]
    fn test_raw_tags_validation() {
        let user = UserId::new();
        let edge = PolicyEdgeId::new();

        let raw = RawMirrorTags {
            canonical_id: Some("01HZX5Y7R8K9M2N3P4Q5S6T7V8".into()),
            owning_user_id: Some(user.to_string()),
            policy_edge_id: Some(edge.to_string()),
            content_hash: Some("abc123".into()),
        };

        let tags = raw.validate().expect("tags should validate");
        assert_eq!(tags.owning_user_id, user);
        assert_eq!(tags.policy_edge_id, edge);

        // Missing hash is malformed
        let partial = RawMirrorTags {
            content_hash: None,
            ..raw.clone()
        };
        assert!(partial.validate().is_none());

        // Garbage owner is malformed
        let garbage = RawMirrorTags {
            owning_user_id: Some("not-a-uuid".into()),
            ..raw
        };
        assert!(garbage.validate().is_none());
    }

    #[test]
    fn test_transparent_events_are_not_busy() {
        let event = CanonicalEvent {
            id: CanonicalId::generate(),
            user_id: UserId::new(),
            source: EventSource::Provider,
            origin_account_id: Some(AccountId::new()),
            origin_remote_id: Some("evt-1".into()),
            title: "Focus block".into(),
            description: None,
            location: None,
            conference_url: None,
            start_at: Utc::now(),
            end_at: Utc::now() + chrono::Duration::hours(1),
            all_day: false,
            status: EventStatus::Confirmed,
            visibility: Visibility::Default,
            transparency: Transparency::Transparent,
            rrule: None,
            participant_hashes: vec![],
            version: 1,
            deleted_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert!(!event.is_busy());

        let opaque = CanonicalEvent {
            transparency: Transparency::Opaque,
            ..event.clone()
        };
        assert!(opaque.is_busy());

        let cancelled = CanonicalEvent {
            transparency: Transparency::Opaque,
            status: EventStatus::Cancelled,
            ..event
        };
        assert!(!cancelled.is_busy());
    }
}
