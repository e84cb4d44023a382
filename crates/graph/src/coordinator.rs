//! User Graph Coordinator
//!
//! Single-writer authority per user. Every mutation acquires the user's
//! coordinator lock, runs in one store transaction, and appends its journal
//! entry inside that transaction, so journal order is the linearization
//! order. Reads go straight to the pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use tminus_core::error::{GraphError, GraphResult};
use tminus_core::models::{
    AccountHealth, CalendarKind, CanonicalEvent, ChangeKind, Commitment, CommitmentStatus,
    ComplianceStatus, DeletionCertificate, DetailLevel, EventSource, EventStatus, Hold, HoldStatus,
    JournalEntry, MirrorPayload, MirrorRecord, MirrorStatus, MirrorTags, NormalizedEvent,
    PolicyEdge, Relationship, SchedulingSession, SessionCandidate, SessionState, TimeAllocation,
    Transparency, VipPolicy, Visibility,
};
use tminus_core::projection::{WriteOp, compile_projection};
use tminus_core::security::{
    canonical_json_hash, format_instant_ms, keyed_digest, participant_hash, sign_journal_digest,
};
use tminus_core::types::{
    AccountId, CandidateId, CanonicalId, HoldId, PolicyEdgeId, SessionId, UserId,
};

use crate::availability;
use crate::store::{events, governance, mirrors, policies, registry, sessions};
use crate::store::events::EventFilter;
use crate::tasks::{WritePurpose, WriteTask};

/// Coordinator tuning knobs
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Sessions older than this lazily expire on read
    pub session_max_age: Duration,
    /// Key for deletion-certificate signatures
    pub signing_key: Vec<u8>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            session_max_age: Duration::hours(24),
            signing_key: b"tminus-dev-signing-key".to_vec(),
        }
    }
}

/// Hands out per-user coordinators backed by one shared pool.
///
/// The per-user locks live here and are never evicted; a user's mutations
/// always contend on the same mutex for the lifetime of the process.
pub struct CoordinatorRegistry {
    pool: SqlitePool,
    config: CoordinatorConfig,
    write_tx: mpsc::Sender<WriteTask>,
    locks: StdMutex<HashMap<UserId, Arc<AsyncMutex<()>>>>,
}

impl CoordinatorRegistry {
    pub fn new(
        pool: SqlitePool,
        config: CoordinatorConfig,
        write_tx: mpsc::Sender<WriteTask>,
    ) -> Arc<Self> {
        Arc::new(CoordinatorRegistry {
            pool,
            config,
            write_tx,
            locks: StdMutex::new(HashMap::new()),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn lock_for(&self, user_id: UserId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("coordinator lock table poisoned");
        locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// A cheap handle onto one user's graph
    pub fn coordinator(&self, user_id: UserId) -> UserGraphCoordinator {
        UserGraphCoordinator {
            user_id,
            pool: self.pool.clone(),
            config: self.config.clone(),
            lock: self.lock_for(user_id),
            write_tx: self.write_tx.clone(),
        }
    }
}

/// Outcome of an ingestion upsert; `change` is `None` on a replayed payload
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub event: CanonicalEvent,
    pub change: Option<ChangeKind>,
}

/// API-authored event body (source = system)
#[derive(Debug, Clone)]
pub struct EventDraft {
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
    pub attendee_emails: Vec<String>,
}

/// Partial update for an existing event
#[derive(Debug, Clone, Default)]
pub struct EventPatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub location: Option<Option<String>>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub status: Option<EventStatus>,
    pub transparency: Option<Transparency>,
}

/// Context lookup for one event's participants
#[derive(Debug, Clone, serde::Serialize)]
pub struct EventBriefing {
    pub event_id: CanonicalId,
    pub title: String,
    pub start_at: DateTime<Utc>,
    pub participants: Vec<ParticipantBriefing>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ParticipantBriefing {
    pub participant_hash: String,
    pub display_name: Option<String>,
    pub category: Option<String>,
    pub last_interaction_at: Option<DateTime<Utc>>,
    pub priority_weight: Option<f64>,
    pub shared_event_count: i64,
}

/// Single-writer handle over one user's canonical graph
pub struct UserGraphCoordinator {
    user_id: UserId,
    pool: SqlitePool,
    config: CoordinatorConfig,
    lock: Arc<AsyncMutex<()>>,
    write_tx: mpsc::Sender<WriteTask>,
}

impl UserGraphCoordinator {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    // ------------------------------------------------------------------
    // Canonical events
    // ------------------------------------------------------------------

    /// Ingestion upsert for an origin event observed via sync.
    ///
    /// Looks up `(origin_account, origin_remote_id)`; mints a new ULID on
    /// first sight and updates in place with a version bump afterwards.
    /// Replaying an unchanged payload is a no-op: no version bump, no
    /// journal entry, no projection dispatch.
    pub async fn ingest_origin(
        &self,
        origin_account_id: AccountId,
        normalized: &NormalizedEvent,
    ) -> GraphResult<IngestOutcome> {
        validate_times(normalized.start_at, normalized.end_at)?;
        if normalized.title.trim().is_empty() {
            return Err(GraphError::Validation("event title must not be empty".into()));
        }

        let _guard = self.lock.lock().await;

        let user = registry::get_user(&self.pool, self.user_id).await?;
        let hashes = hash_participants(&normalized.attendee_emails, &user.participant_salt);
        let existing =
            events::find_by_origin(&self.pool, origin_account_id, &normalized.remote_id).await?;

        let now = Utc::now();
        let outcome = match existing {
            None => {
                let event = CanonicalEvent {
                    id: CanonicalId::generate(),
                    user_id: self.user_id,
                    source: EventSource::Provider,
                    origin_account_id: Some(origin_account_id),
                    origin_remote_id: Some(normalized.remote_id.clone()),
                    title: normalized.title.clone(),
                    description: normalized.description.clone(),
                    location: normalized.location.clone(),
                    conference_url: normalized.conference_url.clone(),
                    start_at: normalized.start_at,
                    end_at: normalized.end_at,
                    all_day: normalized.all_day,
                    status: normalized.status,
                    visibility: Visibility::Default,
                    transparency: normalized.transparency,
                    rrule: normalized.rrule.clone(),
                    participant_hashes: hashes,
                    version: 1,
                    deleted_at: None,
                    created_at: now,
                    updated_at: now,
                };

                let mut tx = self.pool.begin().await?;
                events::insert_event(&mut tx, &event).await?;
                events::append_journal(
                    &mut tx,
                    self.user_id,
                    &event.id,
                    "sync",
                    ChangeKind::Created,
                    &material_patch(&event),
                    "origin event ingested",
                    None,
                )
                .await?;
                for hash in &event.participant_hashes {
                    governance::record_interaction(
                        &mut tx,
                        self.user_id,
                        hash,
                        Some(&event.id),
                        "meeting",
                        event.start_at,
                    )
                    .await?;
                }
                tx.commit().await?;

                debug!(canonical_id = %event.id, "canonical event created");
                IngestOutcome {
                    event,
                    change: Some(ChangeKind::Created),
                }
            }
            Some(mut event) => {
                if !apply_normalized(&mut event, normalized, hashes) {
                    return Ok(IngestOutcome {
                        event,
                        change: None,
                    });
                }
                event.version += 1;
                event.updated_at = now;

                let mut tx = self.pool.begin().await?;
                events::update_event(&mut tx, &event).await?;
                events::append_journal(
                    &mut tx,
                    self.user_id,
                    &event.id,
                    "sync",
                    ChangeKind::Updated,
                    &material_patch(&event),
                    "origin event changed",
                    None,
                )
                .await?;
                tx.commit().await?;

                debug!(canonical_id = %event.id, version = event.version, "canonical event updated");
                IngestOutcome {
                    event,
                    change: Some(ChangeKind::Updated),
                }
            }
        };

        self.project_event(&outcome.event, &user.locale, false).await?;
        Ok(outcome)
    }

    /// Create a system-authored event (no external origin yet)
    pub async fn create_system_event(&self, draft: EventDraft) -> GraphResult<CanonicalEvent> {
        validate_times(draft.start_at, draft.end_at)?;
        if draft.title.trim().is_empty() {
            return Err(GraphError::Validation("event title must not be empty".into()));
        }
        if let Some(rrule) = draft.rrule.as_deref() {
            tminus_core::validate_rrule(rrule)?;
        }

        let _guard = self.lock.lock().await;
        let user = registry::get_user(&self.pool, self.user_id).await?;
        let now = Utc::now();

        let event = CanonicalEvent {
            id: CanonicalId::generate(),
            user_id: self.user_id,
            source: EventSource::System,
            origin_account_id: None,
            origin_remote_id: None,
            title: draft.title,
            description: draft.description,
            location: draft.location,
            conference_url: draft.conference_url,
            start_at: draft.start_at,
            end_at: draft.end_at,
            all_day: draft.all_day,
            status: draft.status,
            visibility: draft.visibility,
            transparency: draft.transparency,
            rrule: draft.rrule,
            participant_hashes: hash_participants(&draft.attendee_emails, &user.participant_salt),
            version: 1,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };

        let mut tx = self.pool.begin().await?;
        events::insert_event(&mut tx, &event).await?;
        events::append_journal(
            &mut tx,
            self.user_id,
            &event.id,
            "api",
            ChangeKind::Created,
            &material_patch(&event),
            "event authored via api",
            None,
        )
        .await?;
        tx.commit().await?;

        Ok(event)
    }

    /// Patch an existing event through the API
    pub async fn update_event(
        &self,
        id: &CanonicalId,
        patch: EventPatch,
    ) -> GraphResult<CanonicalEvent> {
        let _guard = self.lock.lock().await;
        let mut event = events::get_event(&self.pool, self.user_id, id).await?;
        if event.deleted_at.is_some() {
            return Err(GraphError::NotFound(format!("event {id}")));
        }

        if let Some(title) = patch.title {
            if title.trim().is_empty() {
                return Err(GraphError::Validation("event title must not be empty".into()));
            }
            event.title = title;
        }
        if let Some(description) = patch.description {
            event.description = description;
        }
        if let Some(location) = patch.location {
            event.location = location;
        }
        if let Some(start_at) = patch.start_at {
            event.start_at = start_at;
        }
        if let Some(end_at) = patch.end_at {
            event.end_at = end_at;
        }
        if let Some(status) = patch.status {
            event.status = status;
        }
        if let Some(transparency) = patch.transparency {
            event.transparency = transparency;
        }
        validate_times(event.start_at, event.end_at)?;

        event.version += 1;
        event.updated_at = Utc::now();

        let mut tx = self.pool.begin().await?;
        events::update_event(&mut tx, &event).await?;
        events::append_journal(
            &mut tx,
            self.user_id,
            &event.id,
            "api",
            ChangeKind::Updated,
            &material_patch(&event),
            "event updated via api",
            None,
        )
        .await?;
        tx.commit().await?;

        let user = registry::get_user(&self.pool, self.user_id).await?;
        self.project_event(&event, &user.locale, false).await?;
        Ok(event)
    }

    /// Tombstone an event, cascade provider-side mirror deletions, and
    /// issue a signed deletion certificate over the final journal slice.
    pub async fn delete_event(&self, id: &CanonicalId) -> GraphResult<DeletionCertificate> {
        let _guard = self.lock.lock().await;
        let event = events::get_event(&self.pool, self.user_id, id).await?;
        if event.deleted_at.is_some() {
            return Err(GraphError::NotFound(format!("event {id}")));
        }
        let mirror_rows = mirrors::list_for_event(&self.pool, id).await?;

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        events::tombstone_event(&mut tx, id, now).await?;
        events::append_journal(
            &mut tx,
            self.user_id,
            id,
            "api",
            ChangeKind::Deleted,
            &serde_json::json!({}),
            "event deleted by user",
            None,
        )
        .await?;

        for mirror in &mirror_rows {
            mirrors::set_status(
                &mut tx,
                id,
                mirror.target_account_id,
                mirror.policy_edge_id,
                MirrorStatus::Deleting,
            )
            .await?;
        }

        let slice = events::journal_for_tx(&mut tx, id).await?;
        let digest = journal_digest(&slice);
        let signature = sign_journal_digest(&digest, &self.config.signing_key)
            .map_err(|e| GraphError::Internal(e.to_string()))?;
        let certificate = DeletionCertificate {
            canonical_id: id.clone(),
            user_id: self.user_id,
            journal_digest: digest,
            signature,
            issued_at: now,
        };
        events::insert_certificate(&mut tx, &certificate).await?;
        tx.commit().await?;

        for mirror in mirror_rows {
            if let Some(remote_id) = mirror.remote_mirror_id {
                self.send_task(WriteTask {
                    user_id: self.user_id,
                    target_account_id: mirror.target_account_id,
                    canonical_id: Some(id.clone()),
                    policy_edge_id: Some(mirror.policy_edge_id),
                    calendar_kind: CalendarKind::BusyOverlay,
                    op: WriteOp::Delete,
                    purpose: WritePurpose::Mirror,
                    payload: None,
                    content_hash: String::new(),
                    idempotency_key: keyed_digest(&[
                        id.as_str(),
                        &mirror.target_account_id.to_string(),
                        &mirror.policy_edge_id.to_string(),
                        &remote_id,
                        WriteOp::Delete.as_str(),
                    ]),
                    remote_mirror_id: Some(remote_id),
                })
                .await?;
            } else {
                // Never reached the provider; drop the registry row now
                let mut tx = self.pool.begin().await?;
                mirrors::remove(&mut tx, id, mirror.target_account_id, mirror.policy_edge_id)
                    .await?;
                tx.commit().await?;
            }
        }

        info!(canonical_id = %id, "event deleted, certificate issued");
        Ok(certificate)
    }

    pub async fn get_event(&self, id: &CanonicalId) -> GraphResult<CanonicalEvent> {
        events::get_event(&self.pool, self.user_id, id).await
    }

    pub async fn list_events(&self, filter: &EventFilter) -> GraphResult<Vec<CanonicalEvent>> {
        events::list_events(&self.pool, self.user_id, filter).await
    }

    pub async fn journal(&self, id: &CanonicalId) -> GraphResult<Vec<JournalEntry>> {
        events::journal_for(&self.pool, id).await
    }

    pub async fn deletion_certificate(
        &self,
        id: &CanonicalId,
    ) -> GraphResult<Option<DeletionCertificate>> {
        events::get_certificate(&self.pool, id).await
    }

    // ------------------------------------------------------------------
    // Projection + mirrors
    // ------------------------------------------------------------------

    /// Dispatch projections for every outbound edge of the event's origin
    /// account. Unchanged content hashes are skipped unless `force`.
    pub async fn project_event(
        &self,
        event: &CanonicalEvent,
        locale: &str,
        force: bool,
    ) -> GraphResult<usize> {
        if event.deleted_at.is_some() {
            return Ok(0);
        }
        let Some(origin_account_id) = event.origin_account_id else {
            return Ok(0);
        };

        let edges = policies::list_from_account(&self.pool, origin_account_id).await?;
        let mut dispatched = 0;
        for edge in edges {
            if self.project_edge(event, &edge, locale, force).await? {
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    /// Re-project one mirror; used by drift reconciliation
    pub async fn reproject(
        &self,
        canonical_id: &CanonicalId,
        policy_edge_id: PolicyEdgeId,
        force: bool,
    ) -> GraphResult<bool> {
        let event = events::get_event(&self.pool, self.user_id, canonical_id).await?;
        if event.deleted_at.is_some() {
            return Ok(false);
        }
        let edge = policies::get(&self.pool, policy_edge_id)
            .await?
            .ok_or_else(|| GraphError::NotFound(format!("policy edge {policy_edge_id}")))?;
        let user = registry::get_user(&self.pool, self.user_id).await?;

        let _guard = self.lock.lock().await;
        self.project_edge(&event, &edge, &user.locale, force).await
    }

    async fn project_edge(
        &self,
        event: &CanonicalEvent,
        edge: &PolicyEdge,
        locale: &str,
        force: bool,
    ) -> GraphResult<bool> {
        // No self-mirroring: an event never projects back into its origin
        if Some(edge.to_account_id) == event.origin_account_id {
            return Ok(false);
        }

        // ICS targets are read-only feed sources
        let target = registry::get_account(&self.pool, edge.to_account_id).await?;
        if !target.provider.supports_writes() {
            return Ok(false);
        }

        let mirror = mirrors::get(&self.pool, &event.id, edge.to_account_id, edge.id).await?;
        let remote_id = mirror.as_ref().and_then(|m| m.remote_mirror_id.clone());
        let op = if remote_id.is_some() {
            WriteOp::Patch
        } else {
            WriteOp::Create
        };

        let projection = compile_projection(event, edge, op, remote_id.as_deref(), locale)
            .map_err(|e| GraphError::Validation(e.to_string()))?;

        if !force {
            let unchanged = mirror
                .as_ref()
                .and_then(|m| m.last_written_hash.as_deref())
                .is_some_and(|h| h == projection.content_hash);
            if unchanged {
                return Ok(false);
            }
        }

        let mut tx = self.pool.begin().await?;
        mirrors::upsert_pending(
            &mut tx,
            &event.id,
            edge.to_account_id,
            edge.id,
            edge.detail_level,
        )
        .await?;
        tx.commit().await?;

        self.send_task(WriteTask {
            user_id: self.user_id,
            target_account_id: edge.to_account_id,
            canonical_id: Some(event.id.clone()),
            policy_edge_id: Some(edge.id),
            calendar_kind: edge.calendar_kind,
            op,
            purpose: WritePurpose::Mirror,
            payload: Some(projection.payload),
            content_hash: projection.content_hash,
            idempotency_key: projection.idempotency_key,
            remote_mirror_id: remote_id,
        })
        .await?;

        Ok(true)
    }

    /// Success callback from the write pipeline.
    ///
    /// Callbacks deliberately skip the coordinator lock: dispatch can block
    /// on a full write channel while holding it, and the pipeline must be
    /// able to drain that channel. These are single-row status updates;
    /// the store serializes them.
    pub async fn mark_mirror_written(
        &self,
        canonical_id: &CanonicalId,
        target_account_id: AccountId,
        policy_edge_id: PolicyEdgeId,
        content_hash: &str,
        remote_mirror_id: &str,
        target_calendar_id: &str,
    ) -> GraphResult<()> {
        let mut tx = self.pool.begin().await?;
        mirrors::mark_written(
            &mut tx,
            canonical_id,
            target_account_id,
            policy_edge_id,
            content_hash,
            remote_mirror_id,
            target_calendar_id,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Failure callback; terminal failures are journaled, transient ones
    /// only flag the mirror for the next drift pass.
    pub async fn mark_mirror_error(
        &self,
        canonical_id: &CanonicalId,
        target_account_id: AccountId,
        policy_edge_id: PolicyEdgeId,
        reason: &str,
        terminal: bool,
    ) -> GraphResult<()> {
        let mut tx = self.pool.begin().await?;
        mirrors::set_status(
            &mut tx,
            canonical_id,
            target_account_id,
            policy_edge_id,
            MirrorStatus::Error,
        )
        .await?;
        if terminal {
            events::append_journal(
                &mut tx,
                self.user_id,
                canonical_id,
                "write-pipeline",
                ChangeKind::MirrorWriteFailed,
                &serde_json::json!({
                    "target_account_id": target_account_id,
                    "policy_edge_id": policy_edge_id,
                }),
                reason,
                None,
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Delete-confirmed callback: drop the registry row
    pub async fn mirror_removed(
        &self,
        canonical_id: &CanonicalId,
        target_account_id: AccountId,
        policy_edge_id: PolicyEdgeId,
    ) -> GraphResult<()> {
        let mut tx = self.pool.begin().await?;
        mirrors::remove(&mut tx, canonical_id, target_account_id, policy_edge_id).await?;
        tx.commit().await?;
        Ok(())
    }

    /// A managed-own event came back with an unexpected content hash
    pub async fn record_drift(
        &self,
        tags: &MirrorTags,
        target_account_id: AccountId,
        observed_hash: &str,
    ) -> GraphResult<()> {
        let _guard = self.lock.lock().await;
        let mut tx = self.pool.begin().await?;
        mirrors::set_status(
            &mut tx,
            &tags.canonical_id,
            target_account_id,
            tags.policy_edge_id,
            MirrorStatus::Error,
        )
        .await?;
        events::append_journal(
            &mut tx,
            self.user_id,
            &tags.canonical_id,
            "sync",
            ChangeKind::DriftDetected,
            &serde_json::json!({
                "target_account_id": target_account_id,
                "policy_edge_id": tags.policy_edge_id,
                "expected_hash": tags.content_hash,
                "observed_hash": observed_hash,
            }),
            "provider-side mirror drifted from last written content",
            None,
        )
        .await?;
        tx.commit().await?;

        warn!(canonical_id = %tags.canonical_id, %target_account_id, "mirror drift recorded");
        Ok(())
    }

    /// An origin event disappeared provider-side: cancel the canonical row
    /// (deletion proper stays an explicit user action).
    pub async fn origin_removed(
        &self,
        origin_account_id: AccountId,
        origin_remote_id: &str,
    ) -> GraphResult<Option<CanonicalEvent>> {
        let _guard = self.lock.lock().await;
        let Some(mut event) =
            events::find_by_origin(&self.pool, origin_account_id, origin_remote_id).await?
        else {
            return Ok(None);
        };
        if event.deleted_at.is_some() || event.status == EventStatus::Cancelled {
            return Ok(Some(event));
        }

        event.status = EventStatus::Cancelled;
        event.version += 1;
        event.updated_at = Utc::now();

        let mut tx = self.pool.begin().await?;
        events::update_event(&mut tx, &event).await?;
        events::append_journal(
            &mut tx,
            self.user_id,
            &event.id,
            "sync",
            ChangeKind::Updated,
            &material_patch(&event),
            "origin event removed provider-side",
            None,
        )
        .await?;
        tx.commit().await?;

        let user = registry::get_user(&self.pool, self.user_id).await?;
        self.project_event(&event, &user.locale, false).await?;
        Ok(Some(event))
    }

    /// One of our mirrors vanished provider-side; flag it so drift
    /// reconciliation re-projects it.
    pub async fn mirror_vanished(
        &self,
        target_account_id: AccountId,
        remote_mirror_id: &str,
    ) -> GraphResult<bool> {
        let Some(mirror) =
            mirrors::find_by_remote(&self.pool, target_account_id, remote_mirror_id).await?
        else {
            return Ok(false);
        };

        let _guard = self.lock.lock().await;
        let mut tx = self.pool.begin().await?;
        mirrors::set_status(
            &mut tx,
            &mirror.canonical_id,
            mirror.target_account_id,
            mirror.policy_edge_id,
            MirrorStatus::Error,
        )
        .await?;
        tx.commit().await?;

        warn!(
            canonical_id = %mirror.canonical_id,
            %target_account_id,
            "mirror vanished provider-side; flagged for drift repair"
        );
        Ok(true)
    }

    pub async fn list_mirrors(&self, canonical_id: &CanonicalId) -> GraphResult<Vec<MirrorRecord>> {
        mirrors::list_for_event(&self.pool, canonical_id).await
    }

    /// Re-issue the provider-side deletion for a mirror whose canonical is
    /// gone (drift repair); rows that never reached the provider drop
    /// immediately.
    pub async fn dispatch_mirror_delete(&self, mirror: &MirrorRecord) -> GraphResult<()> {
        match &mirror.remote_mirror_id {
            Some(remote_id) => {
                {
                    let _guard = self.lock.lock().await;
                    let mut tx = self.pool.begin().await?;
                    mirrors::set_status(
                        &mut tx,
                        &mirror.canonical_id,
                        mirror.target_account_id,
                        mirror.policy_edge_id,
                        MirrorStatus::Deleting,
                    )
                    .await?;
                    tx.commit().await?;
                }
                self.send_task(WriteTask {
                    user_id: self.user_id,
                    target_account_id: mirror.target_account_id,
                    canonical_id: Some(mirror.canonical_id.clone()),
                    policy_edge_id: Some(mirror.policy_edge_id),
                    calendar_kind: CalendarKind::BusyOverlay,
                    op: WriteOp::Delete,
                    purpose: WritePurpose::Mirror,
                    payload: None,
                    content_hash: String::new(),
                    idempotency_key: keyed_digest(&[
                        mirror.canonical_id.as_str(),
                        &mirror.target_account_id.to_string(),
                        &mirror.policy_edge_id.to_string(),
                        remote_id,
                        WriteOp::Delete.as_str(),
                    ]),
                    remote_mirror_id: Some(remote_id.clone()),
                })
                .await
            }
            None => {
                let _guard = self.lock.lock().await;
                let mut tx = self.pool.begin().await?;
                mirrors::remove(
                    &mut tx,
                    &mirror.canonical_id,
                    mirror.target_account_id,
                    mirror.policy_edge_id,
                )
                .await?;
                tx.commit().await?;
                Ok(())
            }
        }
    }

    /// Emit removals for released holds whose tentative mirrors still sit
    /// provider-side. Returns how many scrubs were dispatched.
    pub async fn scrub_released_holds(&self) -> GraphResult<usize> {
        let holds = sessions::terminal_holds_with_mirrors(&self.pool, self.user_id).await?;
        let count = holds.len();
        for hold in holds {
            if let Some(remote_id) = hold.provider_mirror_id.clone() {
                let task = self.hold_remove_task(&hold, remote_id);
                self.send_task(task).await?;
            }
        }
        Ok(count)
    }

    /// Full mirror registry for this user (drift walk)
    pub async fn all_mirrors(&self) -> GraphResult<Vec<MirrorRecord>> {
        mirrors::list_for_user(&self.pool, self.user_id).await
    }

    // ------------------------------------------------------------------
    // Policies + health
    // ------------------------------------------------------------------

    /// Default policy for a freshly linked account pair: BUSY overlays in
    /// both directions.
    pub async fn link_accounts(
        &self,
        first: AccountId,
        second: AccountId,
    ) -> GraphResult<(PolicyEdge, PolicyEdge)> {
        if first == second {
            return Err(GraphError::Validation("cannot link an account to itself".into()));
        }
        self.assert_owns_account(first).await?;
        self.assert_owns_account(second).await?;

        let _guard = self.lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let forward = policies::upsert_edge(
            &mut tx,
            self.user_id,
            first,
            second,
            DetailLevel::Busy,
            CalendarKind::BusyOverlay,
        )
        .await?;
        let backward = policies::upsert_edge(
            &mut tx,
            self.user_id,
            second,
            first,
            DetailLevel::Busy,
            CalendarKind::BusyOverlay,
        )
        .await?;
        tx.commit().await?;

        Ok((forward, backward))
    }

    pub async fn upsert_policy_edge(
        &self,
        from_account_id: AccountId,
        to_account_id: AccountId,
        detail_level: DetailLevel,
        calendar_kind: CalendarKind,
    ) -> GraphResult<PolicyEdge> {
        if from_account_id == to_account_id {
            return Err(GraphError::Validation(
                "policy edge source and target must differ".into(),
            ));
        }
        self.assert_owns_account(from_account_id).await?;
        self.assert_owns_account(to_account_id).await?;

        let _guard = self.lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let edge = policies::upsert_edge(
            &mut tx,
            self.user_id,
            from_account_id,
            to_account_id,
            detail_level,
            calendar_kind,
        )
        .await?;
        tx.commit().await?;
        Ok(edge)
    }

    pub async fn list_policies(&self) -> GraphResult<Vec<PolicyEdge>> {
        policies::list_for_user(&self.pool, self.user_id).await
    }

    /// Registered edge ids, the classifier's reference set
    pub async fn registered_edge_ids(&self) -> GraphResult<std::collections::HashSet<PolicyEdgeId>> {
        let edges = policies::list_for_user(&self.pool, self.user_id).await?;
        Ok(edges.into_iter().map(|e| e.id).collect())
    }

    pub async fn get_sync_health(&self) -> GraphResult<Vec<AccountHealth>> {
        registry::health_for_user(&self.pool, self.user_id).await
    }

    async fn assert_owns_account(&self, account_id: AccountId) -> GraphResult<()> {
        let account = registry::get_account(&self.pool, account_id).await?;
        if account.user_id != self.user_id {
            return Err(GraphError::NotFound(format!("account {account_id}")));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Availability
    // ------------------------------------------------------------------

    pub async fn busy_intervals(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> GraphResult<Vec<tminus_core::interval::BusyInterval>> {
        availability::busy_intervals(&self.pool, self.user_id, window_start, window_end).await
    }

    /// Privacy-preserving busy set: bare (start, end) pairs, nothing else
    /// crosses the user boundary.
    pub async fn busy_spans(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> GraphResult<Vec<(DateTime<Utc>, DateTime<Utc>)>> {
        availability::busy_spans(&self.pool, self.user_id, window_start, window_end).await
    }

    // ------------------------------------------------------------------
    // Scheduling sessions
    // ------------------------------------------------------------------

    /// Persist a session and its ranked candidates. The session row must
    /// exist before any hold referencing it is stored.
    pub async fn store_session(
        &self,
        session: &SchedulingSession,
        candidates: &[SessionCandidate],
    ) -> GraphResult<()> {
        if session.user_id != self.user_id {
            return Err(GraphError::Validation("session belongs to another user".into()));
        }

        let _guard = self.lock.lock().await;
        let mut tx = self.pool.begin().await?;
        sessions::insert_session(&mut tx, session).await?;
        sessions::insert_candidates(&mut tx, candidates).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Fetch a session, lazily expiring it when it has outlived the
    /// configured max age.
    pub async fn get_session(&self, id: SessionId) -> GraphResult<SchedulingSession> {
        let session = sessions::get_session(&self.pool, self.user_id, id).await?;
        if session.state.is_terminal()
            || session.created_at + self.config.session_max_age > Utc::now()
        {
            return Ok(session);
        }

        debug!(session_id = %id, "session outlived max age; expiring lazily");
        self.transition_session(id, SessionState::Expired).await
    }

    pub async fn list_sessions(
        &self,
        state: Option<SessionState>,
    ) -> GraphResult<Vec<SchedulingSession>> {
        sessions::list_sessions(&self.pool, self.user_id, state).await
    }

    pub async fn session_candidates(
        &self,
        session_id: SessionId,
    ) -> GraphResult<Vec<SessionCandidate>> {
        sessions::candidates_for_session(&self.pool, session_id).await
    }

    /// Mark candidates ready once the solver has produced them
    pub async fn mark_candidates_ready(&self, id: SessionId) -> GraphResult<SchedulingSession> {
        let _guard = self.lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let session = sessions::get_session_tx(&mut tx, self.user_id, id).await?;
        check_transition(session.state, SessionState::CandidatesReady)?;
        sessions::set_session_state(&mut tx, id, SessionState::CandidatesReady).await?;
        tx.commit().await?;
        sessions::get_session(&self.pool, self.user_id, id).await
    }

    /// Stage the canonical event for a commit without flipping session
    /// state; the group scheduler finalizes or rolls back afterwards.
    pub async fn write_session_event(
        &self,
        session_id: SessionId,
        candidate_id: CandidateId,
    ) -> GraphResult<CanonicalEvent> {
        let _guard = self.lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let session = sessions::get_session_tx(&mut tx, self.user_id, session_id).await?;
        if session.state.is_terminal() {
            return Err(GraphError::InvalidTransition {
                from: state_name(session.state),
                to: state_name(SessionState::Committed),
            });
        }
        let candidate = sessions::get_candidate_tx(&mut tx, session_id, candidate_id).await?;
        let event = self.stage_session_event_tx(&mut tx, &session, &candidate).await?;
        tx.commit().await?;

        Ok(event)
    }

    /// Flip a session to committed and settle its holds: the hold matching
    /// the committed slot commits, every other hold releases.
    pub async fn finalize_session_commit(
        &self,
        session_id: SessionId,
        candidate_id: CandidateId,
        event_id: &CanonicalId,
    ) -> GraphResult<SchedulingSession> {
        let _guard = self.lock.lock().await;
        let hold_tasks = {
            let mut tx = self.pool.begin().await?;
            let session = sessions::get_session_tx(&mut tx, self.user_id, session_id).await?;
            check_transition(session.state, SessionState::Committed)?;
            let candidate = sessions::get_candidate_tx(&mut tx, session_id, candidate_id).await?;
            let event = events::get_event(&self.pool, self.user_id, event_id).await?;

            sessions::set_session_committed(&mut tx, session_id, candidate_id, event_id).await?;
            let tasks = self
                .settle_holds_tx(&mut tx, session_id, &candidate, &event)
                .await?;
            tx.commit().await?;
            tasks
        };

        for task in hold_tasks {
            self.send_task(task).await?;
        }

        sessions::get_session(&self.pool, self.user_id, session_id).await
    }

    /// Session commit in one critical section: verify the session and
    /// candidate, write the canonical event, flip the session to
    /// committed, and settle holds, all in a single transaction. A
    /// concurrent cancel either lands before (the commit fails with
    /// `INVALID_TRANSITION` and nothing persists) or after (the commit
    /// already won).
    pub async fn commit_session(
        &self,
        session_id: SessionId,
        candidate_id: CandidateId,
    ) -> GraphResult<(SchedulingSession, CanonicalEvent)> {
        let _guard = self.lock.lock().await;
        let (event, hold_tasks) = {
            let mut tx = self.pool.begin().await?;
            let session = sessions::get_session_tx(&mut tx, self.user_id, session_id).await?;
            check_transition(session.state, SessionState::Committed)?;
            let candidate = sessions::get_candidate_tx(&mut tx, session_id, candidate_id).await?;

            let event = self.stage_session_event_tx(&mut tx, &session, &candidate).await?;
            sessions::set_session_committed(&mut tx, session_id, candidate_id, &event.id).await?;
            let tasks = self
                .settle_holds_tx(&mut tx, session_id, &candidate, &event)
                .await?;
            tx.commit().await?;
            (event, tasks)
        };

        for task in hold_tasks {
            self.send_task(task).await?;
        }

        let session = sessions::get_session(&self.pool, self.user_id, session_id).await?;
        Ok((session, event))
    }

    /// Insert the committed canonical event and its journal entry
    async fn stage_session_event_tx(
        &self,
        conn: &mut sqlx::SqliteConnection,
        session: &SchedulingSession,
        candidate: &SessionCandidate,
    ) -> GraphResult<CanonicalEvent> {
        let now = Utc::now();
        let event = CanonicalEvent {
            id: CanonicalId::generate(),
            user_id: self.user_id,
            source: EventSource::System,
            origin_account_id: None,
            origin_remote_id: None,
            title: session.title.clone(),
            description: None,
            location: None,
            conference_url: None,
            start_at: candidate.start_at,
            end_at: candidate.end_at,
            all_day: false,
            status: EventStatus::Confirmed,
            visibility: Visibility::Default,
            transparency: Transparency::Opaque,
            rrule: None,
            participant_hashes: vec![],
            version: 1,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        events::insert_event(&mut *conn, &event).await?;
        events::append_journal(
            &mut *conn,
            self.user_id,
            &event.id,
            "scheduler",
            ChangeKind::Created,
            &material_patch(&event),
            "scheduling session commit",
            Some(&keyed_digest(&[
                &session.id.to_string(),
                &candidate.id.to_string(),
                "commit",
            ])),
        )
        .await?;
        Ok(event)
    }

    /// Settle a committing session's holds inside the caller's
    /// transaction; returns the provider writes to dispatch after commit.
    async fn settle_holds_tx(
        &self,
        conn: &mut sqlx::SqliteConnection,
        session_id: SessionId,
        candidate: &SessionCandidate,
        event: &CanonicalEvent,
    ) -> GraphResult<Vec<WriteTask>> {
        let holds = sessions::holds_for_session_tx(&mut *conn, session_id).await?;
        let mut tasks = Vec::new();
        for hold in holds {
            if hold.status != HoldStatus::Held {
                continue;
            }
            let matches_slot =
                hold.start_at == candidate.start_at && hold.end_at == candidate.end_at;
            let next = if matches_slot {
                HoldStatus::Committed
            } else {
                HoldStatus::Released
            };
            sessions::set_hold_status(&mut *conn, hold.id, next).await?;

            if let Some(remote_id) = hold.provider_mirror_id.clone() {
                if matches_slot {
                    tasks.push(self.hold_convert_task(&hold, event, remote_id));
                } else {
                    tasks.push(self.hold_remove_task(&hold, remote_id));
                }
            }
        }
        Ok(tasks)
    }

    /// Cancel a session, releasing holds and marking tentative mirrors for
    /// deletion. Cancelling an already-cancelled session is a no-op so the
    /// group rollback path converges.
    pub async fn cancel_session(&self, id: SessionId) -> GraphResult<SchedulingSession> {
        let current = sessions::get_session(&self.pool, self.user_id, id).await?;
        if current.state == SessionState::Cancelled {
            return Ok(current);
        }
        self.transition_session(id, SessionState::Cancelled).await
    }

    /// Expire every non-terminal session older than `max_age`
    pub async fn expire_stale_sessions(&self, max_age: Duration) -> GraphResult<usize> {
        let cutoff = Utc::now() - max_age;
        let stale = sessions::stale_sessions(&self.pool, self.user_id, cutoff).await?;
        let count = stale.len();
        for session in stale {
            self.transition_session(session.id, SessionState::Expired)
                .await?;
        }
        Ok(count)
    }

    /// Terminal transition shared by cancel/expire: flips the session and
    /// releases any holds still held, emitting removal writes for their
    /// tentative mirrors.
    async fn transition_session(
        &self,
        id: SessionId,
        to: SessionState,
    ) -> GraphResult<SchedulingSession> {
        let _guard = self.lock.lock().await;
        let hold_tasks = {
            let mut tx = self.pool.begin().await?;
            let session = sessions::get_session_tx(&mut tx, self.user_id, id).await?;
            check_transition(session.state, to)?;
            sessions::set_session_state(&mut tx, id, to).await?;

            let holds = sessions::holds_for_session_tx(&mut tx, id).await?;
            let mut tasks = Vec::new();
            for hold in holds {
                if hold.status != HoldStatus::Held {
                    continue;
                }
                sessions::set_hold_status(&mut tx, hold.id, HoldStatus::Released).await?;
                if let Some(remote_id) = hold.provider_mirror_id.clone() {
                    tasks.push(self.hold_remove_task(&hold, remote_id));
                }
            }
            tx.commit().await?;
            tasks
        };

        for task in hold_tasks {
            self.send_task(task).await?;
        }

        sessions::get_session(&self.pool, self.user_id, id).await
    }

    // ------------------------------------------------------------------
    // Holds
    // ------------------------------------------------------------------

    /// Store holds for a session and emit tentative reservation writes.
    /// The session row must already exist; the store enforces it with a
    /// foreign key.
    pub async fn store_holds(&self, holds: Vec<Hold>) -> GraphResult<()> {
        for hold in &holds {
            if hold.user_id != self.user_id {
                return Err(GraphError::Validation("hold belongs to another user".into()));
            }
            validate_times(hold.start_at, hold.end_at)?;
        }

        let _guard = self.lock.lock().await;
        let mut titles: HashMap<SessionId, String> = HashMap::new();
        for hold in &holds {
            if !titles.contains_key(&hold.session_id) {
                let session =
                    sessions::get_session(&self.pool, self.user_id, hold.session_id).await?;
                titles.insert(hold.session_id, session.title);
            }
        }

        let mut tx = self.pool.begin().await?;
        sessions::insert_holds(&mut tx, &holds).await?;
        tx.commit().await?;

        for hold in &holds {
            let title = titles
                .get(&hold.session_id)
                .cloned()
                .unwrap_or_else(|| "Hold".to_string());
            let task = self.hold_place_task(hold, &title);
            self.send_task(task).await?;
        }
        Ok(())
    }

    pub async fn get_holds_by_session(&self, session_id: SessionId) -> GraphResult<Vec<Hold>> {
        sessions::holds_for_session(&self.pool, session_id).await
    }

    pub async fn update_hold_status(
        &self,
        hold_id: HoldId,
        status: HoldStatus,
    ) -> GraphResult<Hold> {
        let _guard = self.lock.lock().await;
        let hold = sessions::get_hold(&self.pool, hold_id).await?;
        if !hold.status.can_transition_to(status) {
            return Err(GraphError::InvalidTransition {
                from: hold_status_name(hold.status),
                to: hold_status_name(status),
            });
        }

        let mut tx = self.pool.begin().await?;
        sessions::set_hold_status(&mut tx, hold_id, status).await?;
        tx.commit().await?;

        if status == HoldStatus::Released {
            if let Some(remote_id) = hold.provider_mirror_id.clone() {
                let task = self.hold_remove_task(&hold, remote_id);
                self.send_task(task).await?;
            }
        }

        sessions::get_hold(&self.pool, hold_id).await
    }

    pub async fn extend_holds(
        &self,
        session_id: SessionId,
        expires_at: DateTime<Utc>,
    ) -> GraphResult<u64> {
        let _guard = self.lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let extended = sessions::extend_holds(&mut tx, session_id, expires_at).await?;
        tx.commit().await?;
        Ok(extended)
    }

    /// Settle every hold of a session:
    /// holds matching the committed slot commit, the rest release. Returns
    /// the settled set.
    pub async fn commit_session_holds(
        &self,
        session_id: SessionId,
        committed_slot: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> GraphResult<Vec<Hold>> {
        let _guard = self.lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let holds = sessions::holds_for_session_tx(&mut tx, session_id).await?;
        for hold in &holds {
            if hold.status != HoldStatus::Held {
                continue;
            }
            let next = match committed_slot {
                Some((start, end)) if hold.start_at == start && hold.end_at == end => {
                    HoldStatus::Committed
                }
                _ => HoldStatus::Released,
            };
            sessions::set_hold_status(&mut tx, hold.id, next).await?;
        }
        tx.commit().await?;

        sessions::holds_for_session(&self.pool, session_id).await
    }

    /// Release every hold of a session without committing any
    pub async fn release_session_holds(&self, session_id: SessionId) -> GraphResult<Vec<Hold>> {
        self.commit_session_holds(session_id, None).await
    }

    /// Expire a session once every one of its holds is terminal (hold GC)
    pub async fn expire_session_if_all_holds_terminal(
        &self,
        session_id: SessionId,
    ) -> GraphResult<bool> {
        let session = sessions::get_session(&self.pool, self.user_id, session_id).await?;
        if session.state.is_terminal() {
            return Ok(false);
        }
        let holds = sessions::holds_for_session(&self.pool, session_id).await?;
        if holds.is_empty() || holds.iter().any(|h| !h.status.is_terminal()) {
            return Ok(false);
        }
        self.transition_session(session_id, SessionState::Expired)
            .await?;
        Ok(true)
    }

    /// Held holds past their expiry (hold GC input)
    pub async fn get_expired_holds(&self) -> GraphResult<Vec<Hold>> {
        let holds = sessions::expired_holds(&self.pool, Utc::now()).await?;
        Ok(holds
            .into_iter()
            .filter(|h| h.user_id == self.user_id)
            .collect())
    }

    /// Released holds whose tentative mirrors still exist provider-side
    pub async fn orphaned_hold_mirrors(&self) -> GraphResult<Vec<Hold>> {
        sessions::terminal_holds_with_mirrors(&self.pool, self.user_id).await
    }

    /// Write-pipeline callback once a tentative reservation landed
    pub async fn set_hold_mirror(
        &self,
        hold_id: HoldId,
        provider_mirror_id: Option<&str>,
    ) -> GraphResult<()> {
        let mut tx = self.pool.begin().await?;
        sessions::set_hold_mirror(&mut tx, hold_id, provider_mirror_id).await?;
        tx.commit().await?;
        Ok(())
    }

    /// A provider event that is actually one of our hold reservations
    pub async fn find_hold_by_mirror(
        &self,
        account_id: AccountId,
        provider_mirror_id: &str,
    ) -> GraphResult<Option<Hold>> {
        sessions::find_hold_by_mirror(&self.pool, account_id, provider_mirror_id).await
    }

    fn hold_place_task(&self, hold: &Hold, session_title: &str) -> WriteTask {
        let payload = hold_payload(
            hold,
            &format!("Hold: {session_title}"),
            EventStatus::Tentative,
            self.user_id,
        );
        WriteTask {
            user_id: self.user_id,
            target_account_id: hold.account_id,
            canonical_id: None,
            policy_edge_id: None,
            calendar_kind: CalendarKind::PrimaryMirror,
            op: WriteOp::Create,
            purpose: WritePurpose::HoldPlace { hold_id: hold.id },
            content_hash: payload.tags.content_hash.clone(),
            idempotency_key: keyed_digest(&[&hold.id.to_string(), "place"]),
            payload: Some(payload),
            remote_mirror_id: None,
        }
    }

    fn hold_convert_task(&self, hold: &Hold, event: &CanonicalEvent, remote_id: String) -> WriteTask {
        let mut payload = hold_payload(hold, &event.title, EventStatus::Confirmed, self.user_id);
        payload.tags.canonical_id = event.id.clone();
        payload.tags.content_hash = canonical_json_hash(&serde_json::json!({
            "title": event.title,
            "start": format_instant_ms(hold.start_at),
            "end": format_instant_ms(hold.end_at),
        }));
        WriteTask {
            user_id: self.user_id,
            target_account_id: hold.account_id,
            canonical_id: Some(event.id.clone()),
            policy_edge_id: None,
            calendar_kind: CalendarKind::PrimaryMirror,
            op: WriteOp::Patch,
            purpose: WritePurpose::HoldConvert { hold_id: hold.id },
            content_hash: payload.tags.content_hash.clone(),
            idempotency_key: keyed_digest(&[&hold.id.to_string(), &remote_id, "convert"]),
            payload: Some(payload),
            remote_mirror_id: Some(remote_id),
        }
    }

    fn hold_remove_task(&self, hold: &Hold, remote_id: String) -> WriteTask {
        WriteTask {
            user_id: self.user_id,
            target_account_id: hold.account_id,
            canonical_id: None,
            policy_edge_id: None,
            calendar_kind: CalendarKind::PrimaryMirror,
            op: WriteOp::Delete,
            purpose: WritePurpose::HoldRemove { hold_id: hold.id },
            payload: None,
            content_hash: String::new(),
            idempotency_key: keyed_digest(&[&hold.id.to_string(), &remote_id, "remove"]),
            remote_mirror_id: Some(remote_id),
        }
    }

    // ------------------------------------------------------------------
    // Governance
    // ------------------------------------------------------------------

    pub async fn allocate_time(
        &self,
        canonical_id: &CanonicalId,
        billing_category: &str,
        client: &str,
        hourly_rate: Option<f64>,
    ) -> GraphResult<TimeAllocation> {
        if billing_category.trim().is_empty() || client.trim().is_empty() {
            return Err(GraphError::Validation(
                "billing category and client are required".into(),
            ));
        }
        let _guard = self.lock.lock().await;
        events::get_event(&self.pool, self.user_id, canonical_id).await?;

        let mut tx = self.pool.begin().await?;
        let allocation = governance::upsert_allocation(
            &mut tx,
            self.user_id,
            canonical_id,
            billing_category,
            client,
            hourly_rate,
        )
        .await?;
        tx.commit().await?;
        Ok(allocation)
    }

    pub async fn release_allocation(&self, canonical_id: &CanonicalId) -> GraphResult<bool> {
        let _guard = self.lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let released = governance::release_allocation(&mut tx, canonical_id).await?;
        tx.commit().await?;
        Ok(released)
    }

    pub async fn get_allocation(
        &self,
        canonical_id: &CanonicalId,
    ) -> GraphResult<Option<TimeAllocation>> {
        governance::active_allocation(&self.pool, canonical_id).await
    }

    pub async fn list_allocations(
        &self,
        client: Option<&str>,
    ) -> GraphResult<Vec<TimeAllocation>> {
        governance::list_allocations(&self.pool, self.user_id, client).await
    }

    pub async fn set_commitment(
        &self,
        client: &str,
        target_hours: f64,
        window_weeks: i64,
    ) -> GraphResult<Commitment> {
        if client.trim().is_empty() {
            return Err(GraphError::Validation("client is required".into()));
        }
        if target_hours <= 0.0 || window_weeks <= 0 {
            return Err(GraphError::Validation(
                "target hours and window must be positive".into(),
            ));
        }
        let _guard = self.lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let commitment =
            governance::upsert_commitment(&mut tx, self.user_id, client, target_hours, window_weeks)
                .await?;
        tx.commit().await?;
        Ok(commitment)
    }

    pub async fn end_commitment(&self, client: &str) -> GraphResult<bool> {
        let _guard = self.lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let ended = governance::end_commitment(&mut tx, self.user_id, client).await?;
        tx.commit().await?;
        Ok(ended)
    }

    pub async fn list_commitments(&self) -> GraphResult<Vec<Commitment>> {
        governance::list_commitments(&self.pool, self.user_id).await
    }

    /// Rolling-window compliance for a client's live commitment
    pub async fn get_commitment_status(
        &self,
        client: &str,
        window_end: Option<DateTime<Utc>>,
    ) -> GraphResult<CommitmentStatus> {
        let commitment = governance::live_commitment(&self.pool, self.user_id, client).await?;
        let window_end = window_end.unwrap_or_else(Utc::now);
        let window_start = window_end - Duration::weeks(commitment.window_weeks);

        let events = governance::allocated_events_in_window(
            &self.pool,
            self.user_id,
            client,
            window_start,
            window_end,
        )
        .await?;
        let actual_hours = total_hours(&events);

        Ok(CommitmentStatus {
            commitment_id: commitment.id,
            client: commitment.client,
            target_hours: commitment.target_hours,
            actual_hours,
            window_start,
            window_end,
            status: if actual_hours >= commitment.target_hours {
                ComplianceStatus::Compliant
            } else {
                ComplianceStatus::Behind
            },
        })
    }

    /// Deterministic proof export backing a compliance evaluation; the
    /// payload bytes are stable for a fixed window end.
    pub async fn get_commitment_proof_data(
        &self,
        client: &str,
        window_end: DateTime<Utc>,
    ) -> GraphResult<(CommitmentStatus, String)> {
        let status = self.get_commitment_status(client, Some(window_end)).await?;
        let rows = governance::allocated_events_in_window(
            &self.pool,
            self.user_id,
            client,
            status.window_start,
            status.window_end,
        )
        .await?;

        let events: Vec<serde_json::Value> = rows
            .iter()
            .map(|(id, start, end)| {
                serde_json::json!({
                    "event_id": id.as_str(),
                    "start": format_instant_ms(*start),
                    "end": format_instant_ms(*end),
                    "hours": hours_between(*start, *end),
                })
            })
            .collect();
        let payload = serde_json::json!({
            "client": status.client,
            "window_start": format_instant_ms(status.window_start),
            "window_end": format_instant_ms(status.window_end),
            "target_hours": status.target_hours,
            "actual_hours": status.actual_hours,
            "events": events,
        })
        .to_string();

        let _guard = self.lock.lock().await;
        let mut tx = self.pool.begin().await?;
        governance::insert_report(
            &mut tx,
            status.commitment_id,
            self.user_id,
            status.window_start,
            status.window_end,
            status.actual_hours,
            &payload,
        )
        .await?;
        tx.commit().await?;

        Ok((status, payload))
    }

    pub async fn set_vip_policy(
        &self,
        participant_hash: &str,
        priority_weight: f64,
        conditions: serde_json::Value,
    ) -> GraphResult<VipPolicy> {
        if participant_hash.trim().is_empty() {
            return Err(GraphError::Validation("participant hash is required".into()));
        }
        let _guard = self.lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let vip = governance::upsert_vip(
            &mut tx,
            self.user_id,
            participant_hash,
            priority_weight,
            &conditions,
        )
        .await?;
        tx.commit().await?;
        Ok(vip)
    }

    pub async fn remove_vip_policy(&self, participant_hash: &str) -> GraphResult<bool> {
        let _guard = self.lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let removed = governance::delete_vip(&mut tx, self.user_id, participant_hash).await?;
        tx.commit().await?;
        Ok(removed)
    }

    pub async fn list_vip_policies(&self) -> GraphResult<Vec<VipPolicy>> {
        governance::list_vips(&self.pool, self.user_id).await
    }

    pub async fn upsert_relationship(&self, relationship: Relationship) -> GraphResult<()> {
        if relationship.user_id != self.user_id {
            return Err(GraphError::Validation(
                "relationship belongs to another user".into(),
            ));
        }
        let _guard = self.lock.lock().await;
        let mut tx = self.pool.begin().await?;
        governance::upsert_relationship(&mut tx, &relationship).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn record_interaction(
        &self,
        participant_hash: &str,
        canonical_id: Option<&CanonicalId>,
        kind: &str,
        occurred_at: DateTime<Utc>,
    ) -> GraphResult<()> {
        let _guard = self.lock.lock().await;
        let mut tx = self.pool.begin().await?;
        governance::record_interaction(
            &mut tx,
            self.user_id,
            participant_hash,
            canonical_id,
            kind,
            occurred_at,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Context lookup for an event: who is attending (as hashes), how the
    /// relationship stands, and how much weight they carry.
    pub async fn get_event_briefing(&self, event_id: &CanonicalId) -> GraphResult<EventBriefing> {
        let event = events::get_event(&self.pool, self.user_id, event_id).await?;

        let mut participants = Vec::with_capacity(event.participant_hashes.len());
        for hash in &event.participant_hashes {
            let relationship = governance::get_relationship(&self.pool, self.user_id, hash).await?;
            let vip = governance::get_vip(&self.pool, self.user_id, hash).await?;
            let shared = governance::shared_event_count(&self.pool, self.user_id, hash).await?;

            participants.push(ParticipantBriefing {
                participant_hash: hash.clone(),
                display_name: relationship.as_ref().and_then(|r| r.display_name.clone()),
                category: relationship.as_ref().and_then(|r| r.category.clone()),
                last_interaction_at: relationship.as_ref().and_then(|r| r.last_interaction_at),
                priority_weight: vip.map(|v| v.priority_weight),
                shared_event_count: shared,
            });
        }

        Ok(EventBriefing {
            event_id: event.id,
            title: event.title,
            start_at: event.start_at,
            participants,
        })
    }

    // ------------------------------------------------------------------

    async fn send_task(&self, task: WriteTask) -> GraphResult<()> {
        self.write_tx
            .send(task)
            .await
            .map_err(|_| GraphError::Internal("write pipeline channel closed".into()))
    }
}

fn validate_times(start: DateTime<Utc>, end: DateTime<Utc>) -> GraphResult<()> {
    if end <= start {
        return Err(GraphError::Validation(format!(
            "end {} is not after start {}",
            format_instant_ms(end),
            format_instant_ms(start)
        )));
    }
    Ok(())
}

fn check_transition(from: SessionState, to: SessionState) -> GraphResult<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(GraphError::InvalidTransition {
            from: state_name(from),
            to: state_name(to),
        })
    }
}

fn state_name(state: SessionState) -> String {
    serde_json::to_value(state)
        .ok()
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| format!("{state:?}"))
}

fn hold_status_name(status: HoldStatus) -> String {
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| format!("{status:?}"))
}

/// Sorted, deduplicated participant hashes for a set of attendee emails
fn hash_participants(emails: &[String], salt: &str) -> Vec<String> {
    let mut hashes: Vec<String> = emails
        .iter()
        .filter(|e| !e.trim().is_empty())
        .map(|e| participant_hash(e, salt))
        .collect();
    hashes.sort();
    hashes.dedup();
    hashes
}

/// Journal patch capturing the material fields of an event
fn material_patch(event: &CanonicalEvent) -> serde_json::Value {
    serde_json::json!({
        "title": event.title,
        "description": event.description,
        "location": event.location,
        "start": format_instant_ms(event.start_at),
        "end": format_instant_ms(event.end_at),
        "all_day": event.all_day,
        "status": event.status,
        "transparency": event.transparency,
        "rrule": event.rrule,
        "participant_hashes": event.participant_hashes,
        "version": event.version,
    })
}

/// Apply normalized fields onto an existing event; true when anything
/// material changed.
fn apply_normalized(
    event: &mut CanonicalEvent,
    normalized: &NormalizedEvent,
    hashes: Vec<String>,
) -> bool {
    let changed = event.title != normalized.title
        || event.description != normalized.description
        || event.location != normalized.location
        || event.conference_url != normalized.conference_url
        || event.start_at != normalized.start_at
        || event.end_at != normalized.end_at
        || event.all_day != normalized.all_day
        || event.status != normalized.status
        || event.transparency != normalized.transparency
        || event.rrule != normalized.rrule
        || event.participant_hashes != hashes;

    if changed {
        event.title = normalized.title.clone();
        event.description = normalized.description.clone();
        event.location = normalized.location.clone();
        event.conference_url = normalized.conference_url.clone();
        event.start_at = normalized.start_at;
        event.end_at = normalized.end_at;
        event.all_day = normalized.all_day;
        event.status = normalized.status;
        event.transparency = normalized.transparency;
        event.rrule = normalized.rrule.clone();
        event.participant_hashes = hashes;
    }
    changed
}

/// Digest over a journal slice, input to the deletion certificate
fn journal_digest(entries: &[JournalEntry]) -> String {
    let rows: Vec<serde_json::Value> = entries
        .iter()
        .map(|e| {
            serde_json::json!({
                "seq": e.seq,
                "change_kind": e.change_kind,
                "patch": e.patch,
                "reason": e.reason,
                "recorded_at": format_instant_ms(e.recorded_at),
            })
        })
        .collect();
    canonical_json_hash(&serde_json::Value::Array(rows))
}

fn hours_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let hours = (end - start).num_minutes() as f64 / 60.0;
    hours
}

fn total_hours(rows: &[(CanonicalId, DateTime<Utc>, DateTime<Utc>)]) -> f64 {
    rows.iter().map(|(_, start, end)| hours_between(*start, *end)).sum()
}

/// Minimal payload for a hold reservation. The tags carry a hold-scoped id
/// and a nil edge so any echo classifies as managed rather than origin.
fn hold_payload(hold: &Hold, title: &str, status: EventStatus, user_id: UserId) -> MirrorPayload {
    let content_hash = canonical_json_hash(&serde_json::json!({
        "title": title,
        "start": format_instant_ms(hold.start_at),
        "end": format_instant_ms(hold.end_at),
        "status": status,
    }));
    MirrorPayload {
        title: title.to_string(),
        description: None,
        location: None,
        start_at: hold.start_at,
        end_at: hold.end_at,
        all_day: false,
        status,
        transparency: Transparency::Opaque,
        rrule: None,
        calendar_kind: CalendarKind::PrimaryMirror,
        tags: MirrorTags {
            canonical_id: CanonicalId::from_string(format!("hold:{}", hold.id)),
            owning_user_id: user_id,
            policy_edge_id: PolicyEdgeId(Uuid::nil()),
            content_hash,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_participants_dedupes_and_sorts() {
        let hashes = hash_participants(
            &[
                "Bob@example.com".to_string(),
                "alice@example.com".to_string(),
                "bob@example.com ".to_string(),
                String::new(),
            ],
            "salt",
        );
        assert_eq!(hashes.len(), 2);
        assert!(hashes.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_state_names_match_wire_format() {
        assert_eq!(state_name(SessionState::CandidatesReady), "candidates_ready");
        assert_eq!(hold_status_name(HoldStatus::Released), "released");
    }

    #[test]
    fn test_check_transition_rejects_terminal_exits() {
        assert!(check_transition(SessionState::Open, SessionState::Cancelled).is_ok());
        let err =
            check_transition(SessionState::Committed, SessionState::Cancelled).unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
    }

    #[test]
    fn test_hours_between() {
        let start = Utc::now();
        assert!((hours_between(start, start + Duration::minutes(90)) - 1.5).abs() < 1e-9);
    }
}
