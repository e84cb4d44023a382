//! Group scheduling coordinator
//!
//! One flow per session id, serialized by a per-session lock. Busy data
//! crosses user boundaries only as bare (start, end) pairs tagged with
//! synthetic `group:<user>` ids; commit writes one canonical event per
//! participant and rolls everyone back to cancelled on failure.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use tminus_core::error::{GraphError, GraphResult};
use tminus_core::interval::{BusyInterval, SlotQuery, find_slots, group_account_id};
use tminus_core::models::{
    CanonicalEvent, Hold, HoldStatus, SchedulingSession, SessionCandidate, SessionState,
};
use tminus_core::types::{AccountId, CandidateId, HoldId, SessionId, UserId};
use tminus_graph::CoordinatorRegistry;
use tminus_graph::store::registry;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_candidates: usize,
    pub min_duration_minutes: i64,
    pub max_duration_minutes: i64,
    /// Lifetime of the tentative holds placed during the gathering phase
    pub hold_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_candidates: 5,
            min_duration_minutes: 15,
            max_duration_minutes: 480,
            hold_ttl: Duration::hours(24),
        }
    }
}

/// Parameters for a new group session
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub creator: UserId,
    pub participants: Vec<UserId>,
    pub title: String,
    pub duration_minutes: i64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Accounts that must carry the tentative holds; empty means each
    /// participant's first linked account.
    pub required_account_ids: Vec<AccountId>,
}

/// One participant's view of a session
#[derive(Debug, Clone)]
pub struct SessionView {
    pub session: SchedulingSession,
    pub candidates: Vec<SessionCandidate>,
}

pub struct GroupScheduler {
    pool: SqlitePool,
    graph: Arc<CoordinatorRegistry>,
    config: SchedulerConfig,
    session_locks: StdMutex<HashMap<SessionId, Arc<AsyncMutex<()>>>>,
}

impl GroupScheduler {
    pub fn new(
        pool: SqlitePool,
        graph: Arc<CoordinatorRegistry>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(GroupScheduler {
            pool,
            graph,
            config,
            session_locks: StdMutex::new(HashMap::new()),
        })
    }

    fn lock_for(&self, session_id: SessionId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.session_locks.lock().expect("session lock table poisoned");
        locks
            .entry(session_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Create a session: gather busy spans, solve for candidates, register
    /// the session with every participant, then place holds.
    pub async fn create_session(&self, request: SessionRequest) -> GraphResult<SessionView> {
        self.validate_request(&request)?;
        let session_id = SessionId::new();
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        // Busy merge: each participant's spans arrive pre-merged and are
        // re-tagged with their synthetic id. Real account ids never cross
        // this boundary.
        let mut busy = Vec::new();
        let mut required: BTreeSet<String> = BTreeSet::new();
        for participant in &request.participants {
            let synthetic = group_account_id(*participant);
            required.insert(synthetic.clone());

            let coordinator = self.graph.coordinator(*participant);
            for (start, end) in coordinator
                .busy_spans(request.window_start, request.window_end)
                .await?
            {
                busy.push(BusyInterval::new(start, end, synthetic.clone()));
            }
        }

        let query = SlotQuery {
            window_start: request.window_start,
            window_end: request.window_end,
            duration: Duration::minutes(request.duration_minutes),
            required_account_ids: required,
            working_hours: None,
            hour_weights: BTreeMap::new(),
            max_candidates: self.config.max_candidates,
        };
        let slots = find_slots(&query, &busy);
        if slots.is_empty() {
            return Err(GraphError::Validation(
                "no common availability in the requested window".into(),
            ));
        }

        // Register the session row with every participant before any hold
        // exists, then place candidate holds.
        let now = Utc::now();
        let mut creator_view = None;
        for participant in &request.participants {
            let session = SchedulingSession {
                id: session_id,
                user_id: *participant,
                state: SessionState::CandidatesReady,
                title: request.title.clone(),
                duration_minutes: request.duration_minutes,
                window_start: request.window_start,
                window_end: request.window_end,
                participant_user_ids: request.participants.clone(),
                required_account_ids: request.required_account_ids.clone(),
                committed_candidate_id: None,
                committed_event_id: None,
                created_at: now,
                updated_at: now,
            };
            let candidates: Vec<SessionCandidate> = slots
                .iter()
                .enumerate()
                .map(|(rank, slot)| SessionCandidate {
                    id: CandidateId::new(),
                    session_id,
                    user_id: *participant,
                    start_at: slot.start,
                    end_at: slot.end,
                    score: slot.score,
                    explanation: slot.explanation.clone(),
                    rank: (rank + 1) as i64,
                })
                .collect();

            let coordinator = self.graph.coordinator(*participant);
            coordinator.store_session(&session, &candidates).await?;

            if let Some(account_id) = self.hold_account(*participant, &request).await? {
                let holds: Vec<Hold> = candidates
                    .iter()
                    .map(|candidate| Hold {
                        id: HoldId::new(),
                        session_id,
                        user_id: *participant,
                        account_id,
                        start_at: candidate.start_at,
                        end_at: candidate.end_at,
                        provider_mirror_id: None,
                        status: HoldStatus::Held,
                        expires_at: now + self.config.hold_ttl,
                        created_at: now,
                    })
                    .collect();
                coordinator.store_holds(holds).await?;
            }

            if *participant == request.creator {
                creator_view = Some(SessionView {
                    session,
                    candidates,
                });
            }
        }

        registry::register_group_session(
            &self.pool,
            session_id,
            request.creator,
            &request.participants,
        )
        .await?;

        info!(%session_id, participants = request.participants.len(), "group session created");
        creator_view.ok_or_else(|| GraphError::Internal("creator view missing".into()))
    }

    /// Commit a candidate across every participant.
    ///
    /// Phase one stages one canonical event per participant; any failure
    /// rolls every participant back to cancelled and surfaces
    /// `COMMIT_FAILED`. Phase two flips the sessions to committed and
    /// settles holds; a participant whose session slipped terminal between
    /// the phases gets its staged event retracted, and drift
    /// reconciliation converges whatever provider writes are left.
    pub async fn commit_session(
        &self,
        session_id: SessionId,
        requester: UserId,
        candidate_id: CandidateId,
    ) -> GraphResult<SessionView> {
        let participants = self.participants_of(session_id, requester).await?;
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let requester_coordinator = self.graph.coordinator(requester);
        let session = requester_coordinator.get_session(session_id).await?;
        if session.state.is_terminal() {
            let from = serde_json::to_value(session.state)
                .ok()
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_else(|| format!("{:?}", session.state));
            return Err(GraphError::InvalidTransition {
                from,
                to: "committed".into(),
            });
        }
        let chosen = requester_coordinator
            .session_candidates(session_id)
            .await?
            .into_iter()
            .find(|c| c.id == candidate_id)
            .ok_or_else(|| GraphError::NotFound(format!("candidate {candidate_id}")))?;

        // Phase one: stage events in participant order
        let mut staged: Vec<(UserId, CandidateId, CanonicalEvent)> = Vec::new();
        for participant in &participants {
            let coordinator = self.graph.coordinator(*participant);
            let result = async {
                let candidate = coordinator
                    .session_candidates(session_id)
                    .await?
                    .into_iter()
                    .find(|c| c.start_at == chosen.start_at && c.end_at == chosen.end_at)
                    .ok_or_else(|| {
                        GraphError::Internal("candidate slot missing for participant".into())
                    })?;
                let event = coordinator
                    .write_session_event(session_id, candidate.id)
                    .await?;
                Ok::<_, GraphError>((candidate.id, event))
            }
            .await;

            match result {
                Ok((candidate_id, event)) => staged.push((*participant, candidate_id, event)),
                Err(err) => {
                    warn!(%session_id, participant = %participant, %err, "commit failed; rolling back");
                    self.rollback(session_id, &participants, &staged).await;
                    return Err(GraphError::CommitFailed(format!(
                        "participant {participant}: {err}"
                    )));
                }
            }
        }

        // Phase two: flip every session to committed
        for (participant, participant_candidate, event) in &staged {
            let coordinator = self.graph.coordinator(*participant);
            if let Err(err) = coordinator
                .finalize_session_commit(session_id, *participant_candidate, &event.id)
                .await
            {
                // The session slipped terminal between the phases: retract
                // the staged event so it cannot orphan, and let drift
                // reconciliation converge whatever else is left.
                warn!(%session_id, participant = %participant, %err, "finalize rejected; retracting staged event");
                if let Err(retract_err) = coordinator.delete_event(&event.id).await {
                    warn!(
                        %session_id,
                        participant = %participant,
                        %retract_err,
                        "staged event retraction failed"
                    );
                }
            }
        }

        info!(%session_id, slot = %chosen.start_at, "group session committed");
        self.view_for(session_id, requester).await
    }

    /// Cancel a session for every participant
    pub async fn cancel_session(
        &self,
        session_id: SessionId,
        requester: UserId,
    ) -> GraphResult<SessionView> {
        let participants = self.participants_of(session_id, requester).await?;
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        for participant in &participants {
            let coordinator = self.graph.coordinator(*participant);
            if let Err(err) = coordinator.cancel_session(session_id).await {
                warn!(%session_id, participant = %participant, %err, "cancel did not apply");
            }
        }
        self.view_for(session_id, requester).await
    }

    /// A participant's current view of the session
    pub async fn get_session(
        &self,
        session_id: SessionId,
        requester: UserId,
    ) -> GraphResult<SessionView> {
        self.participants_of(session_id, requester).await?;
        self.view_for(session_id, requester).await
    }

    async fn view_for(&self, session_id: SessionId, user: UserId) -> GraphResult<SessionView> {
        let coordinator = self.graph.coordinator(user);
        Ok(SessionView {
            session: coordinator.get_session(session_id).await?,
            candidates: coordinator.session_candidates(session_id).await?,
        })
    }

    /// Resolve a session in the cross-user registry and authorize the
    /// requester.
    async fn participants_of(
        &self,
        session_id: SessionId,
        requester: UserId,
    ) -> GraphResult<Vec<UserId>> {
        let (_, participants) = registry::lookup_group_session(&self.pool, session_id)
            .await?
            .ok_or_else(|| GraphError::NotFound(format!("session {session_id}")))?;
        if !participants.contains(&requester) {
            return Err(GraphError::NotFound(format!("session {session_id}")));
        }
        Ok(participants)
    }

    /// Converge everyone to cancelled and retract staged events
    async fn rollback(
        &self,
        session_id: SessionId,
        participants: &[UserId],
        staged: &[(UserId, CandidateId, CanonicalEvent)],
    ) {
        for participant in participants {
            let coordinator = self.graph.coordinator(*participant);
            if let Err(err) = coordinator.cancel_session(session_id).await {
                warn!(%session_id, participant = %participant, %err, "rollback cancel failed");
            }
        }
        for (participant, _, event) in staged {
            let coordinator = self.graph.coordinator(*participant);
            if let Err(err) = coordinator.delete_event(&event.id).await {
                warn!(%session_id, participant = %participant, %err, "rollback retract failed");
            }
        }
    }

    /// Which of the participant's accounts carries the tentative holds
    async fn hold_account(
        &self,
        participant: UserId,
        request: &SessionRequest,
    ) -> GraphResult<Option<AccountId>> {
        let accounts = registry::accounts_for_user(&self.pool, participant).await?;
        let writable: Vec<_> = accounts
            .iter()
            .filter(|a| a.provider.supports_writes())
            .collect();

        if !request.required_account_ids.is_empty() {
            if let Some(account) = writable
                .iter()
                .find(|a| request.required_account_ids.contains(&a.account_id))
            {
                return Ok(Some(account.account_id));
            }
        }
        Ok(writable.first().map(|a| a.account_id))
    }

    fn validate_request(&self, request: &SessionRequest) -> GraphResult<()> {
        let mut unique = request.participants.clone();
        unique.sort_unstable_by_key(|u| u.0);
        unique.dedup();
        if unique.len() < 2 {
            return Err(GraphError::Validation(
                "a group session needs at least two participants".into(),
            ));
        }
        if !request.participants.contains(&request.creator) {
            return Err(GraphError::Validation(
                "the creator must be a participant".into(),
            ));
        }
        if request.duration_minutes < self.config.min_duration_minutes
            || request.duration_minutes > self.config.max_duration_minutes
        {
            return Err(GraphError::Validation(format!(
                "duration must be between {} and {} minutes",
                self.config.min_duration_minutes, self.config.max_duration_minutes
            )));
        }
        if request.window_end
            <= request.window_start + Duration::minutes(request.duration_minutes)
        {
            return Err(GraphError::Validation(
                "the window cannot fit the requested duration".into(),
            ));
        }
        if request.title.trim().is_empty() {
            return Err(GraphError::Validation("a session needs a title".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(participants: Vec<UserId>, creator: UserId, duration: i64) -> SessionRequest {
        let start = Utc::now();
        SessionRequest {
            creator,
            participants,
            title: "Sync".into(),
            duration_minutes: duration,
            window_start: start,
            window_end: start + Duration::hours(8),
            required_account_ids: vec![],
        }
    }

    fn scheduler_config() -> SchedulerConfig {
        SchedulerConfig::default()
    }

    #[test]
    fn test_request_validation() {
        let config = scheduler_config();
        let scheduler = GroupScheduler {
            pool: SqlitePool::connect_lazy("sqlite::memory:").expect("pool"),
            graph: CoordinatorRegistry::new(
                SqlitePool::connect_lazy("sqlite::memory:").expect("pool"),
                Default::default(),
                tokio::sync::mpsc::channel(1).0,
            ),
            config,
            session_locks: StdMutex::new(HashMap::new()),
        };

        let alice = UserId::new();
        let bob = UserId::new();

        // Too few participants
        let err = scheduler
            .validate_request(&request(vec![alice], alice, 60))
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        // Creator not included
        let err = scheduler
            .validate_request(&request(vec![alice, bob], UserId::new(), 60))
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        // Duration bounds
        assert!(scheduler
            .validate_request(&request(vec![alice, bob], alice, 10))
            .is_err());
        assert!(scheduler
            .validate_request(&request(vec![alice, bob], alice, 481))
            .is_err());
        assert!(scheduler
            .validate_request(&request(vec![alice, bob], alice, 60))
            .is_ok());

        // Window too narrow
        let mut narrow = request(vec![alice, bob], alice, 60);
        narrow.window_end = narrow.window_start + Duration::minutes(30);
        assert!(scheduler.validate_request(&narrow).is_err());
    }
}
