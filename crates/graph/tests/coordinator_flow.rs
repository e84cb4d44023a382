//! End-to-end coordinator flows against a real store

use chrono::{Duration, TimeZone, Utc};
use sqlx::SqlitePool;
use tokio::sync::mpsc;

use tminus_core::models::{
    CalendarKind, EventStatus, Hold, HoldStatus, NormalizedEvent, SchedulingSession,
    SessionCandidate, SessionState, Transparency, Visibility,
};
use tminus_core::projection::WriteOp;
use tminus_core::types::{CandidateId, HoldId, ProviderKind, SessionId, UserId};
use tminus_graph::coordinator::{CoordinatorConfig, CoordinatorRegistry, EventDraft};
use tminus_graph::store::registry;
use tminus_graph::tasks::{WritePurpose, WriteTask};
use tminus_graph::UserGraphCoordinator;

struct Harness {
    coordinator: UserGraphCoordinator,
    user_id: UserId,
    account_a: tminus_core::types::AccountId,
    account_b: tminus_core::types::AccountId,
    write_rx: mpsc::Receiver<WriteTask>,
}

async fn harness(pool: SqlitePool) -> Harness {
    let (write_tx, write_rx) = mpsc::channel(64);
    let registry_handle =
        CoordinatorRegistry::new(pool.clone(), CoordinatorConfig::default(), write_tx);

    let user = registry::create_user(&pool, "Test User", "UTC", "en", "salt-1")
        .await
        .expect("create user");
    let account_a = registry::register_account(&pool, user.id, ProviderKind::Google, "a@gmail", None)
        .await
        .expect("register account a")
        .account_id;
    let account_b =
        registry::register_account(&pool, user.id, ProviderKind::Microsoft, "b@outlook", None)
            .await
            .expect("register account b")
            .account_id;

    let coordinator = registry_handle.coordinator(user.id);
    coordinator
        .link_accounts(account_a, account_b)
        .await
        .expect("link accounts");

    Harness {
        coordinator,
        user_id: user.id,
        account_a,
        account_b,
        write_rx,
    }
}

fn normalized_event(remote_id: &str, title: &str) -> NormalizedEvent {
    NormalizedEvent {
        remote_id: remote_id.to_string(),
        title: title.to_string(),
        description: None,
        location: None,
        conference_url: None,
        start_at: Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap(),
        end_at: Utc.with_ymd_and_hms(2026, 3, 2, 11, 0, 0).unwrap(),
        all_day: false,
        status: EventStatus::Confirmed,
        transparency: Transparency::Opaque,
        rrule: None,
        attendee_emails: vec!["alice@example.com".to_string()],
        tags: None,
    }
}

fn drain(rx: &mut mpsc::Receiver<WriteTask>) -> Vec<WriteTask> {
    let mut tasks = Vec::new();
    while let Ok(task) = rx.try_recv() {
        tasks.push(task);
    }
    tasks
}

#[sqlx::test(migrations = "../../migrations")]
async fn busy_overlay_projection_across_two_accounts(pool: SqlitePool) -> sqlx::Result<()> {
    let mut h = harness(pool).await;

    let outcome = h
        .coordinator
        .ingest_origin(h.account_a, &normalized_event("evt-1", "Strat"))
        .await
        .expect("ingest");

    // One canonical event with a ULID-shaped id and hashed participants
    assert_eq!(outcome.event.id.as_str().len(), 26);
    assert_eq!(outcome.event.version, 1);
    assert_eq!(outcome.event.participant_hashes.len(), 1);
    assert!(!outcome.event.participant_hashes[0].contains("alice"));

    // Exactly one write task, targeting B's busy overlay with a stripped title
    let tasks = drain(&mut h.write_rx);
    assert_eq!(tasks.len(), 1);
    let task = &tasks[0];
    assert_eq!(task.target_account_id, h.account_b);
    assert_eq!(task.op, WriteOp::Create);
    assert_eq!(task.calendar_kind, CalendarKind::BusyOverlay);
    let payload = task.payload.as_ref().expect("payload");
    assert_eq!(payload.title, "Busy");
    assert_eq!(payload.start_at, outcome.event.start_at);
    assert_eq!(payload.tags.canonical_id, outcome.event.id);

    // No mirror toward the origin account
    let mirrors = h.coordinator.list_mirrors(&outcome.event.id).await.expect("mirrors");
    assert_eq!(mirrors.len(), 1);
    assert!(mirrors.iter().all(|m| m.target_account_id != h.account_a));

    // Journal has exactly one create entry
    let journal = h.coordinator.journal(&outcome.event.id).await.expect("journal");
    assert_eq!(journal.len(), 1);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn replayed_payload_is_a_noop(pool: SqlitePool) -> sqlx::Result<()> {
    let mut h = harness(pool).await;

    let first = h
        .coordinator
        .ingest_origin(h.account_a, &normalized_event("evt-1", "Strat"))
        .await
        .expect("first ingest");
    drain(&mut h.write_rx);

    let replay = h
        .coordinator
        .ingest_origin(h.account_a, &normalized_event("evt-1", "Strat"))
        .await
        .expect("replay");

    // Same canonical id, same version, no change, no journal growth
    assert_eq!(replay.event.id, first.event.id);
    assert_eq!(replay.event.version, 1);
    assert!(replay.change.is_none());
    assert_eq!(h.coordinator.journal(&first.event.id).await.expect("journal").len(), 1);
    assert!(drain(&mut h.write_rx).is_empty());

    // A changed payload bumps the version exactly once
    let changed = h
        .coordinator
        .ingest_origin(h.account_a, &normalized_event("evt-1", "Strat v2"))
        .await
        .expect("changed ingest");
    assert_eq!(changed.event.id, first.event.id);
    assert_eq!(changed.event.version, 2);
    assert_eq!(h.coordinator.journal(&first.event.id).await.expect("journal").len(), 2);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn unchanged_projection_hash_suppresses_rewrites(pool: SqlitePool) -> sqlx::Result<()> {
    let mut h = harness(pool).await;

    let outcome = h
        .coordinator
        .ingest_origin(h.account_a, &normalized_event("evt-1", "Strat"))
        .await
        .expect("ingest");
    let task = drain(&mut h.write_rx).pop().expect("projection task");

    // The write pipeline confirms the write
    h.coordinator
        .mark_mirror_written(
            &outcome.event.id,
            h.account_b,
            task.policy_edge_id.expect("edge"),
            &task.content_hash,
            "mirror-remote-1",
            "overlay-cal-1",
        )
        .await
        .expect("mark written");

    // Retitling the event changes nothing at BUSY detail: same hash, no write
    let retitled = h
        .coordinator
        .ingest_origin(h.account_a, &normalized_event("evt-1", "Renamed"))
        .await
        .expect("retitle");
    assert_eq!(retitled.event.version, 2);
    assert!(drain(&mut h.write_rx).is_empty());

    // Moving the event does force a patch carrying the known remote id
    let mut moved = normalized_event("evt-1", "Renamed");
    moved.start_at += Duration::hours(1);
    moved.end_at += Duration::hours(1);
    h.coordinator.ingest_origin(h.account_a, &moved).await.expect("move");

    let tasks = drain(&mut h.write_rx);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].op, WriteOp::Patch);
    assert_eq!(tasks[0].remote_mirror_id.as_deref(), Some("mirror-remote-1"));

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn deletion_cascades_and_issues_certificate(pool: SqlitePool) -> sqlx::Result<()> {
    let mut h = harness(pool).await;

    let outcome = h
        .coordinator
        .ingest_origin(h.account_a, &normalized_event("evt-1", "Strat"))
        .await
        .expect("ingest");
    let task = drain(&mut h.write_rx).pop().expect("projection task");
    h.coordinator
        .mark_mirror_written(
            &outcome.event.id,
            h.account_b,
            task.policy_edge_id.expect("edge"),
            &task.content_hash,
            "mirror-remote-1",
            "overlay-cal-1",
        )
        .await
        .expect("mark written");

    let certificate = h.coordinator.delete_event(&outcome.event.id).await.expect("delete");
    assert_eq!(certificate.canonical_id, outcome.event.id);
    assert!(!certificate.signature.is_empty());

    // Mirror deletion dispatched toward the provider
    let tasks = drain(&mut h.write_rx);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].op, WriteOp::Delete);
    assert_eq!(tasks[0].purpose, WritePurpose::Mirror);
    assert_eq!(tasks[0].remote_mirror_id.as_deref(), Some("mirror-remote-1"));

    // Tombstoned events are gone from reads and cannot be deleted twice
    let err = h.coordinator.delete_event(&outcome.event.id).await.unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");

    let stored = h
        .coordinator
        .deletion_certificate(&outcome.event.id)
        .await
        .expect("certificate lookup")
        .expect("certificate row");
    assert_eq!(stored.journal_digest, certificate.journal_digest);

    Ok(())
}

fn session_for(user_id: UserId, state: SessionState, created_hours_ago: i64) -> SchedulingSession {
    let now = Utc::now();
    SchedulingSession {
        id: SessionId::new(),
        user_id,
        state,
        title: "Design sync".to_string(),
        duration_minutes: 60,
        window_start: now,
        window_end: now + Duration::hours(8),
        participant_user_ids: vec![user_id],
        required_account_ids: vec![],
        committed_candidate_id: None,
        committed_event_id: None,
        created_at: now - Duration::hours(created_hours_ago),
        updated_at: now - Duration::hours(created_hours_ago),
    }
}

fn candidate_for(session: &SchedulingSession, offset_hours: i64, rank: i64) -> SessionCandidate {
    let start = session.window_start + Duration::hours(offset_hours);
    SessionCandidate {
        id: CandidateId::new(),
        session_id: session.id,
        user_id: session.user_id,
        start_at: start,
        end_at: start + Duration::minutes(session.duration_minutes),
        score: 2.0,
        explanation: "test candidate".to_string(),
        rank,
    }
}

fn hold_for(
    session: &SchedulingSession,
    candidate: &SessionCandidate,
    account_id: tminus_core::types::AccountId,
) -> Hold {
    Hold {
        id: HoldId::new(),
        session_id: session.id,
        user_id: session.user_id,
        account_id,
        start_at: candidate.start_at,
        end_at: candidate.end_at,
        provider_mirror_id: None,
        status: HoldStatus::Held,
        expires_at: Utc::now() + Duration::hours(2),
        created_at: Utc::now(),
    }
}

#[sqlx::test(migrations = "../../migrations")]
async fn session_commit_settles_holds(pool: SqlitePool) -> sqlx::Result<()> {
    let mut h = harness(pool).await;

    let session = session_for(h.user_id, SessionState::CandidatesReady, 0);
    let chosen = candidate_for(&session, 1, 1);
    let alternate = candidate_for(&session, 3, 2);
    h.coordinator
        .store_session(&session, &[chosen.clone(), alternate.clone()])
        .await
        .expect("store session");

    h.coordinator
        .store_holds(vec![
            hold_for(&session, &chosen, h.account_a),
            hold_for(&session, &alternate, h.account_a),
        ])
        .await
        .expect("store holds");
    let place_tasks = drain(&mut h.write_rx);
    assert_eq!(place_tasks.len(), 2);
    assert!(place_tasks
        .iter()
        .all(|t| matches!(t.purpose, WritePurpose::HoldPlace { .. })));

    let (committed, event) = h
        .coordinator
        .commit_session(session.id, chosen.id)
        .await
        .expect("commit");
    assert_eq!(committed.state, SessionState::Committed);
    assert_eq!(committed.committed_candidate_id, Some(chosen.id));
    assert_eq!(committed.committed_event_id, Some(event.id.clone()));
    assert_eq!(event.start_at, chosen.start_at);
    assert_eq!(event.title, session.title);

    // Every hold is terminal; the chosen slot committed, the rest released
    let holds = h.coordinator.get_holds_by_session(session.id).await.expect("holds");
    assert!(holds.iter().all(|hold| hold.status.is_terminal()));
    let committed_holds: Vec<_> = holds
        .iter()
        .filter(|hold| hold.status == HoldStatus::Committed)
        .collect();
    assert_eq!(committed_holds.len(), 1);
    assert_eq!(committed_holds[0].start_at, event.start_at);

    // Terminal sessions refuse further transitions
    let err = h.coordinator.commit_session(session.id, alternate.id).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_TRANSITION");

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn lazy_expiry_on_read(pool: SqlitePool) -> sqlx::Result<()> {
    let h = harness(pool).await;

    let session = session_for(h.user_id, SessionState::CandidatesReady, 25);
    let candidate = candidate_for(&session, 1, 1);
    h.coordinator
        .store_session(&session, &[candidate.clone()])
        .await
        .expect("store session");
    h.coordinator
        .store_holds(vec![hold_for(&session, &candidate, h.account_a)])
        .await
        .expect("store holds");

    // A 25h-old session expires on read and its holds release
    let fetched = h.coordinator.get_session(session.id).await.expect("get session");
    assert_eq!(fetched.state, SessionState::Expired);

    let holds = h.coordinator.get_holds_by_session(session.id).await.expect("holds");
    assert!(holds.iter().all(|hold| hold.status == HoldStatus::Released));

    // The store reflects the transition after the call
    let listed = h
        .coordinator
        .list_sessions(Some(SessionState::Expired))
        .await
        .expect("list");
    assert!(listed.iter().any(|s| s.id == session.id));

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn cancel_converges_and_hold_transitions_guard(pool: SqlitePool) -> sqlx::Result<()> {
    let h = harness(pool).await;

    let session = session_for(h.user_id, SessionState::Open, 0);
    let candidate = candidate_for(&session, 1, 1);
    h.coordinator
        .store_session(&session, &[candidate.clone()])
        .await
        .expect("store session");
    h.coordinator
        .store_holds(vec![hold_for(&session, &candidate, h.account_a)])
        .await
        .expect("store holds");

    let cancelled = h.coordinator.cancel_session(session.id).await.expect("cancel");
    assert_eq!(cancelled.state, SessionState::Cancelled);

    // Rollback paths may cancel again; that converges instead of failing
    let again = h.coordinator.cancel_session(session.id).await.expect("cancel again");
    assert_eq!(again.state, SessionState::Cancelled);

    // Released holds reject further transitions
    let holds = h.coordinator.get_holds_by_session(session.id).await.expect("holds");
    let err = h
        .coordinator
        .update_hold_status(holds[0].id, HoldStatus::Committed)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_TRANSITION");

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn commit_after_cancel_persists_nothing(pool: SqlitePool) -> sqlx::Result<()> {
    let h = harness(pool).await;

    let session = session_for(h.user_id, SessionState::CandidatesReady, 0);
    let candidate = candidate_for(&session, 1, 1);
    h.coordinator
        .store_session(&session, &[candidate.clone()])
        .await
        .expect("store session");

    h.coordinator.cancel_session(session.id).await.expect("cancel");

    // The whole commit is one transaction: a cancel that lands first
    // rejects it outright and nothing is written.
    let err = h
        .coordinator
        .commit_session(session.id, candidate.id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_TRANSITION");

    let events = h
        .coordinator
        .list_events(&Default::default())
        .await
        .expect("events");
    assert!(events.is_empty());

    let fetched = h.coordinator.get_session(session.id).await.expect("session");
    assert_eq!(fetched.state, SessionState::Cancelled);
    assert!(fetched.committed_event_id.is_none());

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn holds_cannot_outlive_their_session(pool: SqlitePool) -> sqlx::Result<()> {
    let h = harness(pool.clone()).await;

    let session = session_for(h.user_id, SessionState::Open, 0);
    let candidate = candidate_for(&session, 1, 1);
    h.coordinator
        .store_session(&session, &[candidate.clone()])
        .await
        .expect("store session");
    h.coordinator
        .store_holds(vec![hold_for(&session, &candidate, h.account_a)])
        .await
        .expect("store holds");

    // Holds referencing a missing session are rejected outright
    let orphan_session = session_for(h.user_id, SessionState::Open, 0);
    let orphan_candidate = candidate_for(&orphan_session, 1, 1);
    let result = h
        .coordinator
        .store_holds(vec![hold_for(&orphan_session, &orphan_candidate, h.account_a)])
        .await;
    assert!(result.is_err());

    // Dropping the session row cascades to its holds
    sqlx::query("DELETE FROM scheduling_sessions WHERE id = ?")
        .bind(session.id)
        .execute(&pool)
        .await?;
    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM holds WHERE session_id = ?")
        .bind(session.id)
        .fetch_one(&pool)
        .await?;
    assert_eq!(remaining, 0);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn commitment_compliance_and_deterministic_proof(pool: SqlitePool) -> sqlx::Result<()> {
    let h = harness(pool).await;

    h.coordinator
        .set_commitment("acme", 10.0, 4)
        .await
        .expect("set commitment");

    let window_end = Utc.with_ymd_and_hms(2026, 3, 27, 0, 0, 0).unwrap();
    for day in 0..5 {
        let start = Utc.with_ymd_and_hms(2026, 3, 2 + day, 14, 0, 0).unwrap();
        let event = h
            .coordinator
            .create_system_event(EventDraft {
                title: format!("Acme working session {day}"),
                description: None,
                location: None,
                conference_url: None,
                start_at: start,
                end_at: start + Duration::hours(2),
                all_day: false,
                status: EventStatus::Confirmed,
                visibility: Visibility::Default,
                transparency: Transparency::Opaque,
                rrule: None,
                attendee_emails: vec![],
            })
            .await
            .expect("create event");
        h.coordinator
            .allocate_time(&event.id, "consulting", "acme", Some(180.0))
            .await
            .expect("allocate");
    }

    let status = h
        .coordinator
        .get_commitment_status("acme", Some(window_end))
        .await
        .expect("status");
    assert!((status.actual_hours - 10.0).abs() < 1e-9);
    assert_eq!(
        status.status,
        tminus_core::models::ComplianceStatus::Compliant
    );

    // Proof export is byte-stable for a fixed window end
    let (_, first) = h
        .coordinator
        .get_commitment_proof_data("acme", window_end)
        .await
        .expect("first proof");
    let (_, second) = h
        .coordinator
        .get_commitment_proof_data("acme", window_end)
        .await
        .expect("second proof");
    assert_eq!(first, second);
    assert!(first.contains("\"actual_hours\":10.0"));

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn reallocating_an_event_retires_the_previous_allocation(
    pool: SqlitePool,
) -> sqlx::Result<()> {
    let h = harness(pool).await;

    let start = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
    let event = h
        .coordinator
        .create_system_event(EventDraft {
            title: "Workshop".to_string(),
            description: None,
            location: None,
            conference_url: None,
            start_at: start,
            end_at: start + Duration::hours(1),
            all_day: false,
            status: EventStatus::Confirmed,
            visibility: Visibility::Default,
            transparency: Transparency::Opaque,
            rrule: None,
            attendee_emails: vec![],
        })
        .await
        .expect("create event");

    h.coordinator
        .allocate_time(&event.id, "consulting", "acme", None)
        .await
        .expect("first allocation");
    let second = h
        .coordinator
        .allocate_time(&event.id, "advisory", "globex", None)
        .await
        .expect("second allocation");

    // At most one active allocation per event
    let active = h.coordinator.get_allocation(&event.id).await.expect("lookup");
    assert_eq!(active.expect("active allocation").id, second.id);
    assert_eq!(h.coordinator.list_allocations(Some("acme")).await.expect("list").len(), 0);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn briefing_reports_relationship_context(pool: SqlitePool) -> sqlx::Result<()> {
    let mut h = harness(pool).await;

    let outcome = h
        .coordinator
        .ingest_origin(h.account_a, &normalized_event("evt-1", "Dinner"))
        .await
        .expect("ingest");
    drain(&mut h.write_rx);
    let hash = outcome.event.participant_hashes[0].clone();

    h.coordinator
        .upsert_relationship(tminus_core::models::Relationship {
            user_id: h.user_id,
            participant_hash: hash.clone(),
            display_name: Some("Alice".to_string()),
            category: Some("client".to_string()),
            city: Some("Berlin".to_string()),
            timezone: Some("Europe/Berlin".to_string()),
            cadence_target_days: Some(30),
            last_interaction_at: None,
        })
        .await
        .expect("relationship");
    h.coordinator
        .set_vip_policy(&hash, 2.5, serde_json::json!({"always_accept": true}))
        .await
        .expect("vip");

    let briefing = h
        .coordinator
        .get_event_briefing(&outcome.event.id)
        .await
        .expect("briefing");
    assert_eq!(briefing.participants.len(), 1);
    let participant = &briefing.participants[0];
    assert_eq!(participant.display_name.as_deref(), Some("Alice"));
    assert_eq!(participant.priority_weight, Some(2.5));
    // Ingestion recorded the meeting in the ledger
    assert!(participant.last_interaction_at.is_some());
    assert_eq!(participant.shared_event_count, 1);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn busy_spans_strip_account_identity(pool: SqlitePool) -> sqlx::Result<()> {
    let mut h = harness(pool).await;

    h.coordinator
        .ingest_origin(h.account_a, &normalized_event("evt-1", "Strat"))
        .await
        .expect("ingest");
    drain(&mut h.write_rx);

    let window_start = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
    let window_end = Utc.with_ymd_and_hms(2026, 3, 3, 0, 0, 0).unwrap();

    let intervals = h
        .coordinator
        .busy_intervals(window_start, window_end)
        .await
        .expect("busy intervals");
    assert_eq!(intervals.len(), 1);
    assert!(intervals[0].account_ids.contains(&h.account_a.to_string()));

    let spans = h
        .coordinator
        .busy_spans(window_start, window_end)
        .await
        .expect("busy spans");
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].0, intervals[0].start);

    Ok(())
}
