//! Sync pipeline flows against the in-memory provider

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use sqlx::SqlitePool;
use tokio::sync::mpsc;

use tminus_accounts::{AccountConfig, AccountRegistry, DevelopmentCipher};
use tminus_core::models::{EventStatus, MirrorStatus, NormalizedEvent, Transparency};
use tminus_core::types::{AccountId, ProviderKind, UserId};
use tminus_graph::coordinator::{CoordinatorConfig, CoordinatorRegistry};
use tminus_graph::store::registry;
use tminus_graph::tasks::WriteTask;
use tminus_provider::{CalendarApi, MemoryProvider, ProviderClient, ProviderFactory};
use tminus_sync::{SyncConfig, SyncPipeline};

struct Harness {
    pipeline: Arc<SyncPipeline>,
    graph: Arc<CoordinatorRegistry>,
    provider: MemoryProvider,
    user_id: UserId,
    account_a: AccountId,
    account_b: AccountId,
    write_rx: mpsc::Receiver<WriteTask>,
}

async fn harness(pool: SqlitePool) -> Harness {
    let (write_tx, write_rx) = mpsc::channel(64);
    let graph = CoordinatorRegistry::new(pool.clone(), CoordinatorConfig::default(), write_tx);
    let provider = MemoryProvider::new();
    let accounts = AccountRegistry::new(
        pool.clone(),
        Arc::new(DevelopmentCipher::new(b"test-key")),
        AccountConfig::default(),
    );

    let user = registry::create_user(&pool, "Sync User", "UTC", "en", "salt-1")
        .await
        .expect("user");
    let record_a = registry::register_account(&pool, user.id, ProviderKind::Google, "a@gmail", None)
        .await
        .expect("account a");
    let record_b =
        registry::register_account(&pool, user.id, ProviderKind::Microsoft, "b@outlook", None)
            .await
            .expect("account b");

    for (record, token) in [(&record_a, "rt-a"), (&record_b, "rt-b")] {
        accounts
            .coordinator(record.clone(), ProviderClient::Memory(provider.clone()))
            .store_refresh_token(token)
            .await
            .expect("store refresh token");
    }

    graph
        .coordinator(user.id)
        .link_accounts(record_a.account_id, record_b.account_id)
        .await
        .expect("link");

    let pipeline = SyncPipeline::new(
        pool,
        graph.clone(),
        accounts,
        ProviderFactory::in_memory(provider.clone()),
        SyncConfig::default(),
    );

    Harness {
        pipeline,
        graph,
        provider,
        user_id: user.id,
        account_a: record_a.account_id,
        account_b: record_b.account_id,
        write_rx,
    }
}

fn origin_event(remote_id: &str, title: &str) -> NormalizedEvent {
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
async fn poll_ingests_origin_events_once(pool: SqlitePool) -> sqlx::Result<()> {
    let mut h = harness(pool).await;
    h.provider
        .seed_origin_event("rt-a", "primary", origin_event("evt-1", "Strat"));

    let stats = h.pipeline.poll_account(h.account_a).await.expect("poll");
    assert_eq!(stats.created, 1);
    assert_eq!(stats.updated, 0);

    // One projection task toward account B came out of ingestion
    let tasks = drain(&mut h.write_rx);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].target_account_id, h.account_b);

    // An idle incremental poll produces nothing
    let stats = h.pipeline.poll_account(h.account_a).await.expect("second poll");
    assert_eq!(stats, Default::default());
    assert!(drain(&mut h.write_rx).is_empty());

    // Sync health recorded the successes
    let health = h
        .graph
        .coordinator(h.user_id)
        .get_sync_health()
        .await
        .expect("health");
    let entry = health
        .iter()
        .find(|e| e.account_id == h.account_a)
        .expect("account a health");
    assert!(entry.last_success_at.is_some());
    assert_eq!(entry.consecutive_failures, 0);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn cursor_invalidation_diffs_against_canonical_store(pool: SqlitePool) -> sqlx::Result<()> {
    let mut h = harness(pool).await;
    h.provider
        .seed_origin_event("rt-a", "primary", origin_event("evt-1", "Strat"));
    h.pipeline.poll_account(h.account_a).await.expect("initial poll");
    drain(&mut h.write_rx);

    let coordinator = h.graph.coordinator(h.user_id);
    let events = coordinator
        .list_events(&Default::default())
        .await
        .expect("list");
    let canonical_id = events[0].id.clone();

    // Unchanged events replay through the full list without journal growth
    h.provider.invalidate_cursor();
    let stats = h.pipeline.poll_account(h.account_a).await.expect("full poll");
    assert_eq!(stats.created, 0);
    assert_eq!(stats.unchanged, 1);
    assert_eq!(coordinator.journal(&canonical_id).await.expect("journal").len(), 1);
    let event = coordinator.get_event(&canonical_id).await.expect("event");
    assert_eq!(event.version, 1);

    // A changed event bumps the version exactly once
    h.provider
        .seed_origin_event("rt-a", "primary", origin_event("evt-1", "Strat v2"));
    h.provider.invalidate_cursor();
    let stats = h.pipeline.poll_account(h.account_a).await.expect("full poll");
    assert_eq!(stats.updated, 1);
    let event = coordinator.get_event(&canonical_id).await.expect("event");
    assert_eq!(event.version, 2);
    assert_eq!(coordinator.journal(&canonical_id).await.expect("journal").len(), 2);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn managed_own_loopback_creates_nothing(pool: SqlitePool) -> sqlx::Result<()> {
    let mut h = harness(pool).await;
    h.provider
        .seed_origin_event("rt-a", "primary", origin_event("evt-1", "Strat"));
    h.pipeline.poll_account(h.account_a).await.expect("poll a");

    // Play the write pipeline's part: land the mirror in B's overlay and
    // confirm it back to the coordinator.
    let task = drain(&mut h.write_rx).pop().expect("projection task");
    let payload = task.payload.clone().expect("payload");
    let written = h
        .provider
        .create_event("memtok:rt-b", "busy-overlay", &payload)
        .await
        .expect("provider write");
    let coordinator = h.graph.coordinator(h.user_id);
    coordinator
        .mark_mirror_written(
            task.canonical_id.as_ref().expect("canonical id"),
            h.account_b,
            task.policy_edge_id.expect("edge"),
            &task.content_hash,
            &written.remote_id,
            &written.calendar_id,
        )
        .await
        .expect("mark written");

    let journal_before = coordinator
        .journal(task.canonical_id.as_ref().expect("canonical id"))
        .await
        .expect("journal")
        .len();

    // B's webhook fires for the mirror we just wrote
    let stats = h.pipeline.poll_account(h.account_b).await.expect("poll b");
    assert_eq!(stats.managed_own, 1);
    assert_eq!(stats.created, 0);
    assert_eq!(stats.drift_findings, 0);

    // No new canonical event, no journal growth, hash untouched
    let events = coordinator
        .list_events(&Default::default())
        .await
        .expect("list");
    assert_eq!(events.len(), 1);
    assert_eq!(
        coordinator
            .journal(task.canonical_id.as_ref().expect("canonical id"))
            .await
            .expect("journal")
            .len(),
        journal_before
    );

    // Now a human edits the mirror provider-side: drift is recorded
    h.provider
        .tamper_title("rt-b", "busy-overlay", &written.remote_id, "My edit");
    let stats = h.pipeline.poll_account(h.account_b).await.expect("poll b again");
    assert_eq!(stats.managed_own, 1);
    assert_eq!(stats.drift_findings, 1);

    let mirrors = coordinator
        .list_mirrors(task.canonical_id.as_ref().expect("canonical id"))
        .await
        .expect("mirrors");
    assert_eq!(mirrors[0].status, MirrorStatus::Error);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn provider_side_removal_cancels_the_canonical(pool: SqlitePool) -> sqlx::Result<()> {
    let mut h = harness(pool).await;
    h.provider
        .seed_origin_event("rt-a", "primary", origin_event("evt-1", "Strat"));
    h.pipeline.poll_account(h.account_a).await.expect("poll");
    drain(&mut h.write_rx);

    h.provider.remove_event("rt-a", "primary", "evt-1");
    let stats = h.pipeline.poll_account(h.account_a).await.expect("poll");
    assert_eq!(stats.removed, 1);

    let coordinator = h.graph.coordinator(h.user_id);
    let events = coordinator
        .list_events(&Default::default())
        .await
        .expect("list");
    assert_eq!(events[0].status, EventStatus::Cancelled);
    assert_eq!(events[0].version, 2);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn failures_stay_scoped_to_one_account(pool: SqlitePool) -> sqlx::Result<()> {
    let h = harness(pool).await;

    // Break refresh for everyone, then poll A: the failure lands in A's
    // health only and B still polls fine once refresh recovers.
    h.provider.set_fail_refresh(true);
    assert!(h.pipeline.poll_account(h.account_a).await.is_err());

    let health = h
        .graph
        .coordinator(h.user_id)
        .get_sync_health()
        .await
        .expect("health");
    let entry_a = health
        .iter()
        .find(|e| e.account_id == h.account_a)
        .expect("a health");
    assert_eq!(entry_a.consecutive_failures, 1);
    assert!(entry_a.last_failure_reason.is_some());

    h.provider.set_fail_refresh(false);
    assert!(h.pipeline.poll_account(h.account_b).await.is_ok());

    Ok(())
}
