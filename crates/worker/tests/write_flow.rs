//! Write pipeline and drift reconciliation against the in-memory provider

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
use tminus_provider::memory::InjectedFailure;
use tminus_provider::{MemoryProvider, ProviderClient, ProviderFactory};
use tminus_worker::write::TaskOutcome;
use tminus_worker::{Maintainer, WorkerConfig, WritePipeline};

struct Harness {
    pipeline: Arc<WritePipeline>,
    maintainer: Arc<Maintainer>,
    graph: Arc<CoordinatorRegistry>,
    provider: MemoryProvider,
    user_id: UserId,
    account_a: AccountId,
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
    let config = WorkerConfig {
        base_backoff: std::time::Duration::from_millis(5),
        ..WorkerConfig::default()
    };

    let user = registry::create_user(&pool, "Write User", "UTC", "en", "salt-1")
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

    let providers = ProviderFactory::in_memory(provider.clone());
    let pipeline = WritePipeline::new(
        pool.clone(),
        graph.clone(),
        accounts.clone(),
        providers.clone(),
        config.clone(),
    );
    let maintainer = Maintainer::new(pool, graph.clone(), accounts, providers, config);

    Harness {
        pipeline,
        maintainer,
        graph,
        provider,
        user_id: user.id,
        account_a: record_a.account_id,
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
        attendee_emails: vec![],
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

async fn process_all(h: &mut Harness) -> Vec<TaskOutcome> {
    let mut outcomes = Vec::new();
    loop {
        let tasks = drain(&mut h.write_rx);
        if tasks.is_empty() {
            return outcomes;
        }
        for task in tasks {
            outcomes.push(h.pipeline.process_task(task).await);
        }
    }
}

#[sqlx::test(migrations = "../../migrations")]
async fn mirror_create_lands_with_tags(pool: SqlitePool) -> sqlx::Result<()> {
    let mut h = harness(pool).await;
    let coordinator = h.graph.coordinator(h.user_id);

    let outcome = coordinator
        .ingest_origin(h.account_a, &origin_event("evt-1", "Strat"))
        .await
        .expect("ingest");

    let outcomes = process_all(&mut h).await;
    assert_eq!(outcomes, vec![TaskOutcome::Written]);

    // The overlay in B's account carries a stripped, tagged busy marker
    assert_eq!(h.provider.event_count("rt-b", "busy-overlay"), 1);
    let mirrors = coordinator.list_mirrors(&outcome.event.id).await.expect("mirrors");
    assert_eq!(mirrors.len(), 1);
    assert_eq!(mirrors[0].status, MirrorStatus::Live);
    assert_eq!(mirrors[0].target_calendar_id.as_deref(), Some("busy-overlay"));
    let remote_id = mirrors[0].remote_mirror_id.clone().expect("remote id");

    let written = h.provider.event("rt-b", "busy-overlay", &remote_id).expect("event");
    assert_eq!(written.title, "Busy");
    let tags = written.tags.expect("tags").validate().expect("valid tags");
    assert_eq!(tags.canonical_id, outcome.event.id);
    assert_eq!(tags.owning_user_id, h.user_id);

    // Nothing ever landed in the origin account
    assert_eq!(h.provider.event_count("rt-a", "busy-overlay"), 0);

    // Re-projecting the unchanged event dispatches nothing
    let refreshed = coordinator.get_event(&outcome.event.id).await.expect("event");
    let dispatched = coordinator
        .project_event(&refreshed, "en", false)
        .await
        .expect("project");
    assert_eq!(dispatched, 0);
    assert!(drain(&mut h.write_rx).is_empty());

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn transient_failures_retry_to_success(pool: SqlitePool) -> sqlx::Result<()> {
    let mut h = harness(pool).await;
    let coordinator = h.graph.coordinator(h.user_id);

    h.provider.fail_next_write(InjectedFailure::Transient);
    h.provider.fail_next_write(InjectedFailure::RateLimited);

    coordinator
        .ingest_origin(h.account_a, &origin_event("evt-1", "Strat"))
        .await
        .expect("ingest");

    let outcomes = process_all(&mut h).await;
    assert_eq!(outcomes, vec![TaskOutcome::Written]);
    assert_eq!(h.provider.event_count("rt-b", "busy-overlay"), 1);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn terminal_failure_journals_and_flags_the_mirror(pool: SqlitePool) -> sqlx::Result<()> {
    let mut h = harness(pool).await;
    let coordinator = h.graph.coordinator(h.user_id);

    h.provider.fail_next_write(InjectedFailure::Terminal);
    let outcome = coordinator
        .ingest_origin(h.account_a, &origin_event("evt-1", "Strat"))
        .await
        .expect("ingest");

    let outcomes = process_all(&mut h).await;
    assert_eq!(outcomes, vec![TaskOutcome::TerminalFailure]);

    let mirrors = coordinator.list_mirrors(&outcome.event.id).await.expect("mirrors");
    assert_eq!(mirrors[0].status, MirrorStatus::Error);

    // Terminal failures are journaled
    let journal = coordinator.journal(&outcome.event.id).await.expect("journal");
    assert!(journal
        .iter()
        .any(|e| matches!(e.change_kind, tminus_core::models::ChangeKind::MirrorWriteFailed)));

    // Drift reconciliation re-projects the flagged mirror and repairs it
    let report = h.maintainer.drift_pass().await.expect("drift");
    assert_eq!(report.reprojected, 1);
    let outcomes = process_all(&mut h).await;
    assert_eq!(outcomes, vec![TaskOutcome::Written]);
    let mirrors = coordinator.list_mirrors(&outcome.event.id).await.expect("mirrors");
    assert_eq!(mirrors[0].status, MirrorStatus::Live);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn deletion_reaches_provider_absence(pool: SqlitePool) -> sqlx::Result<()> {
    let mut h = harness(pool).await;
    let coordinator = h.graph.coordinator(h.user_id);

    let outcome = coordinator
        .ingest_origin(h.account_a, &origin_event("evt-1", "Strat"))
        .await
        .expect("ingest");
    process_all(&mut h).await;
    assert_eq!(h.provider.event_count("rt-b", "busy-overlay"), 1);

    coordinator.delete_event(&outcome.event.id).await.expect("delete");
    let outcomes = process_all(&mut h).await;
    assert_eq!(outcomes, vec![TaskOutcome::Deleted]);

    // Provider-side absence and registry cleanup
    assert_eq!(h.provider.event_count("rt-b", "busy-overlay"), 0);
    assert!(coordinator
        .list_mirrors(&outcome.event.id)
        .await
        .expect("mirrors")
        .is_empty());

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn drift_reissues_deletes_when_the_write_path_failed(pool: SqlitePool) -> sqlx::Result<()> {
    let mut h = harness(pool).await;
    let coordinator = h.graph.coordinator(h.user_id);

    let outcome = coordinator
        .ingest_origin(h.account_a, &origin_event("evt-1", "Strat"))
        .await
        .expect("ingest");
    process_all(&mut h).await;

    // The delete write fails terminally; the mirror survives provider-side
    h.provider.fail_next_write(InjectedFailure::Terminal);
    coordinator.delete_event(&outcome.event.id).await.expect("delete");
    let outcomes = process_all(&mut h).await;
    assert_eq!(outcomes, vec![TaskOutcome::TerminalFailure]);
    assert_eq!(h.provider.event_count("rt-b", "busy-overlay"), 1);

    // The next drift pass converges to provider-side absence
    let report = h.maintainer.drift_pass().await.expect("drift");
    assert_eq!(report.deletes_reissued, 1);
    let outcomes = process_all(&mut h).await;
    assert_eq!(outcomes, vec![TaskOutcome::Deleted]);
    assert_eq!(h.provider.event_count("rt-b", "busy-overlay"), 0);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn stale_tasks_are_skipped(pool: SqlitePool) -> sqlx::Result<()> {
    let mut h = harness(pool).await;
    let coordinator = h.graph.coordinator(h.user_id);

    coordinator
        .ingest_origin(h.account_a, &origin_event("evt-1", "Strat"))
        .await
        .expect("ingest");
    let create_task = drain(&mut h.write_rx).pop().expect("task");

    // Process it once, then replay the same task: the mirror is already
    // live with this hash, so the duplicate is skipped without a write.
    assert_eq!(h.pipeline.process_task(create_task.clone()).await, TaskOutcome::Written);
    assert_eq!(h.pipeline.process_task(create_task).await, TaskOutcome::SkippedStale);
    assert_eq!(h.provider.event_count("rt-b", "busy-overlay"), 1);

    Ok(())
}
