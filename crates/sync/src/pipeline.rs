//! Sync pipeline
//!
//! One poll per signal: fetch incremental changes (full list on cursor
//! invalidation), normalize, classify, ingest origin events, and record
//! drift findings for managed ones. Failures stay scoped to the account
//! that produced them; the health counters carry the news.

use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tminus_accounts::{AccountCoordinator, AccountRegistry};
use tminus_core::classify::{EventClass, classify};
use tminus_core::error::GraphError;
use tminus_core::models::{
    AccountRecord, CalendarKind, ChangeKind, DetailLevel, MirrorTags, NormalizedEvent,
};
use tminus_core::security::{canonical_json_hash, format_instant_ms};
use tminus_core::types::{AccountId, ProviderKind};
use tminus_graph::CoordinatorRegistry;
use tminus_graph::UserGraphCoordinator;
use tminus_graph::store::{mirrors, policies, registry};
use tminus_provider::{CalendarApi, ChangePage, ProviderClient, ProviderError, ProviderFactory};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Cadence of the scheduled scan over all accounts
    pub scan_interval: std::time::Duration,
    /// Deadline for a single provider call
    pub call_deadline: std::time::Duration,
    /// Budget for a full (non-incremental) sync of one account
    pub full_sync_budget: std::time::Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            scan_interval: std::time::Duration::from_secs(15 * 60),
            call_deadline: std::time::Duration::from_secs(30),
            full_sync_budget: std::time::Duration::from_secs(5 * 60),
        }
    }
}

/// Counters for one poll, logged and asserted on in tests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub managed_own: usize,
    pub foreign: usize,
    pub orphans: usize,
    pub hold_echoes: usize,
    pub drift_findings: usize,
    pub skipped: usize,
}

pub struct SyncPipeline {
    pool: SqlitePool,
    graph: Arc<CoordinatorRegistry>,
    accounts: Arc<AccountRegistry>,
    providers: ProviderFactory,
    config: SyncConfig,
}

impl SyncPipeline {
    pub fn new(
        pool: SqlitePool,
        graph: Arc<CoordinatorRegistry>,
        accounts: Arc<AccountRegistry>,
        providers: ProviderFactory,
        config: SyncConfig,
    ) -> Arc<Self> {
        Arc::new(SyncPipeline {
            pool,
            graph,
            accounts,
            providers,
            config,
        })
    }

    /// Drain poll signals until shutdown. Webhook intake and the periodic
    /// scan both feed the same channel.
    pub async fn run(
        self: Arc<Self>,
        mut poll_rx: mpsc::Receiver<AccountId>,
        shutdown: CancellationToken,
    ) {
        info!("sync pipeline started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("sync pipeline shutting down");
                    break;
                }
                signal = poll_rx.recv() => {
                    let Some(account_id) = signal else { break };
                    if let Err(err) = self.poll_account(account_id).await {
                        warn!(%account_id, %err, "account poll failed");
                    }
                }
            }
        }
    }

    /// Enqueue a poll for every registered account (periodic scan and
    /// startup backfill).
    pub async fn enqueue_all_accounts(
        &self,
        poll_tx: &mpsc::Sender<AccountId>,
    ) -> anyhow::Result<usize> {
        let accounts = registry::list_accounts(&self.pool).await?;
        let count = accounts.len();
        for account in accounts {
            poll_tx.send(account.account_id).await?;
        }
        Ok(count)
    }

    /// Poll one account end to end, updating its sync health either way
    pub async fn poll_account(&self, account_id: AccountId) -> anyhow::Result<SyncStats> {
        let account = registry::get_account(&self.pool, account_id).await?;
        let client = self.providers.client_for(account.provider);
        let coordinator = self.accounts.coordinator(account.clone(), client.clone());

        match self.poll_inner(&account, &client, &coordinator).await {
            Ok(stats) => {
                coordinator.mark_sync_success(Utc::now()).await?;
                debug!(%account_id, ?stats, "account polled");
                Ok(stats)
            }
            Err(err) => {
                if let Err(health_err) = coordinator.mark_sync_failure(&err.to_string()).await {
                    warn!(%account_id, %health_err, "failed to record sync failure");
                }
                Err(err)
            }
        }
    }

    async fn poll_inner(
        &self,
        account: &AccountRecord,
        client: &ProviderClient,
        coordinator: &AccountCoordinator,
    ) -> anyhow::Result<SyncStats> {
        let access_token = coordinator.get_access_token().await?;
        let calendars = self.watched_calendars(account, client, &access_token).await?;

        let mut stats = SyncStats::default();
        let mut last_cursor = None;
        for calendar_id in &calendars {
            let page = self
                .fetch_changes(client, coordinator, &access_token, calendar_id)
                .await?;
            last_cursor = page.next_cursor.clone();
            let page_stats = self
                .process_page(account, coordinator, page.events, page.removed)
                .await?;
            merge_stats(&mut stats, page_stats);
        }

        // One cursor per account: providers scope sync tokens account-wide
        // here, and the overlay shares the primary's change feed revision.
        if let Some(cursor) = last_cursor {
            coordinator.set_sync_cursor(Some(&cursor)).await?;
        }
        Ok(stats)
    }

    /// Calendars this account is watched on: the primary plus, where
    /// writes are supported, the busy overlay (our own mirrors echo back
    /// through it).
    async fn watched_calendars(
        &self,
        account: &AccountRecord,
        client: &ProviderClient,
        access_token: &str,
    ) -> anyhow::Result<Vec<String>> {
        if account.provider == ProviderKind::Ics {
            // The feed URL is the account's remote identity
            return Ok(vec![account.remote_id.clone()]);
        }

        let primary = tokio::time::timeout(
            self.config.call_deadline,
            client.resolve_calendar(access_token, CalendarKind::PrimaryMirror),
        )
        .await
        .map_err(|_| anyhow::anyhow!("resolve_calendar deadline exceeded"))??;

        let overlay = tokio::time::timeout(
            self.config.call_deadline,
            client.resolve_calendar(access_token, CalendarKind::BusyOverlay),
        )
        .await
        .map_err(|_| anyhow::anyhow!("resolve_calendar deadline exceeded"))??;

        Ok(vec![primary, overlay])
    }

    async fn fetch_changes(
        &self,
        client: &ProviderClient,
        coordinator: &AccountCoordinator,
        access_token: &str,
        calendar_id: &str,
    ) -> anyhow::Result<ChangePage> {
        if let Some(cursor) = coordinator.get_sync_cursor().await? {
            let attempt = tokio::time::timeout(
                self.config.call_deadline,
                client.incremental_list(access_token, calendar_id, &cursor),
            )
            .await
            .map_err(|_| anyhow::anyhow!("incremental list deadline exceeded"))?;

            match attempt {
                Ok(page) => return Ok(page),
                Err(ProviderError::CursorInvalidated) => {
                    info!(%calendar_id, "sync cursor invalidated; falling back to full list");
                }
                Err(err) => return Err(err.into()),
            }
        }

        let page = tokio::time::timeout(
            self.config.full_sync_budget,
            client.full_list(access_token, calendar_id),
        )
        .await
        .map_err(|_| anyhow::anyhow!("full sync budget exceeded"))??;
        Ok(page)
    }

    async fn process_page(
        &self,
        account: &AccountRecord,
        account_coordinator: &AccountCoordinator,
        events: Vec<NormalizedEvent>,
        removed: Vec<String>,
    ) -> anyhow::Result<SyncStats> {
        let coordinator = self.graph.coordinator(account.user_id);
        let registered_edges = coordinator.registered_edge_ids().await?;
        let mut stats = SyncStats::default();

        for event in events {
            // Tentative hold reservations are registry-known; they never
            // reach the classifier.
            if coordinator
                .find_hold_by_mirror(account.account_id, &event.remote_id)
                .await?
                .is_some()
            {
                stats.hold_echoes += 1;
                continue;
            }

            let classification = classify(&event, account.user_id, &registered_edges);
            match classification.class {
                EventClass::Origin => {
                    match coordinator.ingest_origin(account.account_id, &event).await {
                        Ok(outcome) => match outcome.change {
                            Some(ChangeKind::Created) => stats.created += 1,
                            Some(_) => stats.updated += 1,
                            None => stats.unchanged += 1,
                        },
                        Err(GraphError::Validation(reason)) => {
                            warn!(remote_id = %event.remote_id, %reason, "unusable origin event skipped");
                            stats.skipped += 1;
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                EventClass::ManagedOwn(tags) => {
                    stats.managed_own += 1;
                    if self.check_drift(&coordinator, account, &tags, &event).await? {
                        stats.drift_findings += 1;
                    }
                }
                EventClass::ManagedForeign => stats.foreign += 1,
                EventClass::ManagedOrphan(_) => {
                    stats.orphans += 1;
                    account_coordinator.record_orphan_sighting().await?;
                }
            }
        }

        for remote_id in removed {
            if let Some(hold) = coordinator
                .find_hold_by_mirror(account.account_id, &remote_id)
                .await?
            {
                // The tentative reservation is already gone provider-side
                coordinator.set_hold_mirror(hold.id, None).await?;
                continue;
            }
            if coordinator
                .origin_removed(account.account_id, &remote_id)
                .await?
                .is_some()
            {
                stats.removed += 1;
                continue;
            }
            if coordinator
                .mirror_vanished(account.account_id, &remote_id)
                .await?
            {
                stats.drift_findings += 1;
            }
        }

        Ok(stats)
    }

    /// Compare the provider-side content of a managed-own event against
    /// the hash we last wrote; any difference is a drift finding.
    async fn check_drift(
        &self,
        coordinator: &UserGraphCoordinator,
        account: &AccountRecord,
        tags: &MirrorTags,
        event: &NormalizedEvent,
    ) -> anyhow::Result<bool> {
        let Some(mirror) = mirrors::get(
            &self.pool,
            &tags.canonical_id,
            account.account_id,
            tags.policy_edge_id,
        )
        .await?
        else {
            return Ok(false);
        };
        let Some(expected) = mirror.last_written_hash.as_deref() else {
            return Ok(false);
        };

        let calendar_kind = policies::get(&self.pool, tags.policy_edge_id)
            .await?
            .map_or(CalendarKind::BusyOverlay, |e| e.calendar_kind);
        let observed = observed_content_hash(event, mirror.detail_level, calendar_kind);

        if observed != expected {
            coordinator
                .record_drift(tags, account.account_id, &observed)
                .await?;
            return Ok(true);
        }
        Ok(false)
    }
}

/// Hash of the content actually sitting provider-side, computed with the
/// same recipe the projection compiler uses so the two are comparable.
pub fn observed_content_hash(
    event: &NormalizedEvent,
    detail: DetailLevel,
    calendar_kind: CalendarKind,
) -> String {
    canonical_json_hash(&serde_json::json!({
        "title": event.title,
        "description": event.description,
        "location": event.location,
        "start": format_instant_ms(event.start_at),
        "end": format_instant_ms(event.end_at),
        "all_day": event.all_day,
        "status": event.status,
        "transparency": event.transparency,
        "rrule": event.rrule,
        "detail": detail,
        "calendar_kind": calendar_kind,
    }))
}

fn merge_stats(into: &mut SyncStats, from: SyncStats) {
    into.created += from.created;
    into.updated += from.updated;
    into.unchanged += from.unchanged;
    into.removed += from.removed;
    into.managed_own += from.managed_own;
    into.foreign += from.foreign;
    into.orphans += from.orphans;
    into.hold_echoes += from.hold_echoes;
    into.drift_findings += from.drift_findings;
    into.skipped += from.skipped;
}
