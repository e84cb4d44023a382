//! Periodic maintainer
//!
//! Scheduled passes that keep the federation converged: webhook channel
//! renewal, proactive token refresh, drift reconciliation over the mirror
//! registry, hold GC, and stale-session expiry.

use std::sync::Arc;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tminus_accounts::{AccountError, AccountRegistry};
use tminus_core::models::{HoldStatus, MirrorStatus};
use tminus_graph::CoordinatorRegistry;
use tminus_graph::store::registry;
use tminus_provider::ProviderFactory;

use crate::config::WorkerConfig;

/// Counters from one drift pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriftReport {
    pub reprojected: usize,
    pub deletes_reissued: usize,
    pub rows_dropped: usize,
    pub holds_scrubbed: usize,
}

pub struct Maintainer {
    pool: SqlitePool,
    graph: Arc<CoordinatorRegistry>,
    accounts: Arc<AccountRegistry>,
    providers: ProviderFactory,
    config: WorkerConfig,
}

impl Maintainer {
    pub fn new(
        pool: SqlitePool,
        graph: Arc<CoordinatorRegistry>,
        accounts: Arc<AccountRegistry>,
        providers: ProviderFactory,
        config: WorkerConfig,
    ) -> Arc<Self> {
        Arc::new(Maintainer {
            pool,
            graph,
            accounts,
            providers,
            config,
        })
    }

    /// Drive every scheduled job until shutdown
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("maintainer started");
        let mut channel_tick = tokio::time::interval(self.config.channel_renewal_interval);
        let mut token_tick = tokio::time::interval(self.config.token_health_interval);
        let mut drift_tick = tokio::time::interval(self.config.drift_interval);
        let mut hold_tick = tokio::time::interval(self.config.hold_gc_interval);
        let mut session_tick = tokio::time::interval(self.config.session_sweep_interval);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("maintainer shutting down");
                    break;
                }
                _ = channel_tick.tick() => {
                    if let Err(err) = self.renew_channels_pass().await {
                        warn!(%err, "channel renewal pass failed");
                    }
                }
                _ = token_tick.tick() => {
                    if let Err(err) = self.token_health_pass().await {
                        warn!(%err, "token health pass failed");
                    }
                }
                _ = drift_tick.tick() => {
                    match self.drift_pass().await {
                        Ok(report) => debug!(?report, "drift pass complete"),
                        Err(err) => warn!(%err, "drift pass failed"),
                    }
                }
                _ = hold_tick.tick() => {
                    if let Err(err) = self.hold_gc_pass().await {
                        warn!(%err, "hold gc pass failed");
                    }
                }
                _ = session_tick.tick() => {
                    if let Err(err) = self.stale_session_pass().await {
                        warn!(%err, "stale session pass failed");
                    }
                }
            }
        }
    }

    /// Renew every webhook channel within the renewal threshold
    pub async fn renew_channels_pass(&self) -> anyhow::Result<usize> {
        let mut renewed = 0;
        for account in registry::list_accounts(&self.pool).await? {
            if !account.provider.supports_writes() {
                continue;
            }
            let client = self.providers.client_for(account.provider);
            let coordinator = self.accounts.coordinator(account.clone(), client);
            match coordinator.renew_channels().await {
                Ok(count) => renewed += count,
                Err(AccountError::NoCredentials) => {}
                Err(err) => {
                    warn!(account_id = %account.account_id, %err, "channel renewal failed");
                }
            }
        }
        Ok(renewed)
    }

    /// Proactively mint tokens so webhook-triggered polls never wait on a
    /// cold refresh.
    pub async fn token_health_pass(&self) -> anyhow::Result<usize> {
        let mut refreshed = 0;
        for account in registry::list_accounts(&self.pool).await? {
            let client = self.providers.client_for(account.provider);
            let coordinator = self.accounts.coordinator(account.clone(), client);
            match coordinator.get_access_token().await {
                Ok(_) => refreshed += 1,
                Err(AccountError::NoCredentials) => {}
                Err(err) => {
                    warn!(account_id = %account.account_id, %err, "token health check failed");
                }
            }
        }
        Ok(refreshed)
    }

    /// Walk every user's mirror registry and repair discrepancies:
    /// error/stuck rows re-project, rows for deleted canonicals get their
    /// provider-side deletes re-issued, released holds get scrubbed.
    pub async fn drift_pass(&self) -> anyhow::Result<DriftReport> {
        let mut report = DriftReport::default();

        for user_id in registry::list_users(&self.pool).await? {
            let coordinator = self.graph.coordinator(user_id);
            let stuck_cutoff = chrono::Utc::now()
                - chrono::Duration::from_std(self.config.drift_interval)
                    .unwrap_or_else(|_| chrono::Duration::hours(24));

            for mirror in coordinator.all_mirrors().await? {
                let event = match coordinator.get_event(&mirror.canonical_id).await {
                    Ok(event) => event,
                    Err(_) => {
                        coordinator.dispatch_mirror_delete(&mirror).await?;
                        report.rows_dropped += 1;
                        continue;
                    }
                };

                if event.deleted_at.is_some() {
                    coordinator.dispatch_mirror_delete(&mirror).await?;
                    report.deletes_reissued += 1;
                    continue;
                }

                let needs_repair = mirror.status == MirrorStatus::Error
                    || (mirror.status == MirrorStatus::Pending
                        && mirror.updated_at < stuck_cutoff);
                if needs_repair
                    && coordinator
                        .reproject(&mirror.canonical_id, mirror.policy_edge_id, true)
                        .await?
                {
                    report.reprojected += 1;
                }
            }

            report.holds_scrubbed += coordinator.scrub_released_holds().await?;
        }

        Ok(report)
    }

    /// Release expired holds and expire sessions whose holds are all
    /// terminal.
    pub async fn hold_gc_pass(&self) -> anyhow::Result<usize> {
        let mut released = 0;
        for user_id in registry::list_users(&self.pool).await? {
            let coordinator = self.graph.coordinator(user_id);
            for hold in coordinator.get_expired_holds().await? {
                coordinator
                    .update_hold_status(hold.id, HoldStatus::Released)
                    .await?;
                released += 1;
                coordinator
                    .expire_session_if_all_holds_terminal(hold.session_id)
                    .await?;
            }
        }
        Ok(released)
    }

    /// Expire sessions past the stale age for every user
    pub async fn stale_session_pass(&self) -> anyhow::Result<usize> {
        let mut expired = 0;
        for user_id in registry::list_users(&self.pool).await? {
            let coordinator = self.graph.coordinator(user_id);
            expired += coordinator
                .expire_stale_sessions(self.config.stale_session_age)
                .await?;
        }
        Ok(expired)
    }
}
