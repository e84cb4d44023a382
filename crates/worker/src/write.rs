//! Write pipeline
//!
//! Fans the coordinator's write tasks out into one ordered queue per
//! target account. Each account has a single consumer, so writes for the
//! same canonical event are processed in journal order; distinct accounts
//! proceed in parallel. Transient failures retry with exponential backoff
//! up to a ceiling, then flag the mirror for drift repair; terminal
//! failures journal and drop.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tminus_accounts::{AccountCoordinator, AccountError, AccountRegistry};
use tminus_core::models::HoldStatus;
use tminus_core::projection::WriteOp;
use tminus_core::types::AccountId;
use tminus_graph::CoordinatorRegistry;
use tminus_graph::store::{events, mirrors, registry, sessions};
use tminus_graph::tasks::{WritePurpose, WriteTask};
use tminus_provider::{CalendarApi, ProviderClient, ProviderError, ProviderFactory, WrittenEvent};

use crate::config::WorkerConfig;

/// What happened to one dequeued task (logged, asserted on in tests)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Written,
    Deleted,
    SkippedStale,
    ExhaustedRetries,
    TerminalFailure,
}

pub struct WritePipeline {
    pool: SqlitePool,
    graph: Arc<CoordinatorRegistry>,
    accounts: Arc<AccountRegistry>,
    providers: ProviderFactory,
    config: WorkerConfig,
}

impl WritePipeline {
    pub fn new(
        pool: SqlitePool,
        graph: Arc<CoordinatorRegistry>,
        accounts: Arc<AccountRegistry>,
        providers: ProviderFactory,
        config: WorkerConfig,
    ) -> Arc<Self> {
        Arc::new(WritePipeline {
            pool,
            graph,
            accounts,
            providers,
            config,
        })
    }

    /// Fan tasks out into per-account ordered queues until shutdown, then
    /// drain the consumers.
    pub async fn run(
        self: Arc<Self>,
        mut task_rx: mpsc::Receiver<WriteTask>,
        shutdown: CancellationToken,
    ) {
        info!("write pipeline started");
        let mut queues: HashMap<AccountId, mpsc::Sender<WriteTask>> = HashMap::new();
        let mut consumers = JoinSet::new();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("write pipeline draining");
                    break;
                }
                task = task_rx.recv() => {
                    let Some(task) = task else { break };
                    let account_id = task.target_account_id;
                    let sender = queues.entry(account_id).or_insert_with(|| {
                        let (tx, rx) = mpsc::channel(self.config.per_account_queue);
                        let pipeline = self.clone();
                        consumers.spawn(async move {
                            pipeline.consume_account(account_id, rx).await;
                        });
                        tx
                    });
                    if sender.send(task).await.is_err() {
                        warn!(%account_id, "account write queue closed");
                    }
                }
            }
        }

        drop(queues);
        while consumers.join_next().await.is_some() {}
        info!("write pipeline stopped");
    }

    async fn consume_account(self: Arc<Self>, account_id: AccountId, mut rx: mpsc::Receiver<WriteTask>) {
        while let Some(task) = rx.recv().await {
            let outcome = self.process_task(task).await;
            debug!(%account_id, ?outcome, "write task processed");
        }
    }

    /// Process one task to a final outcome, retries included
    pub async fn process_task(&self, task: WriteTask) -> TaskOutcome {
        if !task.is_coherent() {
            warn!(op = ?task.op, "incoherent write task dropped");
            return TaskOutcome::SkippedStale;
        }

        match self.process_with_retry(&task).await {
            Ok(outcome) => outcome,
            Err(failure) => {
                self.record_failure(&task, &failure).await;
                match failure {
                    WriteFailure::Exhausted(_) => TaskOutcome::ExhaustedRetries,
                    _ => TaskOutcome::TerminalFailure,
                }
            }
        }
    }

    async fn process_with_retry(&self, task: &WriteTask) -> Result<TaskOutcome, WriteFailure> {
        let mut attempt: u32 = 0;
        let mut refreshed = false;

        loop {
            match self.process_once(task).await {
                Ok(outcome) => return Ok(outcome),
                Err(WriteFailure::Auth(reason)) if !refreshed => {
                    // Provider rejected the token: force one refresh, then
                    // one more try.
                    debug!(%reason, "access token rejected; forcing refresh");
                    refreshed = true;
                    let account = registry::get_account(&self.pool, task.target_account_id)
                        .await
                        .map_err(|e| WriteFailure::Terminal(e.to_string()))?;
                    let coordinator = self.account_coordinator(&account);
                    coordinator
                        .force_refresh()
                        .await
                        .map_err(|e| WriteFailure::Terminal(e.to_string()))?;
                }
                Err(WriteFailure::Transient(reason)) => {
                    if attempt >= self.config.max_retries {
                        return Err(WriteFailure::Exhausted(reason));
                    }
                    let backoff = self.config.base_backoff * 2u32.saturating_pow(attempt);
                    debug!(%reason, attempt, ?backoff, "transient write failure; backing off");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn process_once(&self, task: &WriteTask) -> Result<TaskOutcome, WriteFailure> {
        if self.is_stale(task).await? {
            return Ok(TaskOutcome::SkippedStale);
        }

        let account = registry::get_account(&self.pool, task.target_account_id)
            .await
            .map_err(|e| WriteFailure::Terminal(e.to_string()))?;
        if !account.provider.supports_writes() {
            return Err(WriteFailure::Terminal(format!(
                "provider {} is read-only",
                account.provider
            )));
        }

        let client = self.providers.client_for(account.provider);
        let coordinator = self.accounts.coordinator(account.clone(), client.clone());
        let access_token = coordinator.get_access_token().await.map_err(map_account_err)?;

        let calendar_id = match self.known_calendar(task).await? {
            Some(calendar_id) => calendar_id,
            None => {
                coordinator.acquire_call_slot().await;
                self.deadline(client.resolve_calendar(&access_token, task.calendar_kind))
                    .await??
            }
        };

        coordinator.acquire_call_slot().await;
        match task.op {
            WriteOp::Create => {
                let payload = task.payload.as_ref().expect("coherent create has payload");
                let written = self
                    .deadline(client.create_event(&access_token, &calendar_id, payload))
                    .await??;
                self.confirm_write(task, &written).await?;
                Ok(TaskOutcome::Written)
            }
            WriteOp::Patch => {
                let payload = task.payload.as_ref().expect("coherent patch has payload");
                let remote_id = task.remote_mirror_id.as_deref().expect("coherent patch has remote id");
                let written = self
                    .deadline(client.patch_event(&access_token, &calendar_id, remote_id, payload))
                    .await??;
                self.confirm_write(task, &written).await?;
                Ok(TaskOutcome::Written)
            }
            WriteOp::Delete => {
                let remote_id = task.remote_mirror_id.as_deref().expect("coherent delete has remote id");
                self.deadline(client.delete_event(&access_token, &calendar_id, remote_id))
                    .await??;
                self.confirm_delete(task).await?;
                Ok(TaskOutcome::Deleted)
            }
        }
    }

    /// Patches and deletes must land in the calendar the mirror was
    /// actually written to; only first creates resolve by kind.
    async fn known_calendar(&self, task: &WriteTask) -> Result<Option<String>, WriteFailure> {
        if task.purpose != WritePurpose::Mirror || task.op == WriteOp::Create {
            return Ok(None);
        }
        let (Some(canonical_id), Some(edge_id)) = (task.canonical_id.as_ref(), task.policy_edge_id)
        else {
            return Ok(None);
        };
        let mirror = mirrors::get(&self.pool, canonical_id, task.target_account_id, edge_id)
            .await
            .map_err(|e| WriteFailure::Terminal(e.to_string()))?;
        Ok(mirror.and_then(|m| m.target_calendar_id))
    }

    /// Work can go stale between enqueue and dequeue (event deleted,
    /// session cancelled, mirror already up to date); skip instead of
    /// writing garbage.
    async fn is_stale(&self, task: &WriteTask) -> Result<bool, WriteFailure> {
        match &task.purpose {
            WritePurpose::Mirror => {
                let Some(canonical_id) = task.canonical_id.as_ref() else {
                    return Ok(true);
                };
                let Some(edge_id) = task.policy_edge_id else {
                    return Ok(true);
                };
                let mirror = mirrors::get(&self.pool, canonical_id, task.target_account_id, edge_id)
                    .await
                    .map_err(|e| WriteFailure::Terminal(e.to_string()))?;
                let Some(mirror) = mirror else {
                    return Ok(true);
                };

                if task.op == WriteOp::Delete {
                    return Ok(false);
                }

                // Canonical tombstoned since enqueue: the delete task is
                // (or will be) in the queue behind us.
                let event = events::get_event(&self.pool, task.user_id, canonical_id)
                    .await
                    .map_err(|e| WriteFailure::Terminal(e.to_string()))?;
                if event.deleted_at.is_some() {
                    return Ok(true);
                }

                // Already written with this exact content
                Ok(mirror.last_written_hash.as_deref() == Some(task.content_hash.as_str())
                    && mirror.status == tminus_core::models::MirrorStatus::Live)
            }
            WritePurpose::HoldPlace { hold_id } => {
                let hold = sessions::get_hold(&self.pool, *hold_id)
                    .await
                    .map_err(|e| WriteFailure::Terminal(e.to_string()))?;
                Ok(hold.status != HoldStatus::Held || hold.provider_mirror_id.is_some())
            }
            WritePurpose::HoldConvert { hold_id } => {
                let hold = sessions::get_hold(&self.pool, *hold_id)
                    .await
                    .map_err(|e| WriteFailure::Terminal(e.to_string()))?;
                Ok(hold.status != HoldStatus::Committed)
            }
            WritePurpose::HoldRemove { .. } => Ok(false),
        }
    }

    async fn confirm_write(&self, task: &WriteTask, written: &WrittenEvent) -> Result<(), WriteFailure> {
        let coordinator = self.graph.coordinator(task.user_id);
        match &task.purpose {
            WritePurpose::Mirror => {
                let canonical_id = task.canonical_id.as_ref().expect("mirror task has canonical");
                let edge_id = task.policy_edge_id.expect("mirror task has edge");
                coordinator
                    .mark_mirror_written(
                        canonical_id,
                        task.target_account_id,
                        edge_id,
                        &task.content_hash,
                        &written.remote_id,
                        &written.calendar_id,
                    )
                    .await
                    .map_err(|e| WriteFailure::Terminal(e.to_string()))
            }
            WritePurpose::HoldPlace { hold_id } => coordinator
                .set_hold_mirror(*hold_id, Some(&written.remote_id))
                .await
                .map_err(|e| WriteFailure::Terminal(e.to_string())),
            WritePurpose::HoldConvert { .. } => Ok(()),
            WritePurpose::HoldRemove { .. } => Ok(()),
        }
    }

    async fn confirm_delete(&self, task: &WriteTask) -> Result<(), WriteFailure> {
        let coordinator = self.graph.coordinator(task.user_id);
        match &task.purpose {
            WritePurpose::Mirror => {
                let canonical_id = task.canonical_id.as_ref().expect("mirror task has canonical");
                let edge_id = task.policy_edge_id.expect("mirror task has edge");
                coordinator
                    .mirror_removed(canonical_id, task.target_account_id, edge_id)
                    .await
                    .map_err(|e| WriteFailure::Terminal(e.to_string()))
            }
            WritePurpose::HoldRemove { hold_id } => coordinator
                .set_hold_mirror(*hold_id, None)
                .await
                .map_err(|e| WriteFailure::Terminal(e.to_string())),
            _ => Ok(()),
        }
    }

    /// Terminal and retry-exhausted failures: flag the mirror so drift
    /// reconciliation repairs it; terminal ones also journal.
    async fn record_failure(&self, task: &WriteTask, failure: &WriteFailure) {
        warn!(purpose = ?task.purpose, %failure, "write task failed");

        if task.purpose != WritePurpose::Mirror {
            return;
        }
        let (Some(canonical_id), Some(edge_id)) = (task.canonical_id.as_ref(), task.policy_edge_id)
        else {
            return;
        };

        let terminal = !matches!(failure, WriteFailure::Exhausted(_));
        let coordinator = self.graph.coordinator(task.user_id);
        if let Err(err) = coordinator
            .mark_mirror_error(
                canonical_id,
                task.target_account_id,
                edge_id,
                &failure.to_string(),
                terminal,
            )
            .await
        {
            warn!(%err, "failed to record mirror write failure");
        }
    }

    fn account_coordinator(&self, account: &tminus_core::models::AccountRecord) -> AccountCoordinator {
        let client: ProviderClient = self.providers.client_for(account.provider);
        self.accounts.coordinator(account.clone(), client)
    }

    async fn deadline<T>(
        &self,
        fut: impl Future<Output = Result<T, ProviderError>>,
    ) -> Result<Result<T, WriteFailure>, WriteFailure> {
        match tokio::time::timeout(self.config.call_deadline, fut).await {
            Ok(result) => Ok(result.map_err(map_provider_err)),
            Err(_) => Err(WriteFailure::Transient("provider call deadline exceeded".into())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum WriteFailure {
    #[error("transient: {0}")]
    Transient(String),
    #[error("retries exhausted: {0}")]
    Exhausted(String),
    #[error("auth: {0}")]
    Auth(String),
    #[error("terminal: {0}")]
    Terminal(String),
}

fn map_provider_err(err: ProviderError) -> WriteFailure {
    match err {
        ProviderError::Auth(reason) => WriteFailure::Auth(reason),
        ProviderError::RateLimited => WriteFailure::Transient("rate limited".into()),
        ProviderError::Transient(reason) => WriteFailure::Transient(reason),
        ProviderError::CursorInvalidated => {
            WriteFailure::Terminal("cursor invalidated outside a list call".into())
        }
        ProviderError::Terminal(reason) => WriteFailure::Terminal(reason),
    }
}

fn map_account_err(err: AccountError) -> WriteFailure {
    if err.is_transient() {
        WriteFailure::Transient(err.to_string())
    } else {
        WriteFailure::Terminal(err.to_string())
    }
}
