//! T-Minus unified server
//!
//! Spawns the API surface, the sync and write pipelines, and the periodic
//! maintainer over one shared store, with token-coordinated graceful
//! shutdown.

use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tminus_accounts::{AccountConfig, AccountRegistry, DevelopmentCipher};
use tminus_graph::coordinator::{CoordinatorConfig, CoordinatorRegistry};
use tminus_provider::{GoogleClient, MemoryProvider, MicrosoftClient, ProviderFactory};
use tminus_scheduler::{GroupScheduler, SchedulerConfig};
use tminus_sync::{SyncConfig, SyncPipeline};
use tminus_worker::{Maintainer, WorkerConfig, WritePipeline};

mod config;

use config::{ProviderSettings, UnifiedConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tminus_shared::init_env();
    let _guard = tminus_shared::init_tracing("tminus-server");

    tracing::info!("starting T-Minus server");
    let config = UnifiedConfig::from_env()?;
    let pool = tminus_shared::init_db(&config.core).await?;

    let (write_tx, write_rx) = mpsc::channel(config.write_channel_depth);
    let (poll_tx, poll_rx) = mpsc::channel(config.poll_channel_depth);

    let graph = CoordinatorRegistry::new(
        pool.clone(),
        CoordinatorConfig {
            signing_key: config.core.signing_key.as_bytes().to_vec(),
            ..CoordinatorConfig::default()
        },
        write_tx,
    );
    let accounts = AccountRegistry::new(
        pool.clone(),
        Arc::new(DevelopmentCipher::new(config.core.signing_key.as_bytes())),
        AccountConfig::default(),
    );
    let providers = build_providers(&config.providers);
    let scheduler = GroupScheduler::new(pool.clone(), graph.clone(), SchedulerConfig::default());

    let worker_config = WorkerConfig::from_env()?;
    let sync_config = SyncConfig::default();

    let shutdown = CancellationToken::new();

    // Write pipeline
    let write_pipeline = WritePipeline::new(
        pool.clone(),
        graph.clone(),
        accounts.clone(),
        providers.clone(),
        worker_config.clone(),
    );
    let write_handle = tokio::spawn(write_pipeline.run(write_rx, shutdown.clone()));

    // Sync pipeline plus its periodic scan
    let sync_pipeline = SyncPipeline::new(
        pool.clone(),
        graph.clone(),
        accounts.clone(),
        providers.clone(),
        sync_config.clone(),
    );
    let sync_handle = tokio::spawn(sync_pipeline.clone().run(poll_rx, shutdown.clone()));
    let scan_handle = tokio::spawn(run_periodic_scan(
        sync_pipeline,
        poll_tx.clone(),
        sync_config.scan_interval,
        shutdown.clone(),
    ));

    // Maintainer
    let maintainer = Maintainer::new(
        pool.clone(),
        graph.clone(),
        accounts.clone(),
        providers,
        worker_config,
    );
    let maintainer_handle = tokio::spawn(maintainer.run(shutdown.clone()));

    // API surface
    let api_state = tminus_api::AppState::new(pool, graph, scheduler, poll_tx);
    let api_config = config.api.clone();
    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        tokio::select! {
            result = tminus_api::run_api(api_state, &api_config) => {
                if let Err(err) = result {
                    tracing::error!(%err, "API server exited");
                }
            }
            () = api_shutdown.cancelled() => {
                tracing::info!("API server shutting down");
            }
        }
    });

    tracing::info!("all services started");
    wait_for_shutdown().await;
    tracing::info!("shutdown signal received");

    shutdown.cancel();
    let _ = tokio::join!(
        api_handle,
        sync_handle,
        scan_handle,
        write_handle,
        maintainer_handle
    );

    tracing::info!("all services stopped");
    Ok(())
}

fn build_providers(settings: &ProviderSettings) -> ProviderFactory {
    match settings {
        ProviderSettings::Real {
            google_client_id,
            google_client_secret,
            microsoft_client_id,
            microsoft_client_secret,
            webhook_address,
        } => ProviderFactory::new(
            GoogleClient::new(
                google_client_id.clone(),
                google_client_secret.clone(),
                webhook_address.clone(),
            ),
            MicrosoftClient::new(
                microsoft_client_id.clone(),
                microsoft_client_secret.clone(),
                webhook_address.clone(),
            ),
        ),
        ProviderSettings::InMemory => {
            tracing::warn!("running against the in-memory provider; nothing reaches real calendars");
            ProviderFactory::in_memory(MemoryProvider::new())
        }
    }
}

/// Enqueue a poll for every account on a fixed cadence, starting with one
/// pass at startup.
async fn run_periodic_scan(
    pipeline: Arc<SyncPipeline>,
    poll_tx: mpsc::Sender<tminus_core::types::AccountId>,
    interval: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut tick = tokio::time::interval(interval);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = tick.tick() => {
                match pipeline.enqueue_all_accounts(&poll_tx).await {
                    Ok(count) => tracing::debug!(count, "periodic scan enqueued"),
                    Err(err) => tracing::warn!(%err, "periodic scan failed"),
                }
            }
        }
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
