//! T-Minus API - Collaborator HTTP surface
//!
//! Thin layer over the coordinators: the uniform envelope, webhook intake
//! with channel-token verification, and the event/policy/session/governance
//! routes. End-user authentication is an external collaborator; it injects
//! the authenticated user id via the `x-tminus-user-id` header, and this
//! crate only enforces webhook tokens and inbound rate limits.

pub mod auth;
pub mod config;
pub mod error;
pub mod ical;
mod rate_limit;
mod routes;

use std::sync::Arc;

use axum::{Router, http::Request};
use moka::future::Cache;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tower_governor::{GovernorLayer, governor::GovernorConfigBuilder};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use tminus_core::types::AccountId;
use tminus_graph::CoordinatorRegistry;
use tminus_scheduler::GroupScheduler;

use crate::rate_limit::{API_BURST_SIZE, API_PERIOD_MS, UserOrIpKeyExtractor};

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub graph: Arc<CoordinatorRegistry>,
    pub scheduler: Arc<GroupScheduler>,
    /// Verified webhook notifications turn into poll signals here
    pub poll_tx: mpsc::Sender<AccountId>,
    /// Verified channel tokens, so webhook bursts skip the store lookup
    pub channel_cache: Cache<String, AccountId>,
}

impl AppState {
    pub fn new(
        pool: SqlitePool,
        graph: Arc<CoordinatorRegistry>,
        scheduler: Arc<GroupScheduler>,
        poll_tx: mpsc::Sender<AccountId>,
    ) -> Self {
        AppState {
            pool,
            graph,
            scheduler,
            poll_tx,
            channel_cache: Cache::builder()
                .time_to_live(std::time::Duration::from_secs(300))
                .max_capacity(10_000)
                .build(),
        }
    }
}

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(routes::health::routes())
        .merge(routes::webhook::routes())
        .nest(
            "/api",
            routes::events::routes()
                .merge(routes::policies::routes())
                .merge(routes::sessions::routes())
                .merge(routes::governance::routes())
                .merge(routes::health::api_routes())
                .layer(GovernorLayer::new(
                    GovernorConfigBuilder::default()
                        .period(std::time::Duration::from_millis(API_PERIOD_MS))
                        .burst_size(API_BURST_SIZE)
                        .key_extractor(UserOrIpKeyExtractor)
                        .finish()
                        .expect("Failed to create API governor config"),
                )),
        )
        .layer(cors)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                tracing::info_span!(
                    "request",
                    method = %request.method(),
                    uri = %request.uri(),
                )
            }),
        )
        .with_state(state)
}

/// Run the API server until the listener fails or the task is aborted
pub async fn run_api(state: AppState, config: &config::Config) -> Result<(), std::io::Error> {
    let app = create_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    tracing::info!("API server listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
}
