//! API surface flows: envelope shape, auth gating, webhook verification

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tower::ServiceExt;

use tminus_accounts::{AccountConfig, AccountRegistry, DevelopmentCipher};
use tminus_api::auth::USER_HEADER;
use tminus_api::{AppState, create_router};
use tminus_core::types::{AccountId, ProviderKind, UserId};
use tminus_graph::coordinator::{CoordinatorConfig, CoordinatorRegistry};
use tminus_graph::store::registry;
use tminus_provider::{MemoryProvider, ProviderClient};
use tminus_scheduler::{GroupScheduler, SchedulerConfig};

struct Harness {
    router: Router,
    user_id: UserId,
    poll_rx: mpsc::Receiver<AccountId>,
    channel_token: String,
}

async fn harness(pool: SqlitePool) -> Harness {
    let (write_tx, _write_rx) = mpsc::channel(64);
    let (poll_tx, poll_rx) = mpsc::channel(64);
    let graph = CoordinatorRegistry::new(pool.clone(), CoordinatorConfig::default(), write_tx);
    let scheduler = GroupScheduler::new(pool.clone(), graph.clone(), SchedulerConfig::default());

    let user = registry::create_user(&pool, "Api User", "UTC", "en", "salt-1")
        .await
        .expect("user");

    // One account with a registered webhook channel for token verification
    let provider = MemoryProvider::new();
    let accounts = AccountRegistry::new(
        pool.clone(),
        Arc::new(DevelopmentCipher::new(b"test-key")),
        AccountConfig::default(),
    );
    let record = registry::register_account(&pool, user.id, ProviderKind::Google, "a@gmail", None)
        .await
        .expect("account");
    let coordinator = accounts.coordinator(record, ProviderClient::Memory(provider));
    coordinator.store_refresh_token("rt-a").await.expect("token");
    let channel = coordinator.register_channel("primary").await.expect("channel");

    let state = AppState::new(pool, graph, scheduler, poll_tx);

    Harness {
        router: create_router(state),
        user_id: user.id,
        poll_rx,
        channel_token: channel.token,
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn authed(user_id: UserId, request: Request<Body>) -> Request<Body> {
    let (mut parts, body) = request.into_parts();
    parts
        .headers
        .insert(USER_HEADER, user_id.to_string().parse().expect("header"));
    Request::from_parts(parts, body)
}

#[sqlx::test(migrations = "../../migrations")]
async fn health_check_wears_the_envelope(pool: SqlitePool) -> sqlx::Result<()> {
    let h = harness(pool).await;

    let response = h
        .router
        .oneshot(Request::get("/health").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["data"]["status"], json!("ok"));

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn missing_auth_yields_auth_required(pool: SqlitePool) -> sqlx::Result<()> {
    let h = harness(pool).await;

    let response = h
        .router
        .oneshot(
            Request::get("/api/events")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let body = body_json(response).await;
    assert_eq!(body["ok"], json!(false));
    assert_eq!(body["error_code"], json!("AUTH_REQUIRED"));

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn event_lifecycle_over_http(pool: SqlitePool) -> sqlx::Result<()> {
    let h = harness(pool).await;

    // Create
    let create = Request::post("/api/events")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({
                "title": "Planning",
                "start_at": "2026-03-02T10:00:00Z",
                "end_at": "2026-03-02T11:00:00Z",
                "attendee_emails": ["alice@example.com"],
            })
            .to_string(),
        ))
        .expect("request");
    let response = h
        .router
        .clone()
        .oneshot(authed(h.user_id, create))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let event_id = body["data"]["id"].as_str().expect("event id").to_string();
    // Participant emails never come back, hashes do
    assert!(body["data"]["participant_hashes"][0]
        .as_str()
        .is_some_and(|hash| !hash.contains("alice")));

    // List
    let response = h
        .router
        .clone()
        .oneshot(authed(
            h.user_id,
            Request::get("/api/events").body(Body::empty()).expect("request"),
        ))
        .await
        .expect("response");
    let body = body_json(response).await;
    assert_eq!(body["data"].as_array().expect("array").len(), 1);

    // iCal export
    let response = h
        .router
        .clone()
        .oneshot(authed(
            h.user_id,
            Request::get(format!("/api/events/{event_id}/ical"))
                .body(Body::empty())
                .expect("request"),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert!(String::from_utf8_lossy(&bytes).contains("SUMMARY:Planning"));

    // Delete returns the signed certificate
    let response = h
        .router
        .clone()
        .oneshot(authed(
            h.user_id,
            Request::delete(format!("/api/events/{event_id}"))
                .body(Body::empty())
                .expect("request"),
        ))
        .await
        .expect("response");
    let body = body_json(response).await;
    assert!(body["data"]["signature"].as_str().is_some());

    // Gone afterwards
    let response = h
        .router
        .oneshot(authed(
            h.user_id,
            Request::get(format!("/api/events/{event_id}"))
                .body(Body::empty())
                .expect("request"),
        ))
        .await
        .expect("response");
    let body = body_json(response).await;
    // Tombstoned events still resolve but carry their deletion mark
    assert!(body["data"]["deleted_at"].as_str().is_some());

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn webhook_tokens_gate_poll_signals(pool: SqlitePool) -> sqlx::Result<()> {
    let mut h = harness(pool).await;

    // Unknown token: 401
    let response = h
        .router
        .clone()
        .oneshot(
            Request::post("/webhooks/calendar")
                .header("x-channel-token", "not-a-real-token")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(h.poll_rx.try_recv().is_err());

    // Registered token: accepted, poll signal enqueued
    let response = h
        .router
        .clone()
        .oneshot(
            Request::post("/webhooks/calendar")
                .header("x-goog-channel-token", h.channel_token.clone())
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(h.poll_rx.try_recv().is_ok());

    // Microsoft subscription validation handshake echoes the token
    let response = h
        .router
        .oneshot(
            Request::post("/webhooks/calendar?validationToken=echo-me")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(&bytes[..], b"echo-me");

    Ok(())
}
