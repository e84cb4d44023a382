//! Webhook intake
//!
//! Providers notify us that something changed; the payload itself is never
//! trusted. Verification resolves the channel token to a registered
//! channel, and all we enqueue is "poll this account". Unknown tokens are
//! rejected with 401 and logged.

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use tracing::{info, warn};

use crate::AppState;
use crate::error::ok;

/// Generic channel-token header, plus the Google-specific one
const TOKEN_HEADERS: [&str; 2] = ["x-channel-token", "x-goog-channel-token"];

pub fn routes() -> Router<AppState> {
    Router::new().route("/webhooks/calendar", post(receive_notification))
}

#[derive(Debug, Deserialize)]
struct WebhookQuery {
    /// Microsoft Graph subscription validation handshake
    #[serde(rename = "validationToken")]
    validation_token: Option<String>,
}

async fn receive_notification(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Option<Json<serde_json::Value>>,
) -> axum::response::Response {
    // Graph validates new subscriptions by echo
    if let Some(token) = query.validation_token {
        return (StatusCode::OK, token).into_response();
    }

    let Some(token) = extract_channel_token(&headers, body.as_deref()) else {
        warn!("webhook notification without a channel token rejected");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    if let Some(account_id) = state.channel_cache.get(&token).await {
        if state.poll_tx.send(account_id).await.is_err() {
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
        return ok(serde_json::json!({ "queued": true })).into_response();
    }

    match tminus_accounts::coordinator::verify_channel_token(&state.pool, &token).await {
        Ok(Some(channel)) => {
            info!(account_id = %channel.account_id, "webhook notification accepted");
            state.channel_cache.insert(token, channel.account_id).await;
            if state.poll_tx.send(channel.account_id).await.is_err() {
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
            ok(serde_json::json!({ "queued": true })).into_response()
        }
        Ok(None) => {
            warn!("webhook notification with unknown channel token rejected");
            StatusCode::UNAUTHORIZED.into_response()
        }
        Err(err) => {
            warn!(%err, "webhook token verification failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn extract_channel_token(headers: &HeaderMap, body: Option<&serde_json::Value>) -> Option<String> {
    for header in TOKEN_HEADERS {
        if let Some(token) = headers.get(header).and_then(|v| v.to_str().ok()) {
            return Some(token.to_string());
        }
    }

    // Graph carries the token as clientState in the notification body
    let body = body?;
    if let Some(token) = body["value"][0]["clientState"].as_str() {
        return Some(token.to_string());
    }
    body["clientState"].as_str().map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_extraction_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert("x-goog-channel-token", "header-token".parse().unwrap());
        let body = serde_json::json!({ "value": [{ "clientState": "body-token" }] });

        assert_eq!(
            extract_channel_token(&headers, Some(&body)),
            Some("header-token".to_string())
        );
        assert_eq!(
            extract_channel_token(&HeaderMap::new(), Some(&body)),
            Some("body-token".to_string())
        );
        assert_eq!(extract_channel_token(&HeaderMap::new(), None), None);
    }
}
