//! Google Calendar client
//!
//! Mirror tags ride in `extendedProperties.private`. The key names are
//! pinned; renaming them would orphan every mirror already written.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::{Value, json};

use tminus_core::models::{
    CalendarKind, EventStatus, MirrorPayload, NormalizedEvent, RawMirrorTags, Transparency,
};
use tminus_core::security::format_instant_ms;

use crate::api::{CalendarApi, ChangePage, ChannelRegistration, MintedToken, WrittenEvent};
use crate::error::{ProviderError, ProviderResult, classify_status};

pub const TAG_CANONICAL_ID: &str = "tminus_canonical_id";
pub const TAG_OWNER_ID: &str = "tminus_owner_id";
pub const TAG_EDGE_ID: &str = "tminus_edge_id";
pub const TAG_CONTENT_HASH: &str = "tminus_content_hash";

/// Summary of the auto-provisioned side calendar for BUSY mirrors
pub const BUSY_OVERLAY_SUMMARY: &str = "T-Minus Busy";

const DEFAULT_API_BASE: &str = "https://www.googleapis.com/calendar/v3";
const DEFAULT_AUTH_BASE: &str = "https://oauth2.googleapis.com";

#[derive(Debug, Clone)]
pub struct GoogleClient {
    http: reqwest::Client,
    api_base: String,
    auth_base: String,
    client_id: String,
    client_secret: String,
    webhook_address: String,
}

impl GoogleClient {
    pub fn new(client_id: String, client_secret: String, webhook_address: String) -> Self {
        Self::with_base_urls(
            client_id,
            client_secret,
            webhook_address,
            DEFAULT_API_BASE.to_string(),
            DEFAULT_AUTH_BASE.to_string(),
        )
    }

    /// Overridable endpoints, for tests against a local stub
    pub fn with_base_urls(
        client_id: String,
        client_secret: String,
        webhook_address: String,
        api_base: String,
        auth_base: String,
    ) -> Self {
        GoogleClient {
            http: reqwest::Client::new(),
            api_base,
            auth_base,
            client_id,
            client_secret,
            webhook_address,
        }
    }

    async fn list_page(
        &self,
        access_token: &str,
        calendar_id: &str,
        cursor: Option<&str>,
        page_token: Option<&str>,
    ) -> ProviderResult<Value> {
        let url = format!("{}/calendars/{}/events", self.api_base, calendar_id);
        let mut request = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .query(&[("maxResults", "250"), ("showDeleted", "true")]);
        if let Some(cursor) = cursor {
            request = request.query(&[("syncToken", cursor)]);
        }
        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(classify_status(status, &body, cursor.is_some()));
        }
        serde_json::from_str(&body).map_err(|e| ProviderError::Terminal(e.to_string()))
    }

    async fn list(
        &self,
        access_token: &str,
        calendar_id: &str,
        cursor: Option<&str>,
    ) -> ProviderResult<ChangePage> {
        let mut page = ChangePage::default();
        let mut page_token: Option<String> = None;

        loop {
            let body = self
                .list_page(access_token, calendar_id, cursor, page_token.as_deref())
                .await?;

            for item in body["items"].as_array().into_iter().flatten() {
                match from_google_item(item) {
                    ItemOutcome::Event(event) => page.events.push(event),
                    ItemOutcome::Removed(remote_id) => page.removed.push(remote_id),
                    ItemOutcome::Skip => {}
                }
            }

            if let Some(next) = body["nextPageToken"].as_str() {
                page_token = Some(next.to_string());
                continue;
            }
            page.next_cursor = body["nextSyncToken"].as_str().map(String::from);
            return Ok(page);
        }
    }

    async fn write_event(
        &self,
        method: reqwest::Method,
        url: String,
        access_token: &str,
        payload: &MirrorPayload,
        calendar_id: &str,
    ) -> ProviderResult<WrittenEvent> {
        let response = self
            .http
            .request(method, &url)
            .bearer_auth(access_token)
            .json(&to_google_json(payload))
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(classify_status(status, &body, false));
        }

        let value: Value =
            serde_json::from_str(&body).map_err(|e| ProviderError::Terminal(e.to_string()))?;
        let remote_id = value["id"]
            .as_str()
            .ok_or_else(|| ProviderError::Terminal("write response missing event id".into()))?;
        Ok(WrittenEvent {
            remote_id: remote_id.to_string(),
            calendar_id: calendar_id.to_string(),
        })
    }
}

impl CalendarApi for GoogleClient {
    async fn refresh_token(&self, refresh_token: &str) -> ProviderResult<MintedToken> {
        let response = self
            .http
            .post(format!("{}/token", self.auth_base))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
            ])
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            // 4xx on a token exchange means the grant is dead
            return Err(if status.is_client_error() {
                ProviderError::Auth(body)
            } else {
                classify_status(status, &body, false)
            });
        }

        let value: Value =
            serde_json::from_str(&body).map_err(|e| ProviderError::Terminal(e.to_string()))?;
        let access_token = value["access_token"]
            .as_str()
            .ok_or_else(|| ProviderError::Terminal("token response missing access_token".into()))?;
        let expires_in = value["expires_in"].as_i64().unwrap_or(3600);

        Ok(MintedToken {
            access_token: access_token.to_string(),
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in),
        })
    }

    async fn incremental_list(
        &self,
        access_token: &str,
        calendar_id: &str,
        cursor: &str,
    ) -> ProviderResult<ChangePage> {
        self.list(access_token, calendar_id, Some(cursor)).await
    }

    async fn full_list(&self, access_token: &str, calendar_id: &str) -> ProviderResult<ChangePage> {
        self.list(access_token, calendar_id, None).await
    }

    async fn create_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        payload: &MirrorPayload,
    ) -> ProviderResult<WrittenEvent> {
        let url = format!("{}/calendars/{}/events", self.api_base, calendar_id);
        self.write_event(reqwest::Method::POST, url, access_token, payload, calendar_id)
            .await
    }

    async fn patch_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        remote_id: &str,
        payload: &MirrorPayload,
    ) -> ProviderResult<WrittenEvent> {
        let url = format!(
            "{}/calendars/{}/events/{}",
            self.api_base, calendar_id, remote_id
        );
        self.write_event(reqwest::Method::PATCH, url, access_token, payload, calendar_id)
            .await
    }

    async fn delete_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        remote_id: &str,
    ) -> ProviderResult<()> {
        let url = format!(
            "{}/calendars/{}/events/{}",
            self.api_base, calendar_id, remote_id
        );
        let response = self.http.delete(&url).bearer_auth(access_token).send().await?;
        let status = response.status();
        // Already gone counts as deleted
        if status.is_success() || status.as_u16() == 404 || status.as_u16() == 410 {
            return Ok(());
        }
        let body = response.text().await?;
        Err(classify_status(status, &body, false))
    }

    async fn register_channel(
        &self,
        access_token: &str,
        resource: &str,
        channel_token: &str,
    ) -> ProviderResult<ChannelRegistration> {
        let channel_id = uuid::Uuid::new_v4().to_string();
        let url = format!("{}/calendars/{}/events/watch", self.api_base, resource);
        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(&json!({
                "id": channel_id,
                "type": "web_hook",
                "address": self.webhook_address,
                "token": channel_token,
            }))
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(classify_status(status, &body, false));
        }

        let value: Value =
            serde_json::from_str(&body).map_err(|e| ProviderError::Terminal(e.to_string()))?;
        let expires_at = parse_expiration_millis(&value["expiration"])
            .unwrap_or_else(|| Utc::now() + chrono::Duration::days(7));
        Ok(ChannelRegistration {
            channel_id,
            expires_at,
        })
    }

    async fn renew_channel(
        &self,
        access_token: &str,
        channel_id: &str,
        channel_token: &str,
        resource: &str,
    ) -> ProviderResult<ChannelRegistration> {
        // Google channels cannot be extended; replace and best-effort stop
        // the old one.
        let replacement = self
            .register_channel(access_token, resource, channel_token)
            .await?;
        if let Err(err) = self.stop_channel(access_token, channel_id).await {
            tracing::debug!(%channel_id, %err, "failed to stop superseded channel");
        }
        Ok(replacement)
    }

    async fn stop_channel(&self, access_token: &str, channel_id: &str) -> ProviderResult<()> {
        let response = self
            .http
            .post(format!("{}/channels/stop", self.api_base))
            .bearer_auth(access_token)
            .json(&json!({ "id": channel_id }))
            .send()
            .await?;
        let status = response.status();
        if status.is_success() || status.as_u16() == 404 {
            return Ok(());
        }
        let body = response.text().await?;
        Err(classify_status(status, &body, false))
    }

    async fn resolve_calendar(
        &self,
        access_token: &str,
        kind: CalendarKind,
    ) -> ProviderResult<String> {
        if kind == CalendarKind::PrimaryMirror {
            return Ok("primary".to_string());
        }

        // Find the existing overlay calendar
        let response = self
            .http
            .get(format!("{}/users/me/calendarList", self.api_base))
            .bearer_auth(access_token)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(classify_status(status, &body, false));
        }
        let value: Value =
            serde_json::from_str(&body).map_err(|e| ProviderError::Terminal(e.to_string()))?;
        for item in value["items"].as_array().into_iter().flatten() {
            if item["summary"].as_str() == Some(BUSY_OVERLAY_SUMMARY) {
                if let Some(id) = item["id"].as_str() {
                    return Ok(id.to_string());
                }
            }
        }

        // Auto-provision it
        let response = self
            .http
            .post(format!("{}/calendars", self.api_base))
            .bearer_auth(access_token)
            .json(&json!({ "summary": BUSY_OVERLAY_SUMMARY }))
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(classify_status(status, &body, false));
        }
        let value: Value =
            serde_json::from_str(&body).map_err(|e| ProviderError::Terminal(e.to_string()))?;
        value["id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| ProviderError::Terminal("calendar insert response missing id".into()))
    }
}

/// Build the wire body for a mirror write
pub fn to_google_json(payload: &MirrorPayload) -> Value {
    let (start, end) = if payload.all_day {
        (
            json!({ "date": payload.start_at.date_naive().to_string() }),
            json!({ "date": payload.end_at.date_naive().to_string() }),
        )
    } else {
        (
            json!({ "dateTime": format_instant_ms(payload.start_at) }),
            json!({ "dateTime": format_instant_ms(payload.end_at) }),
        )
    };

    let mut body = json!({
        "summary": payload.title,
        "start": start,
        "end": end,
        "status": status_str(payload.status),
        "transparency": match payload.transparency {
            Transparency::Opaque => "opaque",
            Transparency::Transparent => "transparent",
        },
        "extendedProperties": {
            "private": {
                TAG_CANONICAL_ID: payload.tags.canonical_id.as_str(),
                TAG_OWNER_ID: payload.tags.owning_user_id.to_string(),
                TAG_EDGE_ID: payload.tags.policy_edge_id.to_string(),
                TAG_CONTENT_HASH: payload.tags.content_hash,
            }
        },
    });

    if let Some(description) = &payload.description {
        body["description"] = json!(description);
    }
    if let Some(location) = &payload.location {
        body["location"] = json!(location);
    }
    if let Some(rrule) = &payload.rrule {
        body["recurrence"] = json!([format!("RRULE:{rrule}")]);
    }
    body
}

pub enum ItemOutcome {
    Event(NormalizedEvent),
    Removed(String),
    Skip,
}

/// Normalize one Google event resource
pub fn from_google_item(item: &Value) -> ItemOutcome {
    let Some(remote_id) = item["id"].as_str() else {
        return ItemOutcome::Skip;
    };

    if item["status"].as_str() == Some("cancelled") {
        return ItemOutcome::Removed(remote_id.to_string());
    }

    let (Some((start_at, start_is_date)), Some((end_at, _))) =
        (parse_time(&item["start"]), parse_time(&item["end"]))
    else {
        return ItemOutcome::Skip;
    };

    let attendee_emails = item["attendees"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|a| a["email"].as_str().map(String::from))
        .collect();

    let private = &item["extendedProperties"]["private"];
    let tags = if private.is_object() {
        let raw = RawMirrorTags {
            canonical_id: private[TAG_CANONICAL_ID].as_str().map(String::from),
            owning_user_id: private[TAG_OWNER_ID].as_str().map(String::from),
            policy_edge_id: private[TAG_EDGE_ID].as_str().map(String::from),
            content_hash: private[TAG_CONTENT_HASH].as_str().map(String::from),
        };
        (!raw.is_empty()).then_some(raw)
    } else {
        None
    };

    let rrule = item["recurrence"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .find_map(|line| line.strip_prefix("RRULE:"))
        .map(String::from);

    ItemOutcome::Event(NormalizedEvent {
        remote_id: remote_id.to_string(),
        title: item["summary"].as_str().unwrap_or_default().to_string(),
        description: item["description"].as_str().map(String::from),
        location: item["location"].as_str().map(String::from),
        conference_url: item["hangoutLink"].as_str().map(String::from),
        start_at,
        end_at,
        all_day: start_is_date,
        status: match item["status"].as_str() {
            Some("tentative") => EventStatus::Tentative,
            _ => EventStatus::Confirmed,
        },
        transparency: match item["transparency"].as_str() {
            Some("transparent") => Transparency::Transparent,
            _ => Transparency::Opaque,
        },
        rrule,
        attendee_emails,
        tags,
    })
}

fn status_str(status: EventStatus) -> &'static str {
    match status {
        EventStatus::Confirmed => "confirmed",
        EventStatus::Tentative => "tentative",
        EventStatus::Cancelled => "cancelled",
    }
}

/// (instant, was_all_day_date) from a Google start/end object
fn parse_time(value: &Value) -> Option<(DateTime<Utc>, bool)> {
    if let Some(date_time) = value["dateTime"].as_str() {
        let parsed = DateTime::parse_from_rfc3339(date_time).ok()?;
        return Some((parsed.with_timezone(&Utc), false));
    }
    if let Some(date) = value["date"].as_str() {
        let parsed: NaiveDate = date.parse().ok()?;
        let midnight = parsed.and_hms_opt(0, 0, 0)?;
        return Some((Utc.from_utc_datetime(&midnight), true));
    }
    None
}

fn parse_expiration_millis(value: &Value) -> Option<DateTime<Utc>> {
    let millis = match value {
        Value::String(s) => s.parse::<i64>().ok()?,
        Value::Number(n) => n.as_i64()?,
        _ => return None,
    };
    Utc.timestamp_millis_opt(millis).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tminus_core::models::MirrorTags;
    use tminus_core::types::{CanonicalId, PolicyEdgeId, UserId};

    fn payload() -> MirrorPayload {
        MirrorPayload {
            title: "Busy".into(),
            description: None,
            location: None,
            start_at: Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap(),
            end_at: Utc.with_ymd_and_hms(2026, 3, 2, 11, 0, 0).unwrap(),
            all_day: false,
            status: EventStatus::Confirmed,
            transparency: Transparency::Opaque,
            rrule: None,
            calendar_kind: CalendarKind::BusyOverlay,
            tags: MirrorTags {
                canonical_id: CanonicalId::generate(),
                owning_user_id: UserId::new(),
                policy_edge_id: PolicyEdgeId::new(),
                content_hash: "hash-1".into(),
            },
        }
    }

    #[test]
    fn test_wire_body_carries_tags_and_times() {
        let payload = payload();
        let body = to_google_json(&payload);

        assert_eq!(body["summary"], "Busy");
        assert_eq!(body["start"]["dateTime"], "2026-03-02T10:00:00.000Z");
        assert_eq!(body["transparency"], "opaque");
        let private = &body["extendedProperties"]["private"];
        assert_eq!(
            private[TAG_CANONICAL_ID].as_str(),
            Some(payload.tags.canonical_id.as_str())
        );
        assert_eq!(private[TAG_CONTENT_HASH], "hash-1");
        // Stripped payloads serialize without body fields
        assert!(body.get("description").is_none());
        assert!(body.get("attendees").is_none());
    }

    #[test]
    fn test_all_day_uses_date_fields() {
        let mut payload = payload();
        payload.all_day = true;
        let body = to_google_json(&payload);
        assert_eq!(body["start"]["date"], "2026-03-02");
        assert!(body["start"].get("dateTime").is_none());
    }

    #[test]
    fn test_item_roundtrip_preserves_tags() {
        let payload = payload();
        let mut item = to_google_json(&payload);
        item["id"] = json!("google-evt-1");

        match from_google_item(&item) {
            ItemOutcome::Event(event) => {
                assert_eq!(event.remote_id, "google-evt-1");
                assert_eq!(event.start_at, payload.start_at);
                let tags = event.tags.expect("tags");
                let validated = tags.validate().expect("valid tags");
                assert_eq!(validated.canonical_id, payload.tags.canonical_id);
                assert_eq!(validated.content_hash, "hash-1");
            }
            _ => panic!("expected event"),
        }
    }

    #[test]
    fn test_cancelled_item_maps_to_removed() {
        let item = json!({ "id": "gone-1", "status": "cancelled" });
        assert!(matches!(from_google_item(&item), ItemOutcome::Removed(id) if id == "gone-1"));
    }

    #[test]
    fn test_untagged_item_has_no_tags() {
        let item = json!({
            "id": "plain-1",
            "summary": "Lunch",
            "start": { "dateTime": "2026-03-02T12:00:00Z" },
            "end": { "dateTime": "2026-03-02T13:00:00Z" },
            "attendees": [{ "email": "alice@example.com" }],
        });
        match from_google_item(&item) {
            ItemOutcome::Event(event) => {
                assert!(event.tags.is_none());
                assert_eq!(event.attendee_emails, vec!["alice@example.com".to_string()]);
            }
            _ => panic!("expected event"),
        }
    }

    #[test]
    fn test_rrule_passthrough() {
        let item = json!({
            "id": "rec-1",
            "summary": "Standup",
            "start": { "dateTime": "2026-03-02T09:00:00Z" },
            "end": { "dateTime": "2026-03-02T09:15:00Z" },
            "recurrence": ["RRULE:FREQ=DAILY;COUNT=5"],
        });
        match from_google_item(&item) {
            ItemOutcome::Event(event) => {
                assert_eq!(event.rrule.as_deref(), Some("FREQ=DAILY;COUNT=5"));
            }
            _ => panic!("expected event"),
        }
    }
}
