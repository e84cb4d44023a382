//! Microsoft Graph calendar client
//!
//! Mirror tags ride in an open extension (`com.tminus.mirror`). Unlike
//! Google's flat private properties, Graph nests them under `extensions`;
//! both names are pinned forever.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Value, json};

use tminus_core::models::{
    CalendarKind, EventStatus, MirrorPayload, NormalizedEvent, RawMirrorTags, Transparency,
};

use crate::api::{CalendarApi, ChangePage, ChannelRegistration, MintedToken, WrittenEvent};
use crate::error::{ProviderError, ProviderResult, classify_status};

/// Open extension carrying the mirror tag tuple
pub const EXTENSION_NAME: &str = "com.tminus.mirror";

pub const BUSY_OVERLAY_NAME: &str = "T-Minus Busy";

const DEFAULT_API_BASE: &str = "https://graph.microsoft.com/v1.0";
const DEFAULT_AUTH_BASE: &str = "https://login.microsoftonline.com/common/oauth2/v2.0";

#[derive(Debug, Clone)]
pub struct MicrosoftClient {
    http: reqwest::Client,
    api_base: String,
    auth_base: String,
    client_id: String,
    client_secret: String,
    webhook_address: String,
}

impl MicrosoftClient {
    pub fn new(client_id: String, client_secret: String, webhook_address: String) -> Self {
        Self::with_base_urls(
            client_id,
            client_secret,
            webhook_address,
            DEFAULT_API_BASE.to_string(),
            DEFAULT_AUTH_BASE.to_string(),
        )
    }

    pub fn with_base_urls(
        client_id: String,
        client_secret: String,
        webhook_address: String,
        api_base: String,
        auth_base: String,
    ) -> Self {
        MicrosoftClient {
            http: reqwest::Client::new(),
            api_base,
            auth_base,
            client_id,
            client_secret,
            webhook_address,
        }
    }

    async fn get_json(&self, access_token: &str, url: &str, cursor_call: bool) -> ProviderResult<Value> {
        let response = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .header("Prefer", "odata.maxpagesize=50")
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            // Graph reports a dead delta token as 410 with syncStateNotFound
            if cursor_call && body.contains("syncStateNotFound") {
                return Err(ProviderError::CursorInvalidated);
            }
            return Err(classify_status(status, &body, cursor_call));
        }
        serde_json::from_str(&body).map_err(|e| ProviderError::Terminal(e.to_string()))
    }

    async fn delta_walk(
        &self,
        access_token: &str,
        start_url: String,
        cursor_call: bool,
    ) -> ProviderResult<ChangePage> {
        let mut page = ChangePage::default();
        let mut url = start_url;

        loop {
            let body = self.get_json(access_token, &url, cursor_call).await?;

            for item in body["value"].as_array().into_iter().flatten() {
                if item.get("@removed").is_some() {
                    if let Some(id) = item["id"].as_str() {
                        page.removed.push(id.to_string());
                    }
                    continue;
                }
                if let Some(event) = from_graph_item(item) {
                    page.events.push(event);
                }
            }

            if let Some(next) = body["@odata.nextLink"].as_str() {
                url = next.to_string();
                continue;
            }
            page.next_cursor = body["@odata.deltaLink"].as_str().map(String::from);
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
            .json(&to_graph_json(payload))
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

impl CalendarApi for MicrosoftClient {
    async fn refresh_token(&self, refresh_token: &str) -> ProviderResult<MintedToken> {
        let response = self
            .http
            .post(format!("{}/token", self.auth_base))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
                ("scope", "https://graph.microsoft.com/.default offline_access"),
            ])
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
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
        _calendar_id: &str,
        cursor: &str,
    ) -> ProviderResult<ChangePage> {
        // The cursor is the full deltaLink URL Graph handed back
        self.delta_walk(access_token, cursor.to_string(), true).await
    }

    async fn full_list(&self, access_token: &str, calendar_id: &str) -> ProviderResult<ChangePage> {
        let url = format!(
            "{}/me/calendars/{}/events/delta?$expand=extensions",
            self.api_base, calendar_id
        );
        self.delta_walk(access_token, url, false).await
    }

    async fn create_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        payload: &MirrorPayload,
    ) -> ProviderResult<WrittenEvent> {
        let url = format!("{}/me/calendars/{}/events", self.api_base, calendar_id);
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
        let url = format!("{}/me/events/{}", self.api_base, remote_id);
        self.write_event(reqwest::Method::PATCH, url, access_token, payload, calendar_id)
            .await
    }

    async fn delete_event(
        &self,
        access_token: &str,
        _calendar_id: &str,
        remote_id: &str,
    ) -> ProviderResult<()> {
        let url = format!("{}/me/events/{}", self.api_base, remote_id);
        let response = self.http.delete(&url).bearer_auth(access_token).send().await?;
        let status = response.status();
        if status.is_success() || status.as_u16() == 404 {
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
        let expires_at = Utc::now() + chrono::Duration::days(2);
        let response = self
            .http
            .post(format!("{}/subscriptions", self.api_base))
            .bearer_auth(access_token)
            .json(&json!({
                "changeType": "created,updated,deleted",
                "notificationUrl": self.webhook_address,
                "resource": format!("me/calendars/{resource}/events"),
                "expirationDateTime": expires_at.to_rfc3339(),
                "clientState": channel_token,
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
        let channel_id = value["id"]
            .as_str()
            .ok_or_else(|| ProviderError::Terminal("subscription response missing id".into()))?;
        let expires_at = value["expirationDateTime"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map_or(expires_at, |dt| dt.with_timezone(&Utc));

        Ok(ChannelRegistration {
            channel_id: channel_id.to_string(),
            expires_at,
        })
    }

    async fn renew_channel(
        &self,
        access_token: &str,
        channel_id: &str,
        _channel_token: &str,
        _resource: &str,
    ) -> ProviderResult<ChannelRegistration> {
        let expires_at = Utc::now() + chrono::Duration::days(2);
        let response = self
            .http
            .patch(format!("{}/subscriptions/{}", self.api_base, channel_id))
            .bearer_auth(access_token)
            .json(&json!({ "expirationDateTime": expires_at.to_rfc3339() }))
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(classify_status(status, &body, false));
        }

        Ok(ChannelRegistration {
            channel_id: channel_id.to_string(),
            expires_at,
        })
    }

    async fn stop_channel(&self, access_token: &str, channel_id: &str) -> ProviderResult<()> {
        let response = self
            .http
            .delete(format!("{}/subscriptions/{}", self.api_base, channel_id))
            .bearer_auth(access_token)
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
            let value = self
                .get_json(access_token, &format!("{}/me/calendar", self.api_base), false)
                .await?;
            return value["id"]
                .as_str()
                .map(String::from)
                .ok_or_else(|| ProviderError::Terminal("primary calendar missing id".into()));
        }

        let value = self
            .get_json(access_token, &format!("{}/me/calendars", self.api_base), false)
            .await?;
        for item in value["value"].as_array().into_iter().flatten() {
            if item["name"].as_str() == Some(BUSY_OVERLAY_NAME) {
                if let Some(id) = item["id"].as_str() {
                    return Ok(id.to_string());
                }
            }
        }

        let response = self
            .http
            .post(format!("{}/me/calendars", self.api_base))
            .bearer_auth(access_token)
            .json(&json!({ "name": BUSY_OVERLAY_NAME }))
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
            .ok_or_else(|| ProviderError::Terminal("calendar create response missing id".into()))
    }
}

/// Build the Graph wire body for a mirror write
pub fn to_graph_json(payload: &MirrorPayload) -> Value {
    let mut body = json!({
        "subject": payload.title,
        "start": { "dateTime": graph_instant(payload.start_at), "timeZone": "UTC" },
        "end": { "dateTime": graph_instant(payload.end_at), "timeZone": "UTC" },
        "isAllDay": payload.all_day,
        "showAs": match (payload.transparency, payload.status) {
            (Transparency::Transparent, _) => "free",
            (_, EventStatus::Tentative) => "tentative",
            _ => "busy",
        },
        "extensions": [{
            "@odata.type": "microsoft.graph.openTypeExtension",
            "extensionName": EXTENSION_NAME,
            "canonicalId": payload.tags.canonical_id.as_str(),
            "ownerId": payload.tags.owning_user_id.to_string(),
            "edgeId": payload.tags.policy_edge_id.to_string(),
            "contentHash": payload.tags.content_hash,
        }],
    });

    if let Some(description) = &payload.description {
        body["body"] = json!({ "contentType": "text", "content": description });
    }
    if let Some(location) = &payload.location {
        body["location"] = json!({ "displayName": location });
    }
    body
}

/// Normalize one Graph event resource; `None` for unusable items
pub fn from_graph_item(item: &Value) -> Option<NormalizedEvent> {
    let remote_id = item["id"].as_str()?;
    let start_at = parse_graph_time(&item["start"])?;
    let end_at = parse_graph_time(&item["end"])?;

    let attendee_emails = item["attendees"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|a| a["emailAddress"]["address"].as_str().map(String::from))
        .collect();

    let tags = item["extensions"]
        .as_array()
        .into_iter()
        .flatten()
        .find(|e| e["extensionName"].as_str() == Some(EXTENSION_NAME))
        .map(|e| RawMirrorTags {
            canonical_id: e["canonicalId"].as_str().map(String::from),
            owning_user_id: e["ownerId"].as_str().map(String::from),
            policy_edge_id: e["edgeId"].as_str().map(String::from),
            content_hash: e["contentHash"].as_str().map(String::from),
        });

    Some(NormalizedEvent {
        remote_id: remote_id.to_string(),
        title: item["subject"].as_str().unwrap_or_default().to_string(),
        description: item["body"]["content"].as_str().map(String::from),
        location: item["location"]["displayName"].as_str().map(String::from),
        conference_url: item["onlineMeeting"]["joinUrl"].as_str().map(String::from),
        start_at,
        end_at,
        all_day: item["isAllDay"].as_bool().unwrap_or(false),
        status: match item["showAs"].as_str() {
            Some("tentative") => EventStatus::Tentative,
            _ => EventStatus::Confirmed,
        },
        transparency: match item["showAs"].as_str() {
            Some("free") => Transparency::Transparent,
            _ => Transparency::Opaque,
        },
        rrule: None,
        attendee_emails,
        tags,
    })
}

/// Graph wants naive UTC timestamps paired with a timeZone field
fn graph_instant(instant: DateTime<Utc>) -> String {
    instant.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
}

fn parse_graph_time(value: &Value) -> Option<DateTime<Utc>> {
    let date_time = value["dateTime"].as_str()?;
    // Graph omits the offset when timeZone is UTC
    let naive: NaiveDateTime = date_time.parse().ok().or_else(|| {
        NaiveDateTime::parse_from_str(date_time, "%Y-%m-%dT%H:%M:%S%.f").ok()
    })?;
    Some(Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tminus_core::models::MirrorTags;
    use tminus_core::types::{CanonicalId, PolicyEdgeId, UserId};

    fn payload() -> MirrorPayload {
        MirrorPayload {
            title: "Busy".into(),
            description: Some("notes".into()),
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
    fn test_wire_body_uses_open_extension() {
        let payload = payload();
        let body = to_graph_json(&payload);

        assert_eq!(body["subject"], "Busy");
        assert_eq!(body["start"]["timeZone"], "UTC");
        assert_eq!(body["showAs"], "busy");
        let extension = &body["extensions"][0];
        assert_eq!(extension["extensionName"], EXTENSION_NAME);
        assert_eq!(
            extension["canonicalId"].as_str(),
            Some(payload.tags.canonical_id.as_str())
        );
    }

    #[test]
    fn test_transparent_maps_to_free() {
        let mut payload = payload();
        payload.transparency = Transparency::Transparent;
        assert_eq!(to_graph_json(&payload)["showAs"], "free");
    }

    #[test]
    fn test_item_roundtrip_preserves_tags() {
        let payload = payload();
        let mut item = to_graph_json(&payload);
        item["id"] = json!("graph-evt-1");

        let event = from_graph_item(&item).expect("event");
        assert_eq!(event.remote_id, "graph-evt-1");
        assert_eq!(event.start_at, payload.start_at);
        assert_eq!(event.description.as_deref(), Some("notes"));

        let validated = event.tags.expect("tags").validate().expect("valid");
        assert_eq!(validated.policy_edge_id, payload.tags.policy_edge_id);
    }

    #[test]
    fn test_attendee_addresses_are_extracted() {
        let item = json!({
            "id": "m-1",
            "subject": "Review",
            "start": { "dateTime": "2026-03-02T10:00:00.0000000", "timeZone": "UTC" },
            "end": { "dateTime": "2026-03-02T11:00:00.0000000", "timeZone": "UTC" },
            "attendees": [
                { "emailAddress": { "address": "bob@example.com", "name": "Bob" } }
            ],
        });
        let event = from_graph_item(&item).expect("event");
        assert_eq!(event.attendee_emails, vec!["bob@example.com".to_string()]);
        assert!(event.tags.is_none());
    }
}
