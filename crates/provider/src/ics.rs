//! ICS feed client (read-only)
//!
//! ICS/CalDAV accounts are feed sources only: list operations fetch and
//! parse the feed, every write capability reports terminal failure, and the
//! sync cursor is the feed's ETag so unchanged feeds cost one conditional
//! GET.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

use tminus_core::models::{
    CalendarKind, EventStatus, MirrorPayload, NormalizedEvent, RawMirrorTags, Transparency,
};

use crate::api::{CalendarApi, ChangePage, ChannelRegistration, MintedToken, WrittenEvent};
use crate::error::{ProviderError, ProviderResult, classify_status};

#[derive(Debug, Clone)]
pub struct IcsClient {
    http: reqwest::Client,
}

impl IcsClient {
    pub fn new() -> Self {
        IcsClient {
            http: reqwest::Client::new(),
        }
    }

    /// Fetch the feed; the calendar id is the feed URL, the cursor is its
    /// last ETag.
    async fn fetch(&self, feed_url: &str, etag: Option<&str>) -> ProviderResult<ChangePage> {
        let mut request = self.http.get(feed_url);
        if let Some(etag) = etag {
            request = request.header("If-None-Match", etag);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() == 304 {
            // Unchanged; keep the cursor
            return Ok(ChangePage {
                next_cursor: etag.map(String::from),
                ..ChangePage::default()
            });
        }
        let next_etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = response.text().await?;
        if !status.is_success() {
            return Err(classify_status(status, &body, false));
        }

        Ok(ChangePage {
            events: parse_feed(&body),
            removed: Vec::new(),
            next_cursor: next_etag,
        })
    }
}

impl Default for IcsClient {
    fn default() -> Self {
        Self::new()
    }
}

impl CalendarApi for IcsClient {
    async fn refresh_token(&self, _refresh_token: &str) -> ProviderResult<MintedToken> {
        // Feeds carry no auth of their own; hand back a long-lived stand-in
        Ok(MintedToken {
            access_token: String::new(),
            expires_at: Utc::now() + chrono::Duration::hours(24),
        })
    }

    async fn incremental_list(
        &self,
        _access_token: &str,
        calendar_id: &str,
        cursor: &str,
    ) -> ProviderResult<ChangePage> {
        self.fetch(calendar_id, Some(cursor)).await
    }

    async fn full_list(&self, _access_token: &str, calendar_id: &str) -> ProviderResult<ChangePage> {
        self.fetch(calendar_id, None).await
    }

    async fn create_event(
        &self,
        _access_token: &str,
        _calendar_id: &str,
        _payload: &MirrorPayload,
    ) -> ProviderResult<WrittenEvent> {
        Err(ProviderError::Terminal("ics feeds are read-only".into()))
    }

    async fn patch_event(
        &self,
        _access_token: &str,
        _calendar_id: &str,
        _remote_id: &str,
        _payload: &MirrorPayload,
    ) -> ProviderResult<WrittenEvent> {
        Err(ProviderError::Terminal("ics feeds are read-only".into()))
    }

    async fn delete_event(
        &self,
        _access_token: &str,
        _calendar_id: &str,
        _remote_id: &str,
    ) -> ProviderResult<()> {
        Err(ProviderError::Terminal("ics feeds are read-only".into()))
    }

    async fn register_channel(
        &self,
        _access_token: &str,
        _resource: &str,
        _channel_token: &str,
    ) -> ProviderResult<ChannelRegistration> {
        Err(ProviderError::Terminal("ics feeds do not support webhooks".into()))
    }

    async fn renew_channel(
        &self,
        _access_token: &str,
        _channel_id: &str,
        _channel_token: &str,
        _resource: &str,
    ) -> ProviderResult<ChannelRegistration> {
        Err(ProviderError::Terminal("ics feeds do not support webhooks".into()))
    }

    async fn stop_channel(&self, _access_token: &str, _channel_id: &str) -> ProviderResult<()> {
        Ok(())
    }

    async fn resolve_calendar(
        &self,
        _access_token: &str,
        _kind: CalendarKind,
    ) -> ProviderResult<String> {
        Ok("feed".to_string())
    }
}

/// Parse VEVENT blocks out of a feed body.
///
/// Line-based with RFC 5545 unfolding; tolerant of properties we do not
/// understand.
pub fn parse_feed(body: &str) -> Vec<NormalizedEvent> {
    let mut events = Vec::new();

    for block in unfold(body) {
        if let Some(event) = parse_vevent(&block) {
            events.push(event);
        }
    }
    events
}

/// Unfold continuation lines and split into VEVENT blocks
fn unfold(body: &str) -> Vec<Vec<String>> {
    let mut lines: Vec<String> = Vec::new();
    for raw in body.lines() {
        if (raw.starts_with(' ') || raw.starts_with('\t')) && !lines.is_empty() {
            if let Some(last) = lines.last_mut() {
                last.push_str(raw.trim_start());
            }
        } else {
            lines.push(raw.trim_end().to_string());
        }
    }

    let mut blocks = Vec::new();
    let mut current: Option<Vec<String>> = None;
    for line in lines {
        match line.as_str() {
            "BEGIN:VEVENT" => current = Some(Vec::new()),
            "END:VEVENT" => {
                if let Some(block) = current.take() {
                    blocks.push(block);
                }
            }
            _ => {
                if let Some(block) = current.as_mut() {
                    block.push(line);
                }
            }
        }
    }
    blocks
}

fn parse_vevent(block: &[String]) -> Option<NormalizedEvent> {
    let mut uid = None;
    let mut summary = None;
    let mut description = None;
    let mut location = None;
    let mut url = None;
    let mut dtstart = None;
    let mut dtend = None;
    let mut all_day = false;
    let mut status = EventStatus::Confirmed;
    let mut transparency = Transparency::Opaque;
    let mut rrule = None;
    let mut attendees = Vec::new();
    let mut tags = RawMirrorTags::default();

    for line in block {
        let Some((name, params, value)) = split_property(line) else {
            continue;
        };

        match name.as_str() {
            "UID" => uid = Some(value),
            "SUMMARY" => summary = Some(unescape(&value)),
            "DESCRIPTION" => description = Some(unescape(&value)),
            "LOCATION" => location = Some(unescape(&value)),
            "URL" => url = Some(value),
            "DTSTART" => {
                if let Some((instant, is_date)) = parse_ics_time(&value) {
                    dtstart = Some(instant);
                    all_day = all_day || is_date || params.contains("VALUE=DATE");
                }
            }
            "DTEND" => {
                if let Some((instant, _)) = parse_ics_time(&value) {
                    dtend = Some(instant);
                }
            }
            "STATUS" => {
                status = match value.as_str() {
                    "TENTATIVE" => EventStatus::Tentative,
                    "CANCELLED" => EventStatus::Cancelled,
                    _ => EventStatus::Confirmed,
                };
            }
            "TRANSP" => {
                if value == "TRANSPARENT" {
                    transparency = Transparency::Transparent;
                }
            }
            "RRULE" => rrule = Some(value),
            "ATTENDEE" => {
                if let Some(email) = value.strip_prefix("mailto:") {
                    attendees.push(email.to_string());
                }
            }
            "X-TMINUS-CANONICAL-ID" => tags.canonical_id = Some(value),
            "X-TMINUS-OWNER-ID" => tags.owning_user_id = Some(value),
            "X-TMINUS-EDGE-ID" => tags.policy_edge_id = Some(value),
            "X-TMINUS-CONTENT-HASH" => tags.content_hash = Some(value),
            _ => {}
        }
    }

    let uid = uid?;
    let start_at = dtstart?;
    let end_at = dtend.unwrap_or_else(|| {
        if all_day {
            start_at + chrono::Duration::days(1)
        } else {
            start_at + chrono::Duration::hours(1)
        }
    });

    Some(NormalizedEvent {
        remote_id: uid,
        title: summary.unwrap_or_default(),
        description,
        location,
        conference_url: url,
        start_at,
        end_at,
        all_day,
        status,
        transparency,
        rrule,
        attendee_emails: attendees,
        tags: (!tags.is_empty()).then_some(tags),
    })
}

/// `NAME;PARAM=X:value` -> (NAME, "PARAM=X", "value")
fn split_property(line: &str) -> Option<(String, String, String)> {
    let colon = line.find(':')?;
    let (head, value) = line.split_at(colon);
    let value = value[1..].to_string();
    match head.split_once(';') {
        Some((name, params)) => Some((name.to_uppercase(), params.to_uppercase(), value)),
        None => Some((head.to_uppercase(), String::new(), value)),
    }
}

fn unescape(value: &str) -> String {
    value
        .replace("\\n", "\n")
        .replace("\\,", ",")
        .replace("\\;", ";")
        .replace("\\\\", "\\")
}

/// `20260302T100000Z` or `20260302`; floating local times are read as UTC
fn parse_ics_time(value: &str) -> Option<(DateTime<Utc>, bool)> {
    if let Ok(instant) = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%SZ") {
        return Some((Utc.from_utc_datetime(&instant), false));
    }
    if let Ok(instant) = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S") {
        return Some((Utc.from_utc_datetime(&instant), false));
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y%m%d") {
        return Some((Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?), true));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = "BEGIN:VCALENDAR\r\n\
VERSION:2.0\r\n\
BEGIN:VEVENT\r\n\
UID:feed-evt-1\r\n\
SUMMARY:Team offsite\\, day one\r\n\
DESCRIPTION:Bring\r\n laptops\r\n\
DTSTART:20260302T100000Z\r\n\
DTEND:20260302T110000Z\r\n\
STATUS:CONFIRMED\r\n\
TRANSP:OPAQUE\r\n\
ATTENDEE;CN=Alice:mailto:alice@example.com\r\n\
END:VEVENT\r\n\
BEGIN:VEVENT\r\n\
UID:feed-evt-2\r\n\
SUMMARY:Public holiday\r\n\
DTSTART;VALUE=DATE:20260306\r\n\
TRANSP:TRANSPARENT\r\n\
END:VEVENT\r\n\
END:VCALENDAR\r\n";

    #[test]
    fn test_parse_feed_events() {
        let events = parse_feed(FEED);
        assert_eq!(events.len(), 2);

        let first = &events[0];
        assert_eq!(first.remote_id, "feed-evt-1");
        assert_eq!(first.title, "Team offsite, day one");
        // Folded line was unfolded
        assert_eq!(first.description.as_deref(), Some("Bring laptops"));
        assert_eq!(
            first.start_at,
            Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
        );
        assert_eq!(first.attendee_emails, vec!["alice@example.com".to_string()]);
        assert!(!first.all_day);

        let second = &events[1];
        assert!(second.all_day);
        assert_eq!(second.transparency, Transparency::Transparent);
        // Date-only events default to a one-day span
        assert_eq!(second.end_at - second.start_at, chrono::Duration::days(1));
    }

    #[test]
    fn test_tagged_feed_event_surfaces_tags() {
        let feed = "BEGIN:VEVENT\r\n\
UID:m-1\r\n\
SUMMARY:Busy\r\n\
DTSTART:20260302T100000Z\r\n\
DTEND:20260302T110000Z\r\n\
X-TMINUS-CANONICAL-ID:01ARZ3NDEKTSV4RRFFQ69G5FAV\r\n\
X-TMINUS-CONTENT-HASH:abc\r\n\
END:VEVENT\r\n";
        let events = parse_feed(feed);
        let tags = events[0].tags.as_ref().expect("tags");
        assert_eq!(
            tags.canonical_id.as_deref(),
            Some("01ARZ3NDEKTSV4RRFFQ69G5FAV")
        );
        // Partial tags stay raw; validation is the classifier's call
        assert!(tags.owning_user_id.is_none());
    }

    #[test]
    fn test_malformed_blocks_are_skipped() {
        let feed = "BEGIN:VEVENT\r\nSUMMARY:No uid\r\nEND:VEVENT\r\n";
        assert!(parse_feed(feed).is_empty());
    }
}
