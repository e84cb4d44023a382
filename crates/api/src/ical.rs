//! iCalendar export for canonical events

use icalendar::{Calendar, Component, Event as IcalEvent, EventLike};

use tminus_core::models::{CanonicalEvent, EventStatus};

/// Serialize one canonical event as an RFC 5545 VCALENDAR.
///
/// Participant hashes deliberately never leave as ATTENDEE lines: exports
/// carry the body of the event, not its audience.
pub fn event_to_ical(event: &CanonicalEvent) -> String {
    let mut ical_event = IcalEvent::new();

    ical_event.uid(event.id.as_str());
    ical_event.summary(&event.title);

    if let Some(description) = &event.description {
        ical_event.description(description);
    }
    if let Some(location) = &event.location {
        ical_event.location(location);
    }

    if event.all_day {
        ical_event.all_day(event.start_at.date_naive());
    } else {
        ical_event.starts(event.start_at);
        ical_event.ends(event.end_at);
    }

    let status = match event.status {
        EventStatus::Confirmed => "CONFIRMED",
        EventStatus::Tentative => "TENTATIVE",
        EventStatus::Cancelled => "CANCELLED",
    };
    ical_event.add_property("STATUS", status);

    if let Some(rrule) = &event.rrule {
        ical_event.add_property("RRULE", rrule);
    }

    ical_event.sequence(event.version as u32);
    ical_event.timestamp(event.created_at);
    // RFC 5545 wants basic ISO 8601 here; extended format trips some clients
    let last_modified = event.updated_at.format("%Y%m%dT%H%M%SZ").to_string();
    ical_event.add_property("LAST-MODIFIED", &last_modified);

    let mut calendar = Calendar::new();
    calendar.push(ical_event);
    calendar.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tminus_core::models::{EventSource, Transparency, Visibility};
    use tminus_core::types::{CanonicalId, UserId};

    fn event() -> CanonicalEvent {
        CanonicalEvent {
            id: CanonicalId::generate(),
            user_id: UserId::new(),
            source: EventSource::System,
            origin_account_id: None,
            origin_remote_id: None,
            title: "Quarterly planning".into(),
            description: Some("Agenda attached".into()),
            location: Some("Room 2".into()),
            conference_url: None,
            start_at: Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap(),
            end_at: Utc.with_ymd_and_hms(2026, 3, 2, 11, 0, 0).unwrap(),
            all_day: false,
            status: EventStatus::Confirmed,
            visibility: Visibility::Default,
            transparency: Transparency::Opaque,
            rrule: Some("FREQ=WEEKLY".into()),
            participant_hashes: vec!["deadbeef".into()],
            version: 2,
            deleted_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_export_carries_body_fields() {
        let ical = event_to_ical(&event());

        assert!(ical.contains("BEGIN:VCALENDAR"));
        assert!(ical.contains("SUMMARY:Quarterly planning"));
        assert!(ical.contains("LOCATION:Room 2"));
        assert!(ical.contains("STATUS:CONFIRMED"));
        assert!(ical.contains("RRULE:FREQ=WEEKLY"));
    }

    #[test]
    fn test_export_never_leaks_participants() {
        let ical = event_to_ical(&event());
        assert!(!ical.contains("ATTENDEE"));
        assert!(!ical.contains("deadbeef"));
    }
}
