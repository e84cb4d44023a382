//! Inbound event classifier
//!
//! Decides whether a provider event is something we should ingest (origin),
//! one of our own mirrors echoing back (managed-own), or another
//! deployment's clone (managed-foreign). This is the loop-safety gate: a
//! mirror we wrote must never re-enter ingestion as a new canonical event.

use std::collections::HashSet;

use crate::models::{MirrorTags, NormalizedEvent};
use crate::types::{PolicyEdgeId, UserId};

/// Classification outcome, first-match over the tag tuple
#[derive(Debug, Clone, PartialEq)]
pub enum EventClass {
    /// Externally authored; feeds canonical ingestion
    Origin,
    /// Our own mirror for this user; updates drift state only
    ManagedOwn(MirrorTags),
    /// Another user's or deployment's mirror; skipped
    ManagedForeign,
    /// Tagged by us but the policy edge is no longer registered (stale or
    /// cross-deployment); skipped for ingestion, flagged in health
    ManagedOrphan(MirrorTags),
}

/// Machine-readable reason for the journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifyReason {
    NoTags,
    OwnEdgeRegistered,
    ForeignOwner,
    EdgeUnknown,
    MalformedTags,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub class: EventClass,
    pub reason: ClassifyReason,
}

/// Classify a normalized provider event.
///
/// Rule order (first match wins):
/// 1. tags valid, owner is this user, edge registered -> managed-own
/// 2. tags valid, owner is another user -> managed-foreign
/// 3. tags valid, owner is this user, edge unknown -> managed-orphan
/// 4. no tags at all -> origin
///
/// Fails closed: tags present but malformed classify as managed-foreign so
/// that a half-scrubbed mirror can never be ingested as an origin event.
pub fn classify(
    event: &NormalizedEvent,
    this_user: UserId,
    registered_edges: &HashSet<PolicyEdgeId>,
) -> Classification {
    let Some(raw) = event.tags.as_ref().filter(|t| !t.is_empty()) else {
        return Classification {
            class: EventClass::Origin,
            reason: ClassifyReason::NoTags,
        };
    };

    let Some(tags) = raw.validate() else {
        tracing::warn!(
            remote_id = %event.remote_id,
            "mirror tags present but malformed; treating as managed-foreign"
        );
        return Classification {
            class: EventClass::ManagedForeign,
            reason: ClassifyReason::MalformedTags,
        };
    };

    if tags.owning_user_id != this_user {
        return Classification {
            class: EventClass::ManagedForeign,
            reason: ClassifyReason::ForeignOwner,
        };
    }

    if registered_edges.contains(&tags.policy_edge_id) {
        Classification {
            class: EventClass::ManagedOwn(tags),
            reason: ClassifyReason::OwnEdgeRegistered,
        }
    } else {
        Classification {
            class: EventClass::ManagedOrphan(tags),
            reason: ClassifyReason::EdgeUnknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventStatus, RawMirrorTags, Transparency};
    use crate::types::CanonicalId;
    use chrono::Utc;

    fn normalized(tags: Option<RawMirrorTags>) -> NormalizedEvent {
        NormalizedEvent {
            remote_id: "remote-1".into(),
            title: "Busy".into(),
            description: None,
            location: None,
            conference_url: None,
            start_at: Utc::now(),
            end_at: Utc::now() + chrono::Duration::hours(1),
            all_day: false,
            status: EventStatus::Confirmed,
            transparency: Transparency::Opaque,
            rrule: None,
            attendee_emails: vec![],
            tags,
        }
    }

    fn tags_for(user: UserId, edge: PolicyEdgeId) -> RawMirrorTags {
        RawMirrorTags {
            canonical_id: Some(CanonicalId::generate().to_string()),
            owning_user_id: Some(user.to_string()),
            policy_edge_id: Some(edge.to_string()),
            content_hash: Some("deadbeef".into()),
        }
    }

    #[test]
    fn test_untagged_is_origin() {
        let result = classify(&normalized(None), UserId::new(), &HashSet::new());
        assert_eq!(result.class, EventClass::Origin);
        assert_eq!(result.reason, ClassifyReason::NoTags);
    }

    #[test]
    fn test_own_registered_edge_is_managed_own() {
        let user = UserId::new();
        let edge = PolicyEdgeId::new();
        let registered = HashSet::from([edge]);

        let result = classify(&normalized(Some(tags_for(user, edge))), user, &registered);
        match result.class {
            EventClass::ManagedOwn(tags) => {
                assert_eq!(tags.owning_user_id, user);
                assert_eq!(tags.content_hash, "deadbeef");
            }
            other => panic!("expected managed-own, got {other:?}"),
        }
    }

    #[test]
    fn test_other_owner_is_managed_foreign() {
        let edge = PolicyEdgeId::new();
        let registered = HashSet::from([edge]);

        let result = classify(
            &normalized(Some(tags_for(UserId::new(), edge))),
            UserId::new(),
            &registered,
        );
        assert_eq!(result.class, EventClass::ManagedForeign);
        assert_eq!(result.reason, ClassifyReason::ForeignOwner);
    }

    #[test]
    fn test_unknown_edge_is_managed_orphan() {
        let user = UserId::new();

        let result = classify(
            &normalized(Some(tags_for(user, PolicyEdgeId::new()))),
            user,
            &HashSet::new(),
        );
        assert!(matches!(result.class, EventClass::ManagedOrphan(_)));
        assert_eq!(result.reason, ClassifyReason::EdgeUnknown);
    }

    #[test]
    fn test_malformed_tags_fail_closed() {
        let raw = RawMirrorTags {
            canonical_id: Some("some-id".into()),
            owning_user_id: Some("not-a-uuid".into()),
            policy_edge_id: None,
            content_hash: None,
        };

        let result = classify(&normalized(Some(raw)), UserId::new(), &HashSet::new());
        assert_eq!(result.class, EventClass::ManagedForeign);
        assert_eq!(result.reason, ClassifyReason::MalformedTags);
    }

    #[test]
    fn test_empty_tag_struct_is_origin() {
        // Providers that always return an (empty) extended-properties map
        // must not push everything into the malformed branch.
        let result = classify(
            &normalized(Some(RawMirrorTags::default())),
            UserId::new(),
            &HashSet::new(),
        );
        assert_eq!(result.class, EventClass::Origin);
    }

    #[test]
    fn test_classification_is_total() {
        // Every tag shape lands in exactly the expected class and reason.
        let user = UserId::new();
        let edge = PolicyEdgeId::new();
        let registered = HashSet::from([edge]);

        let result = classify(&normalized(None), user, &registered);
        assert_eq!(result.class, EventClass::Origin);
        assert_eq!(result.reason, ClassifyReason::NoTags);

        let result = classify(&normalized(Some(tags_for(user, edge))), user, &registered);
        assert!(matches!(result.class, EventClass::ManagedOwn(_)));
        assert_eq!(result.reason, ClassifyReason::OwnEdgeRegistered);

        let result = classify(
            &normalized(Some(tags_for(UserId::new(), edge))),
            user,
            &registered,
        );
        assert_eq!(result.class, EventClass::ManagedForeign);
        assert_eq!(result.reason, ClassifyReason::ForeignOwner);

        let result = classify(
            &normalized(Some(tags_for(user, PolicyEdgeId::new()))),
            user,
            &registered,
        );
        assert!(matches!(result.class, EventClass::ManagedOrphan(_)));
        assert_eq!(result.reason, ClassifyReason::EdgeUnknown);

        let partial = RawMirrorTags {
            canonical_id: Some("x".into()),
            ..Default::default()
        };
        let result = classify(&normalized(Some(partial)), user, &registered);
        assert_eq!(result.class, EventClass::ManagedForeign);
        assert_eq!(result.reason, ClassifyReason::MalformedTags);
    }
}
