//! Write tasks emitted by the coordinator toward the write pipeline
//!
//! Tasks travel over a bounded channel per deployment; the write pipeline
//! fans them out into ordered per-account queues. A full channel blocks the
//! coordinator's dispatch, which is the intended backpressure: ingestion
//! slows down when providers cannot keep up.

use tminus_core::models::{CalendarKind, MirrorPayload};
use tminus_core::projection::WriteOp;
use tminus_core::types::{AccountId, CanonicalId, HoldId, PolicyEdgeId, UserId};

/// Why a provider write is happening
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePurpose {
    /// Policy-edge mirror of a canonical event
    Mirror,
    /// Tentative reservation placed while a scheduling session gathers
    HoldPlace { hold_id: HoldId },
    /// Patch a tentative reservation into the committed event body
    HoldConvert { hold_id: HoldId },
    /// Remove a tentative reservation (release or rollback)
    HoldRemove { hold_id: HoldId },
}

/// One provider write, fully compiled and idempotent
#[derive(Debug, Clone)]
pub struct WriteTask {
    pub user_id: UserId,
    pub target_account_id: AccountId,
    pub canonical_id: Option<CanonicalId>,
    pub policy_edge_id: Option<PolicyEdgeId>,
    pub calendar_kind: CalendarKind,
    pub op: WriteOp,
    pub purpose: WritePurpose,
    /// Absent for deletes
    pub payload: Option<MirrorPayload>,
    pub content_hash: String,
    pub idempotency_key: String,
    /// Provider-side id of the event being patched or deleted
    pub remote_mirror_id: Option<String>,
}

impl WriteTask {
    /// Stale-work guard: deletes need a remote id, creates must not have one
    pub fn is_coherent(&self) -> bool {
        match self.op {
            WriteOp::Create => self.payload.is_some(),
            WriteOp::Patch => self.payload.is_some() && self.remote_mirror_id.is_some(),
            WriteOp::Delete => self.remote_mirror_id.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coherence_rules() {
        let base = WriteTask {
            user_id: UserId::new(),
            target_account_id: AccountId::new(),
            canonical_id: None,
            policy_edge_id: None,
            calendar_kind: CalendarKind::PrimaryMirror,
            op: WriteOp::Delete,
            purpose: WritePurpose::HoldRemove {
                hold_id: HoldId::new(),
            },
            payload: None,
            content_hash: String::new(),
            idempotency_key: "k".into(),
            remote_mirror_id: Some("m-1".into()),
        };

        assert!(base.is_coherent());

        let delete_without_remote = WriteTask {
            remote_mirror_id: None,
            ..base.clone()
        };
        assert!(!delete_without_remote.is_coherent());

        let create_without_payload = WriteTask {
            op: WriteOp::Create,
            ..base
        };
        assert!(!create_without_payload.is_coherent());
    }
}
