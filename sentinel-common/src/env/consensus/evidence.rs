use serde::{Deserialize, Serialize};

use crate::env::message::{MessageType, PbftMessage};
use crate::utils::NodeId;

/// Proof that a node signed two different proposal digests for the same
/// `(message_type, view, sequence)`. Both messages are kept as received so
/// a third party can re-check the signatures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquivocationEvidence {
    pub offender: NodeId,
    pub view: u64,
    pub sequence_number: u64,
    pub message_type: MessageType,
    pub first: PbftMessage,
    pub second: PbftMessage,
}

impl EquivocationEvidence {
    /// Returns `None` unless the two messages really conflict.
    pub fn from_conflict(first: PbftMessage, second: PbftMessage) -> Option<Self> {
        if first.node_id != second.node_id || first.slot() != second.slot() {
            return None;
        }
        if first.proposal_digest() == second.proposal_digest() {
            return None;
        }

        Some(Self {
            offender: first.node_id.clone(),
            view: first.view,
            sequence_number: first.sequence_number,
            message_type: first.message_type,
            first,
            second,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepare(node: &str, digest: &str) -> PbftMessage {
        PbftMessage::vote(MessageType::Prepare, 0, 1, NodeId::from(node), "p1", digest)
    }

    #[test]
    fn test_conflicting_digests_produce_evidence() {
        let evidence = EquivocationEvidence::from_conflict(prepare("n2", "aa"), prepare("n2", "bb")).unwrap();
        assert_eq!(evidence.offender, NodeId::from("n2"));
        assert_eq!(evidence.message_type, MessageType::Prepare);
        assert_eq!(evidence.sequence_number, 1);
    }

    #[test]
    fn test_same_digest_or_different_sender_is_not_evidence() {
        assert!(EquivocationEvidence::from_conflict(prepare("n2", "aa"), prepare("n2", "aa")).is_none());
        assert!(EquivocationEvidence::from_conflict(prepare("n2", "aa"), prepare("n3", "bb")).is_none());
    }
}
