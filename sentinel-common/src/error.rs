use thiserror::Error;

use crate::env::consensus::types::ConsensusPhase;
use crate::utils::NodeId;

/// Errors raised inside the consensus protocol.
///
/// None of these escape `PbftEngine::reach_consensus`; they are turned into a
/// degraded `ConsensusResult` there. Inbound message handling and the
/// construction/configuration path return them directly.
#[derive(Debug, Error)]
pub enum PbftError {
    #[error("Invalid config: {0}")]
    Config(String),

    #[error("Engine not ready: {0}")]
    NotReady(String),

    #[error("Signing keys required but not initialized")]
    KeysRequired,

    #[error("Timed out in {phase:?} (view {view}, sequence {sequence})")]
    Timeout {
        phase: ConsensusPhase,
        view: u64,
        sequence: u64,
    },

    #[error("Round stalled in {phase:?} after {attempts} attempts (view {view}, sequence {sequence})")]
    RoundStalled {
        phase: ConsensusPhase,
        view: u64,
        sequence: u64,
        attempts: u32,
    },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid signature from node {0}")]
    InvalidSignature(NodeId),

    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Node {0} equivocated")]
    Equivocation(NodeId),

    #[error("Wrong view: expected {expected}, got {actual}")]
    WrongView { expected: u64, actual: u64 },

    #[error("Sequence {sequence} outside window ({low}, {high}]")]
    OutOfWindow { sequence: u64, low: u64, high: u64 },

    #[error("Node {0} is not the primary for this view")]
    NotPrimary(NodeId),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Other: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, PbftError>;

impl PbftError {
    /// Whether the error points at a misbehaving sender rather than at us.
    pub fn is_byzantine(&self) -> bool {
        matches!(
            self,
            PbftError::InvalidSignature(_)
                | PbftError::DigestMismatch { .. }
                | PbftError::Equivocation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byzantine_classification() {
        assert!(PbftError::InvalidSignature(NodeId::from("n1")).is_byzantine());
        let mismatch = PbftError::DigestMismatch { expected: "a".into(), actual: "b".into() };
        assert!(mismatch.is_byzantine());
        assert!(PbftError::Equivocation(NodeId::from("n2")).is_byzantine());
        assert!(!PbftError::NotReady("no nodes".into()).is_byzantine());
    }

    #[test]
    fn test_display_mentions_slot() {
        let err = PbftError::RoundStalled { phase: ConsensusPhase::PrePrepared, view: 2, sequence: 9, attempts: 3 };
        let text = err.to_string();
        assert!(text.contains("view 2"));
        assert!(text.contains("sequence 9"));
    }
}
