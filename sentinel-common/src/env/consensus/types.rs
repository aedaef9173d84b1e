use std::fmt;

use serde::{Deserialize, Serialize};

use crate::utils::NodeId;

/// Phases a round moves through on one node. Totally ordered, so "at least
/// prepared" is a plain comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsensusPhase {
    /// No round in flight.
    Idle,
    /// A PRE-PREPARE from the primary was accepted.
    PrePrepared,
    /// 2f+1 matching PREPAREs were counted.
    Prepared,
    /// 2f+1 matching COMMITs were counted.
    Committed,
    /// The decision was applied in sequence order.
    Executed,
}

impl Default for ConsensusPhase {
    fn default() -> Self {
        Self::Idle
    }
}

impl fmt::Display for ConsensusPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConsensusPhase::Idle => "IDLE",
            ConsensusPhase::PrePrepared => "PRE_PREPARED",
            ConsensusPhase::Prepared => "PREPARED",
            ConsensusPhase::Committed => "COMMITTED",
            ConsensusPhase::Executed => "EXECUTED",
        };
        write!(f, "{}", s)
    }
}

/// What a caller gets back from one consensus round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    /// The proposal this result corresponds to.
    pub proposal_id: String,

    /// The accepted data. For a degraded result this is the submitted data,
    /// which was NOT agreed on.
    pub decision: serde_json::Value,

    /// Nodes whose matching COMMIT was counted, sorted.
    pub participating_nodes: Vec<NodeId>,

    pub view: u64,
    pub sequence_number: u64,

    /// Terminal phase the round reached on this node.
    pub phase: ConsensusPhase,

    /// Advisory only, in [0.5, 0.99]. Use `is_committed` for safety decisions.
    pub confidence: f64,

    pub execution_time_ms: u64,

    /// Why the round did not commit, when it did not.
    #[serde(default)]
    pub failure: Option<String>,
}

impl ConsensusResult {
    /// Confidence reported when agreement was not reached.
    pub const DEGRADED_CONFIDENCE: f64 = 0.5;

    /// Result for a round that never reached agreement.
    pub fn degraded(
        proposal_id: impl Into<String>,
        data: serde_json::Value,
        node_id: NodeId,
        view: u64,
        sequence_number: u64,
        execution_time_ms: u64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            proposal_id: proposal_id.into(),
            decision: data,
            participating_nodes: vec![node_id],
            view,
            sequence_number,
            phase: ConsensusPhase::Idle,
            confidence: Self::DEGRADED_CONFIDENCE,
            execution_time_ms,
            failure: Some(reason.into()),
        }
    }

    pub fn is_committed(&self) -> bool {
        self.phase >= ConsensusPhase::Committed
    }
}
