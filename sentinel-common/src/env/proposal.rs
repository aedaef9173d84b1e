use serde::{Deserialize, Serialize};

use crate::crypto::hash::digest_value;
use crate::utils::{time::current_time_millis, NodeId};

/// Something a caller wants the cluster to agree on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusProposal {
    pub proposal_id: String,
    pub proposer: NodeId,
    /// Arbitrary JSON; the only part covered by `digest`.
    pub data: serde_json::Value,
    pub timestamp: u64,
}

impl ConsensusProposal {
    pub fn new(proposer: impl Into<NodeId>, data: serde_json::Value) -> Self {
        Self {
            proposal_id: uuid::Uuid::new_v4().to_string(),
            proposer: proposer.into(),
            data,
            timestamp: current_time_millis(),
        }
    }

    pub fn with_id(mut self, proposal_id: impl Into<String>) -> Self {
        self.proposal_id = proposal_id.into();
        self
    }

    /// Hex SHA-256 over the sorted-key JSON of `data`.
    pub fn digest(&self) -> String {
        digest_value(&self.data)
    }
}
