use std::time::Duration;

use serde::{Deserialize, Serialize};
use sentinel_common::{NodeId, PbftError, Result};

/// Per-engine settings. Membership size is fixed for the engine's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub node_id: NodeId,
    pub total_nodes: usize,
    pub heartbeat_timeout_ms: u64,
    pub prepare_timeout_ms: u64,
    pub commit_timeout_ms: u64,
    pub view_change_timeout_ms: u64,
    /// Re-broadcasts of a stalled round before it is reported as stalled.
    pub max_round_retries: u32,
    /// Refuse to run rounds or accept unsigned messages without keys.
    pub require_signatures: bool,
    /// Start a view change when a round stalls.
    pub escalate_on_stall: bool,
    /// Executed rounds kept for audit before garbage collection.
    pub max_retained_rounds: usize,
    /// Sequence numbers accepted above `last_executed` (high watermark).
    pub sequence_window: u64,
    /// How far ahead of the current view a VIEW-CHANGE may target.
    pub max_view_lead: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::default(),
            total_nodes: 4,
            heartbeat_timeout_ms: 5_000,
            prepare_timeout_ms: 2_000,
            commit_timeout_ms: 2_000,
            view_change_timeout_ms: 5_000,
            max_round_retries: 2,
            require_signatures: false,
            escalate_on_stall: true,
            max_retained_rounds: 1_024,
            sequence_window: 256,
            max_view_lead: 16,
        }
    }
}

impl EngineConfig {
    pub fn new(node_id: impl Into<NodeId>, total_nodes: usize) -> Self {
        Self {
            node_id: node_id.into(),
            total_nodes,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(PbftError::Config("node_id must not be empty".into()));
        }
        if self.total_nodes == 0 {
            return Err(PbftError::Config("total_nodes must be at least 1".into()));
        }
        let timeouts = [
            ("heartbeat_timeout_ms", self.heartbeat_timeout_ms),
            ("prepare_timeout_ms", self.prepare_timeout_ms),
            ("commit_timeout_ms", self.commit_timeout_ms),
            ("view_change_timeout_ms", self.view_change_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(PbftError::Config(format!("{} must be positive", name)));
            }
        }
        if self.max_retained_rounds == 0 {
            return Err(PbftError::Config("max_retained_rounds must be positive".into()));
        }
        if self.sequence_window == 0 {
            return Err(PbftError::Config("sequence_window must be positive".into()));
        }
        if self.max_view_lead == 0 {
            return Err(PbftError::Config("max_view_lead must be positive".into()));
        }
        Ok(())
    }

    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_millis(self.prepare_timeout_ms)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    /// Highest sequence number a replica that executed up to `last_executed`
    /// will accept.
    pub fn high_watermark(&self, last_executed: u64) -> u64 {
        last_executed.saturating_add(self.sequence_window)
    }

    pub fn view_change_timeout(&self) -> Duration {
        Duration::from_millis(self.view_change_timeout_ms)
    }
}
