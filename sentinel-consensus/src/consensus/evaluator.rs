use serde::{Deserialize, Serialize};

/// BFT thresholds for a fixed membership size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumPolicy {
    pub total_nodes: usize,
    /// f = floor((n-1)/3)
    pub fault_tolerance: usize,
    /// 2f+1
    pub required_quorum: usize,
}

impl QuorumPolicy {
    pub fn for_nodes(total_nodes: usize) -> Self {
        let fault_tolerance = total_nodes.saturating_sub(1) / 3;
        Self {
            total_nodes,
            fault_tolerance,
            required_quorum: 2 * fault_tolerance + 1,
        }
    }

    pub fn has_quorum(&self, count: usize) -> bool {
        count >= self.required_quorum
    }

    /// f+1 matching VIEW-CHANGEs: at least one honest node wants to move on.
    pub fn join_threshold(&self) -> usize {
        self.fault_tolerance + 1
    }

    /// Fewer than four nodes cannot tolerate any Byzantine fault.
    pub fn is_degraded(&self) -> bool {
        self.total_nodes < 4
    }

    /// Advisory confidence for a committed round with `agreeing` matching
    /// COMMITs: 0.5 below quorum, rising linearly to 0.99 at unanimity.
    pub fn confidence(&self, agreeing: usize) -> f64 {
        if agreeing < self.required_quorum {
            return 0.5;
        }
        let span = self.total_nodes.saturating_sub(self.required_quorum) + 1;
        let above = (agreeing - self.required_quorum + 1) as f64;
        (0.5 + 0.49 * above / span as f64).clamp(0.5, 0.99)
    }
}
