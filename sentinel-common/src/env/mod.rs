pub mod consensus;
pub mod message;
pub mod node;
pub mod proposal;

use consensus::types::ConsensusResult;

/// Invoked once per executed round, on every node that executes it.
pub trait Callback: Fn(ConsensusResult) + Send + Sync {}
impl<T> Callback for T where T: Fn(ConsensusResult) + Send + Sync {}
