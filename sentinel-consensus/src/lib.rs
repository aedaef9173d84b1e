//! PBFT agreement for a fixed set of registered nodes.
//!
//! `PbftEngine` runs the normal-case protocol (PRE-PREPARE, PREPARE, COMMIT,
//! execute) and the VIEW-CHANGE / NEW-VIEW sub-protocol over any
//! [`sentinel_p2p::Network`]. Up to `f = (n-1)/3` nodes may be Byzantine.

pub mod config;
pub mod consensus;

pub use config::EngineConfig;
pub use consensus::engine::{EngineStatus, PbftEngine};
pub use consensus::evaluator::QuorumPolicy;
