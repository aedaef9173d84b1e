pub mod cli;
pub mod cluster;
pub mod config;

pub use cluster::SimulatedCluster;
pub use config::ClusterConfig;
