use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "sentinel-node")]
#[command(about = "PBFT cluster simulator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Boot an in-memory cluster and run proposals through it
    Run {
        /// Cluster layout; defaults are used when omitted
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// Number of nodes, overrides the config file
        #[arg(short, long)]
        nodes: Option<usize>,
        /// Run only the first N proposals
        #[arg(short, long)]
        proposals: Option<usize>,
        /// Generate keys and require signatures
        #[arg(long)]
        secure: bool,
        /// Nodes to register but never start
        #[arg(long, value_name = "NODE_ID")]
        silent: Vec<String>,
    },
    /// Write a default cluster layout
    InitConfig {
        #[arg(short, long, value_name = "OUT", default_value = "cluster.json")]
        out: PathBuf,
        #[arg(short, long, default_value_t = 4)]
        nodes: usize,
    },
}
