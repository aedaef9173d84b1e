use clap::Parser;
use sentinel_common::NodeId;
use sentinel_node::{
    cli::{Cli, Commands},
    ClusterConfig, SimulatedCluster,
};
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Protocol events (target "consensus") go to the audit file only.
    std::fs::create_dir_all("logs")?;
    let file_appender = tracing_appender::rolling::never("logs", "consensus-audit.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let audit_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| metadata.target() == "consensus"));

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sentinel_consensus=debug".into()),
        )
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| metadata.target() != "consensus"));

    tracing_subscriber::registry().with(audit_layer).with(stdout_layer).init();

    match cli.command {
        Commands::InitConfig { out, nodes } => {
            let config = ClusterConfig::default().with_nodes(nodes);
            config.save_to_file(&out)?;
            info!("📝 Wrote {}-node cluster layout to {}", nodes, out.display());
        }
        Commands::Run { config, nodes, proposals, secure, silent } => {
            let mut cluster_config = match config {
                Some(path) => {
                    info!("Config: {}", path.display());
                    ClusterConfig::load_from_file(&path)?
                }
                None => ClusterConfig::default(),
            };
            if let Some(nodes) = nodes {
                cluster_config = cluster_config.with_nodes(nodes);
            }
            if let Some(limit) = proposals {
                cluster_config.proposals.truncate(limit);
            }
            cluster_config.secure |= secure;
            cluster_config.silent.extend(silent.into_iter().map(NodeId));

            run(cluster_config).await?;
        }
    }
    Ok(())
}

async fn run(config: ClusterConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut cluster = match SimulatedCluster::start(&config).await {
        Ok(cluster) => cluster,
        Err(e) => {
            error!("Failed to start cluster: {}", e);
            return Err(e.into());
        }
    };

    let mut committed = 0;
    for data in config.proposals.iter().cloned() {
        let result = cluster.submit(data).await?;
        if result.is_committed() {
            committed += 1;
            info!(
                "✅ {} committed at view {}, seq {} by {} nodes (confidence {:.2}, {} ms)",
                result.proposal_id,
                result.view,
                result.sequence_number,
                result.participating_nodes.len(),
                result.confidence,
                result.execution_time_ms
            );
        } else {
            warn!(
                "❌ {} did not commit: {}",
                result.proposal_id,
                result.failure.as_deref().unwrap_or("unknown reason")
            );
        }
    }

    for status in cluster.statuses().await {
        println!("{}", serde_json::to_string(&status)?);
    }
    info!("{}/{} proposals committed", committed, config.proposals.len());

    cluster.shutdown();
    Ok(())
}
