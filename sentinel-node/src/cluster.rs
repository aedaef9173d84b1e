use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use sentinel_common::{
    env::consensus::types::ConsensusResult, env::node::PbftNode, env::proposal::ConsensusProposal, NodeId,
    PbftError, Result,
};
use sentinel_consensus::{EngineStatus, PbftEngine};
use sentinel_p2p::InMemoryNetwork;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::ClusterConfig;

/// In-process PBFT cluster over [`InMemoryNetwork`]. Silent members are
/// registered on every engine but have no engine of their own.
pub struct SimulatedCluster {
    engines: Vec<Arc<PbftEngine>>,
    tasks: Vec<JoinHandle<()>>,
    max_submit_attempts: u32,
    settle_timeout: Duration,
}

impl SimulatedCluster {
    pub async fn start(config: &ClusterConfig) -> Result<Self> {
        config.validate()?;

        let mut wiring = Vec::new();
        let mut engines = Vec::new();
        let mut inbound = Vec::new();

        for id in config.running() {
            let (network, tx, rx) = InMemoryNetwork::new(id.clone());
            wiring.push((network.clone(), tx));

            let me = id.clone();
            let engine = PbftEngine::new(config.engine_config_for(id), Arc::new(network))?
                .with_execution_callback(move |result: ConsensusResult| {
                    info!(
                        "📦 [{}] Executed seq {} proposal {} -> {}",
                        me, result.sequence_number, result.proposal_id, result.decision
                    );
                });
            engines.push(Arc::new(engine));
            inbound.push(rx);
        }
        InMemoryNetwork::connect_all(&wiring);

        let mut members: Vec<PbftNode> = config.node_ids.iter().map(|id| PbftNode::new(id.clone())).collect();
        if config.secure {
            for engine in &engines {
                let public_key = engine.initialize_keys().await;
                if let Some(node) = members.iter_mut().find(|n| &n.node_id == engine.node_id()) {
                    node.public_key = Some(public_key);
                }
            }
        }
        for engine in &engines {
            for node in &members {
                engine.register_node(node.clone()).await;
            }
        }

        let mut tasks = Vec::new();
        for (engine, rx) in engines.iter().zip(inbound) {
            tasks.push(engine.spawn_inbound(rx));
            tasks.push(engine.spawn_liveness_monitor());
        }

        info!(
            "🚀 Cluster up: {} members, {} running, {} silent, signatures {}",
            config.node_ids.len(),
            engines.len(),
            config.silent.len(),
            if config.secure { "required" } else { "optional" }
        );

        Ok(Self {
            engines,
            tasks,
            max_submit_attempts: config.max_submit_attempts,
            settle_timeout: config.engine.view_change_timeout() * 2,
        })
    }

    pub fn engines(&self) -> &[Arc<PbftEngine>] {
        &self.engines
    }

    pub fn engine(&self, node_id: &NodeId) -> Option<&Arc<PbftEngine>> {
        self.engines.iter().find(|e| e.node_id() == node_id)
    }

    /// Hands the proposal to every running node, as a PBFT client would, and
    /// returns the first committed result. Re-submits after a view change.
    pub async fn submit(&self, data: Value) -> Result<ConsensusResult> {
        let first = self
            .engines
            .first()
            .ok_or_else(|| PbftError::NotReady("no running nodes".into()))?;
        let proposal = ConsensusProposal::new(first.node_id().clone(), data);

        let mut last = None;
        for attempt in 1..=self.max_submit_attempts {
            let results = join_all(self.engines.iter().map(|e| e.reach_consensus(proposal.clone()))).await;

            if let Some(done) = results.iter().find(|r| r.is_committed()) {
                return Ok(done.clone());
            }
            warn!(
                "🔁 Proposal {} not committed (attempt {}/{}), waiting for the cluster to settle",
                proposal.proposal_id, attempt, self.max_submit_attempts
            );
            last = results.into_iter().next();
            self.settle().await;
        }
        last.ok_or_else(|| PbftError::NotReady("no running nodes".into()))
    }

    /// Waits until every running node sits in the same installed view.
    pub async fn settle(&self) -> bool {
        let deadline = Instant::now() + self.settle_timeout;
        loop {
            let statuses = self.statuses().await;
            let view = statuses.first().map(|s| s.view);
            if statuses.iter().all(|s| !s.view_change_pending && Some(s.view) == view) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn statuses(&self) -> Vec<EngineStatus> {
        join_all(self.engines.iter().map(|e| e.get_status())).await
    }

    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for SimulatedCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}
