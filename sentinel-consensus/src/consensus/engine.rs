use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sentinel_common::{
    auth::{ed25519::Ed25519Authenticator, Authenticator},
    env::consensus::{
        evidence::EquivocationEvidence,
        types::{ConsensusPhase, ConsensusResult},
    },
    env::message::PbftMessage,
    env::node::PbftNode,
    env::proposal::ConsensusProposal,
    env::Callback,
    utils::time::current_time_millis,
    NodeId, PbftError, Result,
};
use sentinel_p2p::{codec, ClusterMessage, InMemoryNetwork, Network};
use tokio::sync::{mpsc::Receiver, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    evaluator::QuorumPolicy,
    state::{verify_hex, ReplicaState, Step},
};
use crate::config::EngineConfig;

/// Read-only snapshot returned by [`PbftEngine::get_status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub node_id: NodeId,
    pub view: u64,
    pub sequence_number: u64,
    pub phase: ConsensusPhase,
    pub is_primary: bool,
    pub primary: Option<NodeId>,
    pub total_nodes: usize,
    pub fault_tolerance: usize,
    pub required_quorum: usize,
    pub registered_nodes: usize,
    pub live_nodes: usize,
    pub last_executed: u64,
    pub secure_signing: bool,
    pub degraded_fault_tolerance: bool,
    pub view_change_pending: bool,
    pub pending_evidence: usize,
}

/// One PBFT replica.
///
/// Protocol state sits behind a single async mutex. Handlers lock, mutate,
/// collect outgoing messages and unlock before anything is sent.
pub struct PbftEngine {
    config: EngineConfig,
    policy: QuorumPolicy,
    pub(crate) state: Mutex<ReplicaState>,
    /// Serialises `reach_consensus` calls on this engine.
    round_lock: Mutex<()>,
    /// Bumped after every processed message; round waiters watch it.
    progress: watch::Sender<u64>,
    network: Arc<dyn Network>,
    on_execute: Option<Arc<dyn Fn(ConsensusResult) + Send + Sync>>,
}

enum Slot {
    Done(ConsensusResult),
    Open(u64, u64),
    Lead,
}

fn phase_reached(view: u64, sequence: u64, target: ConsensusPhase) -> impl Fn(&ReplicaState) -> Option<()> {
    move |st| (st.round_phase(view, sequence) >= target).then_some(())
}

impl PbftEngine {
    pub fn new(config: EngineConfig, network: Arc<dyn Network>) -> Result<Self> {
        config.validate()?;
        let policy = QuorumPolicy::for_nodes(config.total_nodes);

        if policy.is_degraded() {
            warn!(
                "⚠️ [{}] {} nodes cannot tolerate a Byzantine fault (need at least 4)",
                config.node_id, config.total_nodes
            );
        }
        info!(
            "🛡️ [{}] PBFT engine ready: n={}, f={}, quorum={}",
            config.node_id, policy.total_nodes, policy.fault_tolerance, policy.required_quorum
        );

        let (progress, _) = watch::channel(0u64);
        Ok(Self {
            state: Mutex::new(ReplicaState::new(config.clone(), policy)),
            config,
            policy,
            round_lock: Mutex::new(()),
            progress,
            network,
            on_execute: None,
        })
    }

    /// Engine with an unconnected in-memory transport. Only useful on its own
    /// when `total_nodes` is 1, or for inspecting local behaviour.
    pub fn standalone(node_id: impl Into<NodeId>, total_nodes: usize) -> Result<Self> {
        let config = EngineConfig::new(node_id, total_nodes);
        let (network, _, _) = InMemoryNetwork::new(config.node_id.clone());
        Self::new(config, Arc::new(network))
    }

    /// Called with every round this node executes, in sequence order.
    pub fn with_execution_callback(mut self, callback: impl Callback + 'static) -> Self {
        let callback: Arc<dyn Fn(ConsensusResult) + Send + Sync> = Arc::new(callback);
        self.on_execute = Some(callback);
        self
    }

    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn policy(&self) -> QuorumPolicy {
        self.policy
    }

    /// Generates a fresh Ed25519 keypair for this node and returns its public key.
    pub async fn initialize_keys(&self) -> Vec<u8> {
        self.set_authenticator(Arc::new(Ed25519Authenticator::generate())).await
    }

    /// Installs signing keys and publishes the public key into this node's
    /// own registry entry.
    pub async fn set_authenticator(&self, authenticator: Arc<dyn Authenticator>) -> Vec<u8> {
        let public_key = authenticator.public_key();
        let mut st = self.state.lock().await;
        st.authenticator = Some(authenticator);
        st.membership.set_public_key(self.node_id(), public_key.clone());
        info!("🔑 [{}] Signing keys installed", self.node_id());
        public_key
    }

    /// Adds or replaces a member (last write wins) and re-runs primary selection.
    pub async fn register_node(&self, mut node: PbftNode) {
        let mut st = self.state.lock().await;

        if node.node_id == *self.node_id() && node.public_key.is_none() {
            node.public_key = st.authenticator.as_ref().map(|a| a.public_key());
        }
        let id = node.node_id.clone();
        if st.membership.register(node) {
            info!("➕ [{}] Registered node {}", self.node_id(), id);
        } else {
            debug!("[{}] Replaced registration of {}", self.node_id(), id);
        }
        if st.membership.len() > self.config.total_nodes {
            warn!(
                "⚠️ [{}] {} nodes registered but total_nodes is {}",
                self.node_id(),
                st.membership.len(),
                self.config.total_nodes
            );
        }
        let view = st.view;
        st.membership.select_primary(view);
    }

    /// Runs one proposal through PRE-PREPARE, PREPARE, COMMIT and execution.
    ///
    /// Never fails: anything that keeps the round from committing yields a
    /// degraded result (`IDLE`, confidence 0.5, this node as sole participant)
    /// with the reason in `failure`.
    pub async fn reach_consensus(&self, proposal: ConsensusProposal) -> ConsensusResult {
        let _serial = self.round_lock.lock().await;
        let started = Instant::now();
        info!("📨 [{}] Reaching consensus on proposal {}", self.node_id(), proposal.proposal_id);

        match self.run_round(&proposal).await {
            Ok(mut result) => {
                result.execution_time_ms = started.elapsed().as_millis() as u64;
                info!(
                    "✅ [{}] Proposal {} executed at seq {} (view {}, {} participants, confidence {:.2})",
                    self.node_id(),
                    result.proposal_id,
                    result.sequence_number,
                    result.view,
                    result.participating_nodes.len(),
                    result.confidence
                );
                result
            }
            Err(e) => {
                warn!("❌ [{}] Proposal {} did not commit: {}", self.node_id(), proposal.proposal_id, e);
                let (view, sequence) = {
                    let st = self.state.lock().await;
                    (st.view, st.sequence)
                };
                ConsensusResult::degraded(
                    proposal.proposal_id,
                    proposal.data,
                    self.node_id().clone(),
                    view,
                    sequence,
                    started.elapsed().as_millis() as u64,
                    e.to_string(),
                )
            }
        }
    }

    async fn run_round(&self, proposal: &ConsensusProposal) -> Result<ConsensusResult> {
        self.ensure_ready().await?;

        let mut attempts: u32 = 0;
        loop {
            match self.attempt_round(proposal).await {
                Err(PbftError::Timeout { phase, view, sequence }) => {
                    if attempts < self.config.max_round_retries {
                        attempts += 1;
                        warn!(
                            "⏳ [{}] Timed out in {} (view {}, seq {}), retry {}/{}",
                            self.node_id(), phase, view, sequence, attempts, self.config.max_round_retries
                        );
                        self.retransmit(view, sequence).await;
                        continue;
                    }
                    if self.config.escalate_on_stall {
                        if let Some(new_view) = self.escalate(view).await {
                            warn!("🔄 [{}] Round stalled, escalated to view {}", self.node_id(), new_view);
                        }
                    }
                    return Err(PbftError::RoundStalled { phase, view, sequence, attempts: attempts + 1 });
                }
                other => return other,
            }
        }
    }

    async fn ensure_ready(&self) -> Result<()> {
        let st = self.state.lock().await;
        if st.membership.is_empty() {
            return Err(PbftError::NotReady("no registered nodes".into()));
        }
        if !st.membership.contains(self.node_id()) {
            return Err(PbftError::NotReady(format!("local node {} is not registered", self.node_id())));
        }
        if st.membership.len() > self.config.total_nodes {
            return Err(PbftError::NotReady(format!(
                "{} nodes registered but total_nodes is {}",
                st.membership.len(),
                self.config.total_nodes
            )));
        }
        if self.config.require_signatures && st.authenticator.is_none() {
            return Err(PbftError::KeysRequired);
        }
        if st.view_change_started.is_some() {
            return Err(PbftError::NotReady(format!("view change to {} in progress", st.view)));
        }
        Ok(())
    }

    async fn attempt_round(&self, proposal: &ConsensusProposal) -> Result<ConsensusResult> {
        let proposal_id = proposal.proposal_id.as_str();
        let prepare_deadline = Instant::now() + self.config.prepare_timeout();

        // Find or open the slot. Replicas wait for the primary's PRE-PREPARE.
        let slot = self
            .wait_until(prepare_deadline, |st| {
                if let Some(done) = st.executed_result(proposal_id) {
                    return Some(Slot::Done(done.clone()));
                }
                if st.view_change_started.is_some() {
                    return None;
                }
                if let Some(round) = st.rounds.find_by_proposal(st.view, proposal_id) {
                    return Some(Slot::Open(round.view, round.sequence_number));
                }
                st.is_primary().then_some(Slot::Lead)
            })
            .await;

        let (view, sequence) = match slot {
            Some(Slot::Done(result)) => return Ok(result),
            Some(Slot::Open(view, sequence)) => (view, sequence),
            Some(Slot::Lead) => {
                let (view, sequence, pre_prepare) = self.state.lock().await.open_round(proposal)?;
                if let Some(message) = pre_prepare {
                    self.publish(vec![message]).await;
                }
                (view, sequence)
            }
            None => return Err(self.timeout_error(None).await),
        };

        let reached = |target| phase_reached(view, sequence, target);
        if self.wait_until(prepare_deadline, reached(ConsensusPhase::Prepared)).await.is_none() {
            return Err(self.timeout_error(Some((view, sequence))).await);
        }
        let commit_deadline = Instant::now() + self.config.commit_timeout();
        if self.wait_until(commit_deadline, reached(ConsensusPhase::Committed)).await.is_none() {
            return Err(self.timeout_error(Some((view, sequence))).await);
        }

        // Committed; execution may still wait on lower sequence numbers.
        let execute_deadline = Instant::now() + self.config.commit_timeout();
        match self
            .wait_until(execute_deadline, |st| st.executed_result(proposal_id).cloned())
            .await
        {
            Some(result) => Ok(result),
            None => Err(self.timeout_error(Some((view, sequence))).await),
        }
    }

    async fn timeout_error(&self, slot: Option<(u64, u64)>) -> PbftError {
        let st = self.state.lock().await;
        match slot {
            Some((view, sequence)) => PbftError::Timeout {
                phase: st.round_phase(view, sequence),
                view,
                sequence,
            },
            None => PbftError::Timeout {
                phase: ConsensusPhase::Idle,
                view: st.view,
                sequence: st.sequence,
            },
        }
    }

    /// Re-evaluates `check` after every processed message until it yields a
    /// value or `deadline` passes.
    async fn wait_until<T, F>(&self, deadline: Instant, mut check: F) -> Option<T>
    where
        F: FnMut(&ReplicaState) -> Option<T>,
    {
        // subscribe before the first check so no bump is missed
        let mut progress = self.progress.subscribe();
        loop {
            if let Some(value) = check(&*self.state.lock().await) {
                return Some(value);
            }
            match tokio::time::timeout_at(deadline, progress.changed()).await {
                Ok(Ok(())) => continue,
                _ => return check(&*self.state.lock().await),
            }
        }
    }

    /// Verifies, records and acts on one inbound message. Returns the
    /// messages this node sent in response.
    pub async fn handle_message(&self, message: PbftMessage) -> Result<Vec<PbftMessage>> {
        let kind = message.message_type;
        let sender = message.node_id.clone();

        let step = self.state.lock().await.process(message);
        self.notify_progress();

        match step {
            Ok(step) => Ok(self.apply(step).await),
            Err(e) => {
                warn!("⚠️ [{}] Dropped {} from {}: {}", self.node_id(), kind, sender, e);
                Err(e)
            }
        }
    }

    /// Decodes frames from `rx` and feeds them to [`PbftEngine::handle_message`].
    pub fn spawn_inbound(self: &Arc<Self>, mut rx: Receiver<ClusterMessage>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    ClusterMessage::Pbft(frame) => match codec::decode(&frame) {
                        Ok(message) => {
                            // rejections are already logged
                            let _ = engine.handle_message(message).await;
                        }
                        Err(e) => warn!("⚠️ [{}] Undecodable frame: {}", engine.node_id(), e),
                    },
                    ClusterMessage::Heartbeat { from, .. } => {
                        if let Err(e) = engine.record_heartbeat(&from).await {
                            debug!("[{}] heartbeat ignored: {}", engine.node_id(), e);
                        }
                    }
                }
            }
            debug!("[{}] inbound stream closed", engine.node_id());
        })
    }

    /// Fires execution callbacks, then publishes the outgoing messages.
    async fn apply(&self, step: Step) -> Vec<PbftMessage> {
        self.fire(step.executed);
        self.publish(step.outgoing).await
    }

    /// Processes each message locally and broadcasts the ones this node
    /// accepts, following up with whatever they produce. Returns everything
    /// that was sent.
    pub(crate) async fn publish(&self, messages: Vec<PbftMessage>) -> Vec<PbftMessage> {
        let mut queue: VecDeque<PbftMessage> = messages.into();
        let mut sent = Vec::new();

        while let Some(message) = queue.pop_front() {
            let step = self.state.lock().await.process(message.clone());
            self.notify_progress();

            match step {
                Ok(step) => {
                    self.transmit(&message).await;
                    self.fire(step.executed);
                    queue.extend(step.outgoing);
                    sent.push(message);
                }
                Err(e) => warn!(
                    "⚠️ [{}] Own {} for view {} seq {} rejected locally: {}",
                    self.node_id(), message.message_type, message.view, message.sequence_number, e
                ),
            }
        }
        sent
    }

    async fn transmit(&self, message: &PbftMessage) {
        let frame = match codec::encode(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("⚠️ [{}] Could not encode {}: {}", self.node_id(), message.message_type, e);
                return;
            }
        };
        let sent = self.network.broadcast(ClusterMessage::Pbft(frame)).await;
        if let Err(e) = sent.map_err(PbftError::from) {
            warn!("⚠️ [{}] Broadcast of {} failed: {}", self.node_id(), message.message_type, e);
        }
    }

    /// Re-broadcasts this node's own messages for a slot.
    async fn retransmit(&self, view: u64, sequence: u64) {
        let own = {
            let st = self.state.lock().await;
            st.rounds
                .get(view, sequence)
                .map(|r| r.own_messages(self.node_id()))
                .unwrap_or_default()
        };
        for message in &own {
            self.transmit(message).await;
        }
    }

    fn fire(&self, executed: Vec<ConsensusResult>) {
        if let Some(callback) = &self.on_execute {
            for result in executed {
                callback(result);
            }
        }
    }

    pub(crate) fn notify_progress(&self) {
        self.progress.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Hex signature over the message digest; the digest itself without keys.
    pub async fn sign(&self, message: &PbftMessage) -> Result<String> {
        let st = self.state.lock().await;
        let signed = st.sign(message.clone())?;
        signed
            .signature
            .ok_or_else(|| PbftError::Other("signer returned no signature".into()))
    }

    /// Checks `signature` over the message digest. Any decoding or
    /// verification problem is `false`.
    pub fn verify_signature(&self, message: &PbftMessage, signature: &str, public_key: &[u8]) -> bool {
        verify_hex(&message.signing_bytes(), signature, public_key)
    }

    pub async fn get_status(&self) -> EngineStatus {
        let st = self.state.lock().await;
        EngineStatus {
            node_id: self.node_id().clone(),
            view: st.view,
            sequence_number: st.sequence,
            phase: st.phase,
            is_primary: st.is_primary(),
            primary: st.membership.primary().cloned(),
            total_nodes: self.policy.total_nodes,
            fault_tolerance: self.policy.fault_tolerance,
            required_quorum: self.policy.required_quorum,
            registered_nodes: st.membership.len(),
            live_nodes: st.membership.live_count(self.config.heartbeat_timeout_ms, current_time_millis()),
            last_executed: st.last_executed,
            secure_signing: st.authenticator.is_some(),
            degraded_fault_tolerance: self.policy.is_degraded(),
            view_change_pending: st.view_change_started.is_some(),
            pending_evidence: st.evidence.len(),
        }
    }

    /// Drains collected equivocation evidence.
    pub async fn take_evidence(&self) -> Vec<EquivocationEvidence> {
        std::mem::take(&mut self.state.lock().await.evidence)
    }

    /// Refreshes a member's liveness from an external membership layer.
    pub async fn record_heartbeat(&self, node_id: &NodeId) -> Result<()> {
        if self.state.lock().await.membership.touch(node_id) {
            Ok(())
        } else {
            Err(PbftError::UnknownNode(node_id.clone()))
        }
    }

    /// A snapshot of a registered node.
    pub async fn node(&self, node_id: &NodeId) -> Option<PbftNode> {
        self.state.lock().await.membership.get(node_id).cloned()
    }

    /// Result of an executed proposal, if this node still retains it.
    pub async fn executed_result(&self, proposal_id: &str) -> Option<ConsensusResult> {
        self.state.lock().await.executed_result(proposal_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        assert!(matches!(PbftEngine::standalone("", 4), Err(PbftError::Config(_))));
        assert!(matches!(PbftEngine::standalone("n1", 0), Err(PbftError::Config(_))));
    }

    #[tokio::test]
    async fn test_status_reports_thresholds() {
        let engine = PbftEngine::standalone("n1", 4).unwrap();
        let status = engine.get_status().await;
        assert_eq!(status.fault_tolerance, 1);
        assert_eq!(status.required_quorum, 3);
        assert_eq!(status.view, 0);
        assert_eq!(status.phase, ConsensusPhase::Idle);
        assert!(!status.secure_signing);
        assert!(!status.degraded_fault_tolerance);
        assert!(status.primary.is_none());

        let small = PbftEngine::standalone("n1", 2).unwrap();
        assert!(small.get_status().await.degraded_fault_tolerance);
    }

    #[tokio::test]
    async fn test_register_node_selects_primary() {
        let engine = PbftEngine::standalone("n2", 4).unwrap();
        engine.register_node(PbftNode::new("n2")).await;
        assert!(engine.get_status().await.is_primary);

        engine.register_node(PbftNode::new("n1")).await;
        let status = engine.get_status().await;
        assert!(!status.is_primary);
        assert_eq!(status.primary, Some(NodeId::from("n1")));
        assert!(engine.node(&NodeId::from("n1")).await.unwrap().is_primary);
    }

    #[tokio::test]
    async fn test_keys_are_published_into_own_entry() {
        let engine = PbftEngine::standalone("n1", 1).unwrap();
        engine.register_node(PbftNode::new("n1")).await;
        let public_key = engine.initialize_keys().await;

        let me = engine.node(&NodeId::from("n1")).await.unwrap();
        assert_eq!(me.public_key, Some(public_key));
        assert!(engine.get_status().await.secure_signing);
    }

    #[tokio::test]
    async fn test_record_heartbeat_requires_membership() {
        let engine = PbftEngine::standalone("n1", 1).unwrap();
        engine.register_node(PbftNode::new("n1")).await;
        assert!(engine.record_heartbeat(&NodeId::from("n1")).await.is_ok());
        assert!(matches!(
            engine.record_heartbeat(&NodeId::from("n9")).await,
            Err(PbftError::UnknownNode(_))
        ));
    }

    #[tokio::test]
    async fn test_placeholder_signature_without_keys() {
        let engine = PbftEngine::standalone("n1", 1).unwrap();
        let msg = PbftMessage::vote(
            sentinel_common::env::message::MessageType::Prepare,
            0,
            1,
            NodeId::from("n1"),
            "p",
            &ConsensusProposal::new("n1", json!(1)).digest(),
        );
        assert_eq!(engine.sign(&msg).await.unwrap(), msg.digest());
    }
}
