use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use sentinel_common::{
    auth::{ed25519::verify_detached, Authenticator},
    env::consensus::{
        evidence::EquivocationEvidence,
        types::{ConsensusPhase, ConsensusResult},
    },
    env::message::{MessageType, PbftMessage},
    env::proposal::ConsensusProposal,
    NodeId, PbftError, Result,
};
use tracing::{debug, info, warn};

use super::{
    evaluator::QuorumPolicy,
    membership::Membership,
    registry::{Recorded, RoundRegistry},
    view_change::ViewChangeCollector,
};
use crate::config::EngineConfig;

/// What processing one message produced: messages to publish and rounds
/// that executed as a result.
#[derive(Debug, Default)]
pub(crate) struct Step {
    pub outgoing: Vec<PbftMessage>,
    pub executed: Vec<ConsensusResult>,
}

impl Step {
    pub fn merge(&mut self, other: Step) {
        self.outgoing.extend(other.outgoing);
        self.executed.extend(other.executed);
    }
}

/// Protocol state of one replica. Every method is synchronous and runs under
/// the engine's state lock; nothing here touches the network.
pub(crate) struct ReplicaState {
    pub node_id: NodeId,
    pub config: EngineConfig,
    pub policy: QuorumPolicy,
    pub view: u64,
    /// Highest sequence number assigned or accepted so far.
    pub sequence: u64,
    /// Phase of the most recently advanced round in the current view.
    pub phase: ConsensusPhase,
    pub last_executed: u64,
    pub membership: Membership,
    pub rounds: RoundRegistry,
    pub view_changes: ViewChangeCollector,
    /// Set from the moment this node moves to a new view until the matching
    /// NEW-VIEW is installed.
    pub view_change_started: Option<Instant>,
    pub evidence: Vec<EquivocationEvidence>,
    pub executed: BTreeMap<u64, ConsensusResult>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
}

impl ReplicaState {
    pub fn new(config: EngineConfig, policy: QuorumPolicy) -> Self {
        Self {
            node_id: config.node_id.clone(),
            rounds: RoundRegistry::new(config.max_retained_rounds),
            config,
            policy,
            view: 0,
            sequence: 0,
            phase: ConsensusPhase::Idle,
            last_executed: 0,
            membership: Membership::new(),
            view_changes: ViewChangeCollector::default(),
            view_change_started: None,
            evidence: Vec::new(),
            executed: BTreeMap::new(),
            authenticator: None,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.membership.primary_for_view(self.view) == Some(&self.node_id)
    }

    /// Signs over the message digest. Without keys the digest itself stands
    /// in for the signature, unless signatures are required.
    pub fn sign(&self, message: PbftMessage) -> Result<PbftMessage> {
        let digest = message.digest();
        match &self.authenticator {
            Some(auth) => {
                let signature = auth.sign(digest.as_bytes()).map_err(PbftError::Auth)?;
                Ok(message.signed(hex::encode(signature)))
            }
            None if self.config.require_signatures => Err(PbftError::KeysRequired),
            None => Ok(message.signed(digest)),
        }
    }

    /// A sender with a registered key must sign with it. A sender without
    /// one is accepted only in permissive mode, carrying the digest placeholder.
    pub fn verify(&self, message: &PbftMessage) -> Result<()> {
        let digest = message.digest();
        let signature = message.signature.as_deref();

        let valid = match self.membership.public_key(&message.node_id) {
            Some(public_key) => {
                signature.map_or(false, |sig| verify_hex(digest.as_bytes(), sig, public_key))
            }
            None => !self.config.require_signatures && signature == Some(digest.as_str()),
        };

        if valid {
            Ok(())
        } else {
            Err(PbftError::InvalidSignature(message.node_id.clone()))
        }
    }

    /// Entry point for every message, local or remote.
    pub fn process(&mut self, message: PbftMessage) -> Result<Step> {
        if !self.membership.contains(&message.node_id) {
            return Err(PbftError::UnknownNode(message.node_id));
        }
        if let Err(e) = self.verify(&message) {
            self.membership.mark_faulty(&message.node_id);
            return Err(e);
        }
        self.membership.touch(&message.node_id);

        debug!(
            "[{}] <- {} from {} (view {}, seq {})",
            self.node_id, message.message_type, message.node_id, message.view, message.sequence_number
        );

        match message.message_type {
            MessageType::PrePrepare => self.on_pre_prepare(message),
            MessageType::Prepare | MessageType::Commit => self.on_vote(message),
            MessageType::ViewChange => self.on_view_change(message),
            MessageType::NewView => self.on_new_view(message),
        }
    }

    /// Primary side of a new round: assigns the next sequence number and
    /// builds the signed PRE-PREPARE. Returns `None` when the proposal already
    /// has a round in the current view.
    pub fn open_round(&mut self, proposal: &ConsensusProposal) -> Result<(u64, u64, Option<PbftMessage>)> {
        if let Some(round) = self.rounds.find_by_proposal(self.view, &proposal.proposal_id) {
            return Ok((round.view, round.sequence_number, None));
        }
        if !self.is_primary() {
            return Err(PbftError::NotPrimary(self.node_id.clone()));
        }

        let sequence = self
            .sequence
            .checked_add(1)
            .ok_or_else(|| PbftError::NotReady("sequence numbers exhausted".into()))?;
        let high = self.config.high_watermark(self.last_executed);
        if sequence > high {
            return Err(PbftError::OutOfWindow { sequence, low: self.last_executed, high });
        }
        let message = PbftMessage::pre_prepare(self.view, sequence, self.node_id.clone(), proposal)?;
        let message = self.sign(message)?;
        self.sequence = sequence;

        info!(
            "📣 [{}] PRE-PREPARE proposal {} at view {}, seq {}",
            self.node_id, proposal.proposal_id, self.view, sequence
        );
        Ok((self.view, sequence, Some(message)))
    }

    fn on_pre_prepare(&mut self, message: PbftMessage) -> Result<Step> {
        if self.view_change_started.is_some() {
            return Err(PbftError::NotReady(format!("view change to {} in progress", self.view)));
        }
        if message.view != self.view {
            return Err(PbftError::WrongView { expected: self.view, actual: message.view });
        }
        self.accept_pre_prepare(message)
    }

    /// Checks and records a PRE-PREPARE for its own view, then answers with a
    /// PREPARE. Also used for PRE-PREPAREs re-issued inside a NEW-VIEW.
    pub fn accept_pre_prepare(&mut self, message: PbftMessage) -> Result<Step> {
        let primary = self
            .membership
            .primary_for_view(message.view)
            .cloned()
            .ok_or_else(|| PbftError::NotReady("no registered nodes".into()))?;
        if message.node_id != primary {
            return Err(PbftError::NotPrimary(message.node_id));
        }
        if !self.in_window(&message)? {
            debug!("[{}] stale PRE-PREPARE for seq {}", self.node_id, message.sequence_number);
            return Ok(Step::default());
        }

        let proposal = message
            .proposal()
            .ok_or_else(|| PbftError::InvalidMessage("PRE-PREPARE without proposal".into()))?;
        let declared = message.proposal_digest().unwrap_or_default().to_string();
        let computed = proposal.digest();
        if declared != computed {
            return Err(PbftError::DigestMismatch { expected: computed, actual: declared });
        }
        if message.proposal_id() != Some(proposal.proposal_id.as_str()) {
            return Err(PbftError::InvalidMessage("PRE-PREPARE proposal id does not match its proposal".into()));
        }

        let (view, sequence) = (message.view, message.sequence_number);
        let proposal_id = proposal.proposal_id.clone();
        match self.rounds.record_pre_prepare(message, proposal) {
            Recorded::Accepted => {}
            Recorded::Duplicate => return Ok(Step::default()),
            Recorded::Conflict(evidence) => return Err(self.record_equivocation(*evidence)),
        }

        self.sequence = self.sequence.max(sequence);
        if view == self.view {
            self.phase = ConsensusPhase::PrePrepared;
        }
        info!(
            target: "consensus",
            "EVENT:PRE_PREPARED node={} view={} seq={} proposal={} digest={}",
            self.node_id, view, sequence, proposal_id, computed
        );

        let mut step = Step::default();
        let prepare = PbftMessage::vote(MessageType::Prepare, view, sequence, self.node_id.clone(), &proposal_id, &computed);
        step.outgoing.push(self.sign(prepare)?);
        step.merge(self.advance(view, sequence)?);
        Ok(step)
    }

    fn on_vote(&mut self, message: PbftMessage) -> Result<Step> {
        if message.view < self.view {
            debug!("[{}] dropping {} from old view {}", self.node_id, message.message_type, message.view);
            return Ok(Step::default());
        }
        let lead = self.view.saturating_add(self.config.max_view_lead);
        if message.view > lead {
            return Err(PbftError::WrongView { expected: self.view, actual: message.view });
        }
        if !self.in_window(&message)? {
            return Ok(Step::default());
        }
        let digest = message
            .proposal_digest()
            .ok_or_else(|| PbftError::InvalidMessage(format!("{} without digest", message.message_type)))?
            .to_string();

        let (view, sequence, kind, sender) = (
            message.view,
            message.sequence_number,
            message.message_type,
            message.node_id.clone(),
        );
        match self.rounds.record_vote(message) {
            Recorded::Accepted => {}
            Recorded::Duplicate => return Ok(Step::default()),
            Recorded::Conflict(evidence) => return Err(self.record_equivocation(*evidence)),
        }

        if let Some(expected) = self.rounds.get(view, sequence).and_then(|r| r.digest()) {
            if expected != digest {
                warn!(
                    "⚠️ [{}] {} from {} for seq {} carries digest {}, PRE-PREPARE has {}",
                    self.node_id, kind, sender, sequence, digest, expected
                );
                return Err(PbftError::DigestMismatch { expected: expected.to_string(), actual: digest });
            }
        }

        self.advance(view, sequence)
    }

    /// `Ok(false)` for a sequence this replica already executed. Anything
    /// past the high watermark is refused before a round is allocated for it.
    fn in_window(&self, message: &PbftMessage) -> Result<bool> {
        let sequence = message.sequence_number;
        if sequence <= self.last_executed {
            return Ok(false);
        }
        let high = self.config.high_watermark(self.last_executed);
        if sequence > high {
            return Err(PbftError::OutOfWindow { sequence, low: self.last_executed, high });
        }
        Ok(true)
    }

    /// Moves a round forward once it holds enough matching votes.
    fn advance(&mut self, view: u64, sequence: u64) -> Result<Step> {
        let mut step = Step::default();
        let quorum = self.policy.required_quorum;

        let Some(round) = self.rounds.get_mut(view, sequence) else {
            return Ok(step);
        };
        let (Some(proposal_id), Some(digest)) = (
            round.proposal_id().map(str::to_string),
            round.digest().map(str::to_string),
        ) else {
            return Ok(step);
        };

        let mut prepared_now = false;
        let mut committed_now = false;
        if round.phase == ConsensusPhase::PrePrepared && round.matching_prepares() >= quorum {
            round.phase = ConsensusPhase::Prepared;
            prepared_now = true;
        }
        if round.phase == ConsensusPhase::Prepared && round.matching_commits() >= quorum {
            round.phase = ConsensusPhase::Committed;
            committed_now = true;
        }
        let phase = round.phase;
        if view == self.view && phase > ConsensusPhase::PrePrepared {
            self.phase = phase;
        }

        if prepared_now {
            info!(target: "consensus", "EVENT:PREPARED node={} view={} seq={}", self.node_id, view, sequence);
            let commit = PbftMessage::vote(MessageType::Commit, view, sequence, self.node_id.clone(), &proposal_id, &digest);
            step.outgoing.push(self.sign(commit)?);
        }
        if committed_now {
            info!(target: "consensus", "EVENT:COMMITTED node={} view={} seq={}", self.node_id, view, sequence);
            step.executed = self.execute_ready();
        }
        Ok(step)
    }

    /// Executes committed rounds strictly in sequence order.
    fn execute_ready(&mut self) -> Vec<ConsensusResult> {
        let mut results = Vec::new();

        loop {
            let Some(next) = self.last_executed.checked_add(1) else { break };
            let Some(view) = self.rounds.committed_at(next) else { break };
            let Some(round) = self.rounds.get_mut(view, next) else { break };

            round.phase = ConsensusPhase::Executed;
            let participants = round.commit_voters();
            let elapsed = round
                .accepted_at
                .map(|t| t.elapsed().as_millis() as u64)
                .unwrap_or_default();
            let (proposal_id, decision) = round
                .proposal
                .clone()
                .map(|p| (p.proposal_id, p.data))
                .unwrap_or_default();

            self.last_executed = next;
            if view == self.view {
                self.phase = ConsensusPhase::Executed;
            }

            let result = ConsensusResult {
                proposal_id,
                decision,
                confidence: self.policy.confidence(participants.len()),
                participating_nodes: participants,
                view,
                sequence_number: next,
                phase: ConsensusPhase::Executed,
                execution_time_ms: elapsed,
                failure: None,
            };
            info!(
                target: "consensus",
                "EVENT:EXECUTED node={} view={} seq={} proposal={} participants={} confidence={:.3}",
                self.node_id, view, next, result.proposal_id, result.participating_nodes.len(), result.confidence
            );
            self.executed.insert(next, result.clone());
            results.push(result);
        }

        if !results.is_empty() {
            let removed = self.rounds.prune(self.last_executed);
            if removed > 0 {
                debug!("[{}] pruned {} finished rounds", self.node_id, removed);
            }
            while self.executed.len() > self.config.max_retained_rounds {
                self.executed.pop_first();
            }
        }
        results
    }

    pub fn record_equivocation(&mut self, evidence: EquivocationEvidence) -> PbftError {
        warn!(
            "🚨 [{}] Node {} equivocated on {} at view {}, seq {}",
            self.node_id, evidence.offender, evidence.message_type, evidence.view, evidence.sequence_number
        );
        info!(
            target: "consensus",
            "EVENT:EQUIVOCATION node={} offender={} view={} seq={}",
            self.node_id, evidence.offender, evidence.view, evidence.sequence_number
        );
        self.membership.mark_faulty(&evidence.offender);
        let offender = evidence.offender.clone();
        self.evidence.push(evidence);
        PbftError::Equivocation(offender)
    }

    pub fn executed_result(&self, proposal_id: &str) -> Option<&ConsensusResult> {
        self.executed.values().rev().find(|r| r.proposal_id == proposal_id)
    }

    pub fn round_phase(&self, view: u64, sequence: u64) -> ConsensusPhase {
        self.rounds
            .get(view, sequence)
            .map(|r| r.phase)
            .unwrap_or_default()
    }
}

/// Fail-closed: any decoding or verification problem is `false`.
pub(crate) fn verify_hex(message: &[u8], signature_hex: &str, public_key: &[u8]) -> bool {
    hex::decode(signature_hex)
        .ok()
        .and_then(|signature| verify_detached(message, &signature, public_key).ok())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_common::auth::ed25519::Ed25519Authenticator;
    use sentinel_common::env::node::PbftNode;
    use serde_json::json;

    fn state(id: &str, members: &[&str]) -> ReplicaState {
        let config = EngineConfig::new(id, members.len());
        let policy = QuorumPolicy::for_nodes(members.len());
        let mut st = ReplicaState::new(config, policy);
        for m in members {
            st.membership.register(PbftNode::new(*m));
        }
        st.membership.select_primary(0);
        st
    }

    fn placeholder(message: PbftMessage) -> PbftMessage {
        let digest = message.digest();
        message.signed(digest)
    }

    #[test]
    fn test_placeholder_signature_rules() {
        let st = state("n1", &["n1", "n2"]);
        let msg = PbftMessage::vote(MessageType::Prepare, 0, 1, NodeId::from("n2"), "p", "d");

        assert!(st.verify(&placeholder(msg.clone())).is_ok());
        assert!(st.verify(&msg).is_err());
        assert!(st.verify(&msg.clone().signed("beef".into())).is_err());
    }

    #[test]
    fn test_registered_key_is_enforced() {
        let mut st = state("n1", &["n1", "n2"]);
        let auth = Ed25519Authenticator::generate();
        st.membership.set_public_key(&NodeId::from("n2"), auth.public_key());

        let msg = PbftMessage::vote(MessageType::Prepare, 0, 1, NodeId::from("n2"), "p", "d");
        let good = hex::encode(auth.sign(msg.digest().as_bytes()).unwrap());
        assert!(st.verify(&msg.clone().signed(good)).is_ok());

        // digest placeholder is not enough once a key is known
        assert!(matches!(st.verify(&placeholder(msg)), Err(PbftError::InvalidSignature(_))));
    }

    #[test]
    fn test_require_signatures_without_keys() {
        let mut st = state("n1", &["n1"]);
        st.config.require_signatures = true;
        let msg = PbftMessage::vote(MessageType::Prepare, 0, 1, NodeId::from("n1"), "p", "d");
        assert!(matches!(st.sign(msg), Err(PbftError::KeysRequired)));
    }

    #[test]
    fn test_single_node_round_executes_locally() {
        let mut st = state("n1", &["n1"]);
        let proposal = ConsensusProposal::new("n1", json!({"action": "scale_db_pool"}));

        let (_, seq, pre_prepare) = st.open_round(&proposal).unwrap();
        let mut queue = vec![pre_prepare.unwrap()];
        let mut executed = Vec::new();
        while let Some(msg) = queue.pop() {
            let step = st.process(msg).unwrap();
            queue.extend(step.outgoing);
            executed.extend(step.executed);
        }

        assert_eq!(seq, 1);
        assert_eq!(st.last_executed, 1);
        assert_eq!(st.phase, ConsensusPhase::Executed);
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].participating_nodes, vec![NodeId::from("n1")]);
        assert!(st.executed_result(&proposal.proposal_id).is_some());
    }

    #[test]
    fn test_unknown_sender_is_rejected() {
        let mut st = state("n1", &["n1"]);
        let msg = PbftMessage::vote(MessageType::Prepare, 0, 1, NodeId::from("ghost"), "p", "d");
        let msg = placeholder(msg);
        assert!(matches!(st.process(msg), Err(PbftError::UnknownNode(_))));
    }

    #[test]
    fn test_pre_prepare_from_non_primary_is_rejected() {
        let mut st = state("n2", &["n1", "n2", "n3", "n4"]);
        let proposal = ConsensusProposal::new("n3", json!({"x": 1}));
        let msg = PbftMessage::pre_prepare(0, 1, NodeId::from("n3"), &proposal).unwrap();
        let msg = placeholder(msg);
        assert!(matches!(st.process(msg), Err(PbftError::NotPrimary(_))));
    }

    #[test]
    fn test_execution_waits_for_lower_sequences() {
        let mut st = state("n1", &["n1"]);
        let first = ConsensusProposal::new("n1", json!({"n": 1}));
        let second = ConsensusProposal::new("n1", json!({"n": 2}));

        // seq 2 commits before seq 1 has even been proposed
        let pp2 = placeholder(PbftMessage::pre_prepare(0, 2, NodeId::from("n1"), &second).unwrap());
        let mut queue = vec![pp2];
        while let Some(msg) = queue.pop() {
            queue.extend(st.process(msg).unwrap().outgoing);
        }
        assert_eq!(st.round_phase(0, 2), ConsensusPhase::Committed);
        assert_eq!(st.last_executed, 0);

        let pp1 = placeholder(PbftMessage::pre_prepare(0, 1, NodeId::from("n1"), &first).unwrap());
        let mut queue = vec![pp1];
        let mut executed = Vec::new();
        while let Some(msg) = queue.pop() {
            let step = st.process(msg).unwrap();
            queue.extend(step.outgoing);
            executed.extend(step.executed);
        }
        let order: Vec<u64> = executed.iter().map(|r| r.sequence_number).collect();
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn test_sequence_exhaustion_is_an_error() {
        let mut st = state("n1", &["n1"]);
        st.sequence = u64::MAX;
        st.last_executed = u64::MAX - 1;
        let proposal = ConsensusProposal::new("n1", json!({"x": 1}));
        assert!(matches!(st.open_round(&proposal), Err(PbftError::NotReady(_))));
        assert_eq!(st.sequence, u64::MAX);
    }

    #[test]
    fn test_execution_stops_at_last_sequence() {
        let mut st = state("n1", &["n1"]);
        st.last_executed = u64::MAX;
        assert!(st.execute_ready().is_empty());
        assert_eq!(st.last_executed, u64::MAX);
    }

    #[test]
    fn test_primary_stops_at_high_watermark() {
        let mut st = state("n1", &["n1", "n2", "n3", "n4"]);
        st.sequence = st.config.high_watermark(0);
        let proposal = ConsensusProposal::new("n1", json!({"x": 1}));
        assert!(matches!(st.open_round(&proposal), Err(PbftError::OutOfWindow { .. })));
    }

    #[test]
    fn test_pre_prepare_beyond_high_watermark_is_refused() {
        let mut st = state("n2", &["n1", "n2", "n3", "n4"]);
        let proposal = ConsensusProposal::new("n1", json!({"x": 1}));
        let far = st.config.high_watermark(0) + 1;
        let msg = placeholder(PbftMessage::pre_prepare(0, far, NodeId::from("n1"), &proposal).unwrap());

        assert!(matches!(st.process(msg), Err(PbftError::OutOfWindow { .. })));
        assert!(st.rounds.is_empty());
        assert_eq!(st.sequence, 0);
    }

    #[test]
    fn test_votes_outside_window_never_allocate_rounds() {
        let mut st = state("n1", &["n1", "n2", "n3", "n4"]);
        let high = st.config.high_watermark(0);

        for seq in high + 1..high + 100 {
            let msg = placeholder(PbftMessage::vote(MessageType::Prepare, 0, seq, NodeId::from("n2"), "p", "d"));
            assert!(matches!(st.process(msg), Err(PbftError::OutOfWindow { .. })));
        }
        let far_view = st.config.max_view_lead + 1;
        let msg = placeholder(PbftMessage::vote(MessageType::Commit, far_view, 1, NodeId::from("n3"), "p", "d"));
        assert!(matches!(st.process(msg), Err(PbftError::WrongView { .. })));
        assert!(st.rounds.is_empty());

        // the last slot inside the window is still tracked
        let msg = placeholder(PbftMessage::vote(MessageType::Prepare, 0, high, NodeId::from("n2"), "p", "d"));
        st.process(msg).unwrap();
        assert_eq!(st.rounds.len(), 1);
    }
}
