//! VIEW-CHANGE / NEW-VIEW.
//!
//! A node leaving view `v` broadcasts VIEW-CHANGE for `v+1` carrying its last
//! executed sequence and a prepared certificate for every sequence above it.
//! `f+1` VIEW-CHANGEs for a higher view pull a node along. The primary of the
//! new view waits for `2f+1`, then re-issues PRE-PREPAREs for every certified
//! sequence above the base and broadcasts NEW-VIEW. Replicas recompute that
//! set from the enclosed VIEW-CHANGEs before installing.
//!
//! The base is the `(f+1)`-th highest executed sequence claimed in the set,
//! so at least one honest node has executed up to it and a single faulty
//! claim cannot move it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sentinel_common::{
    env::consensus::types::ConsensusPhase,
    env::message::{keys, MessageType, Payload, PbftMessage},
    NodeId, PbftError, Result,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::engine::PbftEngine;
use super::state::{ReplicaState, Step};

/// A PRE-PREPARE plus `2f+1` matching PREPAREs for one `(view, sequence)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedCertificate {
    pub view: u64,
    pub sequence_number: u64,
    pub digest: String,
    pub pre_prepare: PbftMessage,
    pub prepares: Vec<PbftMessage>,
}

/// VIEW-CHANGE messages per target view, one per sender.
#[derive(Debug, Clone, Default)]
pub struct ViewChangeCollector {
    by_view: BTreeMap<u64, BTreeMap<NodeId, PbftMessage>>,
    new_view_sent: BTreeSet<u64>,
}

impl ViewChangeCollector {
    /// Returns `false` if the sender already has a VIEW-CHANGE for that view.
    pub fn add(&mut self, message: PbftMessage) -> bool {
        let senders = self.by_view.entry(message.view).or_default();
        if senders.contains_key(&message.node_id) {
            return false;
        }
        senders.insert(message.node_id.clone(), message);
        true
    }

    pub fn count(&self, view: u64) -> usize {
        self.by_view.get(&view).map_or(0, |s| s.len())
    }

    pub fn messages(&self, view: u64) -> Vec<PbftMessage> {
        self.by_view
            .get(&view)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns `true` the first time it is called for `view`.
    pub fn mark_new_view_sent(&mut self, view: u64) -> bool {
        self.new_view_sent.insert(view)
    }

    pub fn prune_below(&mut self, view: u64) {
        self.by_view = self.by_view.split_off(&view);
        self.new_view_sent = self.new_view_sent.split_off(&view);
    }
}

/// The executed sequence vouched for by at least `vouchers` senders, and for
/// every sequence above it the certificate from the highest view.
fn reissue_plan(view_changes: &[PbftMessage], vouchers: usize) -> (u64, Vec<PreparedCertificate>) {
    let mut claimed: Vec<u64> = view_changes
        .iter()
        .filter_map(|m| m.payload_field::<u64>(keys::LAST_EXECUTED))
        .collect();
    claimed.sort_unstable_by(|a, b| b.cmp(a));
    let base = claimed.get(vouchers.saturating_sub(1)).copied().unwrap_or(0);

    let mut best: BTreeMap<u64, PreparedCertificate> = BTreeMap::new();
    for message in view_changes {
        let certificates: Vec<PreparedCertificate> = message.payload_field(keys::PREPARED).unwrap_or_default();
        for cert in certificates.into_iter().filter(|c| c.sequence_number > base) {
            let replace = best
                .get(&cert.sequence_number)
                .map_or(true, |current| cert.view > current.view);
            if replace {
                best.insert(cert.sequence_number, cert);
            }
        }
    }
    (base, best.into_values().collect())
}

impl ReplicaState {
    /// Moves to `target`, stops accepting PRE-PREPAREs until NEW-VIEW, and
    /// returns this node's signed VIEW-CHANGE. Historic rounds are kept.
    pub(crate) fn begin_view_change(&mut self, target: u64) -> Result<PbftMessage> {
        let previous = self.view;
        self.view = target;
        self.phase = ConsensusPhase::Idle;
        self.view_change_started = Some(Instant::now());
        self.membership.select_primary(target);
        self.view_changes.prune_below(target);

        let certificates = self.rounds.prepared_certificates(self.last_executed);
        warn!(
            "🔄 [{}] View change {} -> {} ({} prepared certificates)",
            self.node_id, previous, target, certificates.len()
        );
        info!(
            target: "consensus",
            "EVENT:VIEW_CHANGE node={} from={} to={} last_executed={}",
            self.node_id, previous, target, self.last_executed
        );

        let mut payload = Payload::new();
        payload.insert(keys::LAST_EXECUTED.into(), Value::from(self.last_executed));
        payload.insert(keys::PREPARED.into(), serde_json::to_value(&certificates)?);

        self.sign(PbftMessage::new(
            MessageType::ViewChange,
            target,
            self.last_executed,
            self.node_id.clone(),
            payload,
        ))
    }

    /// Nothing to do for an installed or older view.
    fn is_settled(&self, view: u64) -> bool {
        view < self.view || (view == self.view && self.view_change_started.is_none())
    }

    pub(crate) fn on_view_change(&mut self, message: PbftMessage) -> Result<Step> {
        let target = message.view;
        if self.is_settled(target) {
            debug!("[{}] ignoring VIEW-CHANGE for settled view {}", self.node_id, target);
            return Ok(Step::default());
        }
        if target > self.view.saturating_add(self.config.max_view_lead) {
            return Err(PbftError::WrongView { expected: self.view, actual: target });
        }
        self.check_view_change(&message)?;
        if !self.view_changes.add(message) {
            return Ok(Step::default());
        }

        let mut step = Step::default();
        let count = self.view_changes.count(target);
        if target > self.view && count >= self.policy.join_threshold() {
            info!("[{}] {} nodes want view {}, joining", self.node_id, count, target);
            step.outgoing.push(self.begin_view_change(target)?);
        }
        if let Some(new_view) = self.maybe_new_view(target)? {
            step.outgoing.push(new_view);
        }
        Ok(step)
    }

    /// Builds NEW-VIEW once this node is the primary of `target` and holds
    /// `2f+1` VIEW-CHANGEs for it. At most once per view.
    fn maybe_new_view(&mut self, target: u64) -> Result<Option<PbftMessage>> {
        if target != self.view || self.view_change_started.is_none() {
            return Ok(None);
        }
        if self.membership.primary_for_view(target) != Some(&self.node_id) {
            return Ok(None);
        }
        if !self.policy.has_quorum(self.view_changes.count(target)) {
            return Ok(None);
        }
        if !self.view_changes.mark_new_view_sent(target) {
            return Ok(None);
        }

        let view_changes = self.view_changes.messages(target);
        let (base, certificates) = reissue_plan(&view_changes, self.policy.join_threshold());

        let mut pre_prepares = Vec::with_capacity(certificates.len());
        for cert in &certificates {
            let proposal = cert
                .pre_prepare
                .proposal()
                .ok_or_else(|| PbftError::InvalidMessage("certificate without proposal".into()))?;
            let message = PbftMessage::pre_prepare(target, cert.sequence_number, self.node_id.clone(), &proposal)?;
            pre_prepares.push(self.sign(message)?);
        }

        info!(
            "🆕 [{}] NEW-VIEW {} from {} VIEW-CHANGEs, base {}, re-issuing {}",
            self.node_id, target, view_changes.len(), base, pre_prepares.len()
        );

        let mut payload = Payload::new();
        payload.insert(keys::VIEW_CHANGES.into(), serde_json::to_value(&view_changes)?);
        payload.insert(keys::PRE_PREPARES.into(), serde_json::to_value(&pre_prepares)?);

        let message = PbftMessage::new(MessageType::NewView, target, base, self.node_id.clone(), payload);
        Ok(Some(self.sign(message)?))
    }

    pub(crate) fn on_new_view(&mut self, message: PbftMessage) -> Result<Step> {
        let target = message.view;
        if self.is_settled(target) {
            debug!("[{}] ignoring NEW-VIEW for settled view {}", self.node_id, target);
            return Ok(Step::default());
        }

        let primary = self
            .membership
            .primary_for_view(target)
            .cloned()
            .ok_or_else(|| PbftError::NotReady("no registered nodes".into()))?;
        if message.node_id != primary {
            return Err(PbftError::NotPrimary(message.node_id));
        }

        let view_changes: Vec<PbftMessage> = message
            .payload_field(keys::VIEW_CHANGES)
            .ok_or_else(|| PbftError::InvalidMessage("NEW-VIEW without VIEW-CHANGE set".into()))?;

        let mut senders = BTreeSet::new();
        for vc in &view_changes {
            if vc.message_type != MessageType::ViewChange || vc.view != target {
                return Err(PbftError::InvalidMessage("NEW-VIEW carries a foreign message".into()));
            }
            if !self.membership.contains(&vc.node_id) {
                return Err(PbftError::UnknownNode(vc.node_id.clone()));
            }
            self.verify(vc)?;
            self.check_view_change(vc)?;
            senders.insert(vc.node_id.clone());
        }
        if !self.policy.has_quorum(senders.len()) {
            return Err(PbftError::InvalidMessage(format!(
                "NEW-VIEW {} carries {} VIEW-CHANGEs, need {}",
                target,
                senders.len(),
                self.policy.required_quorum
            )));
        }

        let (base, certificates) = reissue_plan(&view_changes, self.policy.join_threshold());
        let pre_prepares: Vec<PbftMessage> = message.payload_field(keys::PRE_PREPARES).unwrap_or_default();

        let expected: BTreeMap<u64, &str> = certificates
            .iter()
            .map(|c| (c.sequence_number, c.digest.as_str()))
            .collect();
        let received: BTreeMap<u64, &str> = pre_prepares
            .iter()
            .map(|m| (m.sequence_number, m.proposal_digest().unwrap_or_default()))
            .collect();
        if received.len() != pre_prepares.len() || expected != received {
            return Err(PbftError::InvalidMessage(
                "re-issued PRE-PREPAREs do not match the VIEW-CHANGE certificates".into(),
            ));
        }
        for pp in &pre_prepares {
            if pp.message_type != MessageType::PrePrepare || pp.view != target || pp.node_id != primary {
                return Err(PbftError::InvalidMessage("malformed re-issued PRE-PREPARE".into()));
            }
            self.verify(pp)?;
        }

        let highest_reissued = certificates.iter().map(|c| c.sequence_number).max().unwrap_or(0);
        self.install_view(target, base, highest_reissued);

        let mut step = Step::default();
        for pp in pre_prepares {
            match self.accept_pre_prepare(pp) {
                Ok(s) => step.merge(s),
                Err(e) => warn!("[{}] re-issued PRE-PREPARE rejected: {}", self.node_id, e),
            }
        }
        Ok(step)
    }

    fn install_view(&mut self, target: u64, base: u64, highest_reissued: u64) {
        self.view = target;
        self.phase = ConsensusPhase::Idle;
        self.view_change_started = None;
        self.membership.select_primary(target);
        self.view_changes.prune_below(target);

        if base > self.last_executed {
            // no state transfer: the decisions in between are not applied here
            warn!(
                "⏭️ [{}] Skipping from executed seq {} to {} on NEW-VIEW {}",
                self.node_id, self.last_executed, base, target
            );
            self.last_executed = base;
        }
        // New sequences continue right after what the new view carries over,
        // so no unfilled gap blocks in-order execution.
        self.sequence = base.max(highest_reissued).max(self.last_executed);

        info!(
            target: "consensus",
            "EVENT:NEW_VIEW node={} view={} base={} primary={}",
            self.node_id,
            target,
            base,
            self.membership.primary().map(|p| p.as_str()).unwrap_or("-")
        );
    }

    /// Structural and certificate checks shared by VIEW-CHANGE handling and
    /// NEW-VIEW verification. Signatures of the VIEW-CHANGE itself are checked
    /// by the caller.
    ///
    /// Certificates must sit inside the sender's own window above the
    /// executed sequence it claims.
    fn check_view_change(&self, message: &PbftMessage) -> Result<()> {
        let last_executed = message
            .payload_field::<u64>(keys::LAST_EXECUTED)
            .ok_or_else(|| PbftError::InvalidMessage("VIEW-CHANGE without last executed sequence".into()))?;
        if message.sequence_number != last_executed {
            return Err(PbftError::InvalidMessage(format!(
                "VIEW-CHANGE header seq {} disagrees with last executed {}",
                message.sequence_number, last_executed
            )));
        }

        let certificates: Vec<PreparedCertificate> = match message.payload.get(keys::PREPARED) {
            Some(value) => serde_json::from_value(value.clone())?,
            None => Vec::new(),
        };
        let high = self.config.high_watermark(last_executed);
        if certificates.len() as u64 > self.config.sequence_window {
            return Err(PbftError::InvalidMessage(format!(
                "VIEW-CHANGE carries {} certificates",
                certificates.len()
            )));
        }
        for cert in &certificates {
            if cert.sequence_number <= last_executed || cert.sequence_number > high {
                return Err(PbftError::OutOfWindow { sequence: cert.sequence_number, low: last_executed, high });
            }
            self.verify_certificate(cert, message.view)?;
        }
        Ok(())
    }

    fn verify_certificate(&self, cert: &PreparedCertificate, target: u64) -> Result<()> {
        if cert.view >= target {
            return Err(PbftError::InvalidMessage("certificate from a view not below the target".into()));
        }

        let pp = &cert.pre_prepare;
        if pp.message_type != MessageType::PrePrepare
            || pp.view != cert.view
            || pp.sequence_number != cert.sequence_number
            || pp.proposal_digest() != Some(cert.digest.as_str())
        {
            return Err(PbftError::InvalidMessage("certificate PRE-PREPARE does not match its slot".into()));
        }
        let proposal = pp
            .proposal()
            .ok_or_else(|| PbftError::InvalidMessage("certificate PRE-PREPARE without proposal".into()))?;
        let computed = proposal.digest();
        if computed != cert.digest {
            return Err(PbftError::DigestMismatch { expected: computed, actual: cert.digest.clone() });
        }
        if self.membership.primary_for_view(cert.view) != Some(&pp.node_id) {
            return Err(PbftError::NotPrimary(pp.node_id.clone()));
        }
        self.verify(pp)?;

        let mut voters = BTreeSet::new();
        for prepare in &cert.prepares {
            if prepare.message_type != MessageType::Prepare
                || prepare.view != cert.view
                || prepare.sequence_number != cert.sequence_number
                || prepare.proposal_digest() != Some(cert.digest.as_str())
            {
                return Err(PbftError::InvalidMessage("certificate PREPARE does not match its slot".into()));
            }
            if !self.membership.contains(&prepare.node_id) {
                return Err(PbftError::UnknownNode(prepare.node_id.clone()));
            }
            self.verify(prepare)?;
            voters.insert(prepare.node_id.clone());
        }
        if !self.policy.has_quorum(voters.len()) {
            return Err(PbftError::InvalidMessage(format!(
                "certificate for seq {} has {} PREPAREs",
                cert.sequence_number,
                voters.len()
            )));
        }
        Ok(())
    }

    /// A view change is due when NEW-VIEW has not arrived in time, or an
    /// accepted round of the current view is still unexecuted.
    pub(crate) fn liveness_due(&self, timeout: Duration) -> bool {
        if let Some(started) = self.view_change_started {
            return started.elapsed() >= timeout;
        }
        self.rounds
            .oldest_pending(self.view)
            .map_or(false, |accepted| accepted.elapsed() >= timeout)
    }
}

impl PbftEngine {
    /// Moves to `view + 1`: resets the phase to IDLE, re-selects the primary,
    /// and broadcasts a signed VIEW-CHANGE. Returns the new view.
    pub async fn trigger_view_change(&self) -> u64 {
        let (target, message) = {
            let mut st = self.state.lock().await;
            let target = st.view + 1;
            (target, st.begin_view_change(target))
        };
        self.notify_progress();

        match message {
            Ok(message) => {
                self.publish(vec![message]).await;
            }
            Err(e) => warn!("⚠️ [{}] Could not announce view change to {}: {}", self.node_id(), target, e),
        }
        target
    }

    /// Escalation path for a stalled round: only moves on if nobody has moved
    /// past `stalled_view` yet.
    pub(crate) async fn escalate(&self, stalled_view: u64) -> Option<u64> {
        {
            let st = self.state.lock().await;
            if st.view > stalled_view || st.view_change_started.is_some() {
                return None;
            }
        }
        Some(self.trigger_view_change().await)
    }

    /// Periodically checks for stuck rounds or a NEW-VIEW that never came and
    /// triggers a view change. Stops once the engine is dropped.
    pub fn spawn_liveness_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let engine: Weak<Self> = Arc::downgrade(self);
        let timeout = self.config().view_change_timeout();
        let interval = (timeout / 4).max(Duration::from_millis(10));

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(engine) = engine.upgrade() else { break };

                let due = engine.state.lock().await.liveness_due(timeout);
                if due {
                    let view = engine.trigger_view_change().await;
                    warn!("⏱️ [{}] Liveness timeout, moved to view {}", engine.node_id(), view);
                }
            }
        })
    }
}
