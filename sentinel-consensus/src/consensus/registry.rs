use std::collections::BTreeMap;
use std::time::Instant;

use sentinel_common::{
    env::consensus::{evidence::EquivocationEvidence, types::ConsensusPhase},
    env::message::{MessageType, PbftMessage},
    env::proposal::ConsensusProposal,
    NodeId,
};

use super::view_change::PreparedCertificate;

/// Outcome of recording a message into a round.
#[derive(Debug)]
pub enum Recorded {
    Accepted,
    /// Same sender, same slot, same digest. Nothing changed.
    Duplicate,
    /// Same sender, same slot, different digest. The first message is kept.
    Conflict(Box<EquivocationEvidence>),
}

/// Everything one node knows about a single `(view, sequence)` slot.
#[derive(Debug, Clone)]
pub struct Round {
    pub view: u64,
    pub sequence_number: u64,
    pub pre_prepare: Option<PbftMessage>,
    pub proposal: Option<ConsensusProposal>,
    pub phase: ConsensusPhase,
    /// When the PRE-PREPARE was accepted; drives the liveness monitor.
    pub accepted_at: Option<Instant>,
    prepares: BTreeMap<NodeId, PbftMessage>,
    commits: BTreeMap<NodeId, PbftMessage>,
}

impl Round {
    fn new(view: u64, sequence_number: u64) -> Self {
        Self {
            view,
            sequence_number,
            pre_prepare: None,
            proposal: None,
            phase: ConsensusPhase::Idle,
            accepted_at: None,
            prepares: BTreeMap::new(),
            commits: BTreeMap::new(),
        }
    }

    /// Proposal digest fixed by the accepted PRE-PREPARE.
    pub fn digest(&self) -> Option<&str> {
        self.pre_prepare.as_ref().and_then(|m| m.proposal_digest())
    }

    pub fn proposal_id(&self) -> Option<&str> {
        self.pre_prepare.as_ref().and_then(|m| m.proposal_id())
    }

    /// Votes are only ever counted against the PRE-PREPARE digest; votes that
    /// arrived early with another digest stay in the set but never count.
    fn matching<'a>(&'a self, votes: &'a BTreeMap<NodeId, PbftMessage>) -> impl Iterator<Item = &'a PbftMessage> + 'a {
        let digest = self.digest();
        votes
            .values()
            .filter(move |m| digest.is_some() && m.proposal_digest() == digest)
    }

    pub fn matching_prepares(&self) -> usize {
        self.matching(&self.prepares).count()
    }

    pub fn matching_commits(&self) -> usize {
        self.matching(&self.commits).count()
    }

    /// Senders of matching COMMITs, sorted.
    pub fn commit_voters(&self) -> Vec<NodeId> {
        self.matching(&self.commits).map(|m| m.node_id.clone()).collect()
    }

    pub fn is_pending(&self) -> bool {
        self.phase >= ConsensusPhase::PrePrepared && self.phase < ConsensusPhase::Executed
    }

    /// Messages this node contributed to the round, for retransmission.
    pub fn own_messages(&self, node_id: &NodeId) -> Vec<PbftMessage> {
        let mut out = Vec::new();
        if let Some(pp) = self.pre_prepare.as_ref().filter(|m| &m.node_id == node_id) {
            out.push(pp.clone());
        }
        out.extend(self.prepares.get(node_id).cloned());
        out.extend(self.commits.get(node_id).cloned());
        out
    }

    /// PRE-PREPARE plus the matching PREPAREs, once the round is prepared.
    pub fn certificate(&self) -> Option<PreparedCertificate> {
        if self.phase < ConsensusPhase::Prepared {
            return None;
        }
        let pre_prepare = self.pre_prepare.clone()?;
        let digest = self.digest()?.to_string();
        Some(PreparedCertificate {
            view: self.view,
            sequence_number: self.sequence_number,
            digest,
            pre_prepare,
            prepares: self.matching(&self.prepares).cloned().collect(),
        })
    }
}

/// Rounds keyed by `(view, sequence)`.
#[derive(Debug, Clone)]
pub struct RoundRegistry {
    rounds: BTreeMap<(u64, u64), Round>,
    max_retained: usize,
}

impl RoundRegistry {
    pub fn new(max_retained: usize) -> Self {
        Self {
            rounds: BTreeMap::new(),
            max_retained,
        }
    }

    pub fn get(&self, view: u64, sequence_number: u64) -> Option<&Round> {
        self.rounds.get(&(view, sequence_number))
    }

    pub fn get_mut(&mut self, view: u64, sequence_number: u64) -> Option<&mut Round> {
        self.rounds.get_mut(&(view, sequence_number))
    }

    fn entry(&mut self, view: u64, sequence_number: u64) -> &mut Round {
        self.rounds
            .entry((view, sequence_number))
            .or_insert_with(|| Round::new(view, sequence_number))
    }

    /// Stores an accepted PRE-PREPARE. The caller has already checked the
    /// sender is the primary and the proposal matches the digest.
    pub fn record_pre_prepare(&mut self, message: PbftMessage, proposal: ConsensusProposal) -> Recorded {
        let round = self.entry(message.view, message.sequence_number);

        if let Some(existing) = &round.pre_prepare {
            if existing.proposal_digest() == message.proposal_digest() {
                return Recorded::Duplicate;
            }
            return match EquivocationEvidence::from_conflict(existing.clone(), message) {
                Some(evidence) => Recorded::Conflict(Box::new(evidence)),
                None => Recorded::Duplicate,
            };
        }

        round.pre_prepare = Some(message);
        round.proposal = Some(proposal);
        round.phase = round.phase.max(ConsensusPhase::PrePrepared);
        round.accepted_at = Some(Instant::now());
        Recorded::Accepted
    }

    /// Stores a PREPARE or COMMIT keyed by sender.
    pub fn record_vote(&mut self, message: PbftMessage) -> Recorded {
        let round = self.entry(message.view, message.sequence_number);
        let votes = match message.message_type {
            MessageType::Prepare => &mut round.prepares,
            MessageType::Commit => &mut round.commits,
            _ => return Recorded::Duplicate,
        };

        if let Some(existing) = votes.get(&message.node_id) {
            if existing.proposal_digest() == message.proposal_digest() {
                return Recorded::Duplicate;
            }
            return match EquivocationEvidence::from_conflict(existing.clone(), message) {
                Some(evidence) => Recorded::Conflict(Box::new(evidence)),
                None => Recorded::Duplicate,
            };
        }

        votes.insert(message.node_id.clone(), message);
        Recorded::Accepted
    }

    /// Round in `view` that carries `proposal_id`.
    pub fn find_by_proposal(&self, view: u64, proposal_id: &str) -> Option<&Round> {
        self.rounds
            .range((view, 0)..=(view, u64::MAX))
            .map(|(_, r)| r)
            .find(|r| r.proposal_id() == Some(proposal_id))
    }

    /// A committed, not yet executed round at `sequence_number`, from the
    /// highest view that has one.
    pub fn committed_at(&self, sequence_number: u64) -> Option<u64> {
        self.rounds
            .values()
            .filter(|r| r.sequence_number == sequence_number && r.phase == ConsensusPhase::Committed)
            .map(|r| r.view)
            .max()
    }

    /// Earliest acceptance time among unexecuted rounds of `view`.
    pub fn oldest_pending(&self, view: u64) -> Option<Instant> {
        self.rounds
            .range((view, 0)..=(view, u64::MAX))
            .map(|(_, r)| r)
            .filter(|r| r.is_pending())
            .filter_map(|r| r.accepted_at)
            .min()
    }

    /// For every sequence above `after`, the prepared certificate from the
    /// highest view in which that sequence prepared.
    pub fn prepared_certificates(&self, after: u64) -> Vec<PreparedCertificate> {
        let mut best: BTreeMap<u64, PreparedCertificate> = BTreeMap::new();
        for round in self.rounds.values().filter(|r| r.sequence_number > after) {
            if let Some(cert) = round.certificate() {
                let replace = best
                    .get(&cert.sequence_number)
                    .map_or(true, |current| cert.view > current.view);
                if replace {
                    best.insert(cert.sequence_number, cert);
                }
            }
        }
        best.into_values().collect()
    }

    /// Drops the oldest finished rounds beyond the retention limit. A round is
    /// finished once executed or once its sequence is at or below
    /// `last_executed`. Returns how many were removed.
    pub fn prune(&mut self, last_executed: u64) -> usize {
        let mut finished: Vec<(u64, u64)> = self
            .rounds
            .iter()
            .filter(|(_, r)| r.phase == ConsensusPhase::Executed || r.sequence_number <= last_executed)
            .map(|(k, _)| *k)
            .collect();

        if finished.len() <= self.max_retained {
            return 0;
        }
        finished.sort_by_key(|(view, seq)| (*seq, *view));
        let excess = finished.len() - self.max_retained;
        for key in finished.into_iter().take(excess) {
            self.rounds.remove(&key);
        }
        excess
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }
}
