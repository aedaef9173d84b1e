use std::collections::BTreeMap;
use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::hash::digest_value;
use crate::env::proposal::ConsensusProposal;
use crate::utils::{time::current_time_millis, NodeId};

/// Ordered payload map; ordering keeps the canonical form stable.
pub type Payload = BTreeMap<String, Value>;

/// Well-known payload keys.
pub mod keys {
    pub const PROPOSAL_ID: &str = "proposal_id";
    pub const DIGEST: &str = "digest";
    pub const PROPOSAL: &str = "proposal";
    pub const LAST_EXECUTED: &str = "last_executed";
    pub const PREPARED: &str = "prepared";
    pub const VIEW_CHANGES: &str = "view_changes";
    pub const PRE_PREPARES: &str = "pre_prepares";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    PrePrepare,
    Prepare,
    Commit,
    ViewChange,
    NewView,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::PrePrepare => "PRE_PREPARE",
            MessageType::Prepare => "PREPARE",
            MessageType::Commit => "COMMIT",
            MessageType::ViewChange => "VIEW_CHANGE",
            MessageType::NewView => "NEW_VIEW",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One protocol message.
///
/// Signed fields are only set through constructors and [`PbftMessage::signed`];
/// there is no mutation API once a signature is attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PbftMessage {
    pub message_type: MessageType,
    pub view: u64,
    pub sequence_number: u64,
    pub node_id: NodeId,
    #[serde(default)]
    pub payload: Payload,
    /// Unix millis. Not covered by the digest.
    pub timestamp: u64,
    /// Hex signature over the digest. Not covered by the digest.
    #[serde(default)]
    pub signature: Option<String>,
    /// Not covered by the digest.
    pub message_id: String,
}

impl PbftMessage {
    pub fn new(
        message_type: MessageType,
        view: u64,
        sequence_number: u64,
        node_id: NodeId,
        payload: Payload,
    ) -> Self {
        Self {
            message_type,
            view,
            sequence_number,
            node_id,
            payload,
            timestamp: current_time_millis(),
            signature: None,
            message_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// PRE-PREPARE carrying the proposal id, its digest and the full proposal.
    pub fn pre_prepare(
        view: u64,
        sequence_number: u64,
        node_id: NodeId,
        proposal: &ConsensusProposal,
    ) -> serde_json::Result<Self> {
        let mut payload = Payload::new();
        payload.insert(keys::PROPOSAL_ID.into(), Value::String(proposal.proposal_id.clone()));
        payload.insert(keys::DIGEST.into(), Value::String(proposal.digest()));
        payload.insert(keys::PROPOSAL.into(), serde_json::to_value(proposal)?);

        Ok(Self::new(MessageType::PrePrepare, view, sequence_number, node_id, payload))
    }

    /// PREPARE or COMMIT echoing a PRE-PREPARE's proposal id and digest.
    pub fn vote(
        message_type: MessageType,
        view: u64,
        sequence_number: u64,
        node_id: NodeId,
        proposal_id: &str,
        digest: &str,
    ) -> Self {
        let mut payload = Payload::new();
        payload.insert(keys::PROPOSAL_ID.into(), Value::String(proposal_id.to_string()));
        payload.insert(keys::DIGEST.into(), Value::String(digest.to_string()));

        Self::new(message_type, view, sequence_number, node_id, payload)
    }

    /// Hex SHA-256 over the canonical JSON of
    /// `{message_type, view, sequence_number, node_id, payload}`.
    pub fn digest(&self) -> String {
        let mut view = serde_json::Map::new();
        view.insert("message_type".into(), Value::String(self.message_type.as_str().into()));
        view.insert("view".into(), Value::from(self.view));
        view.insert("sequence_number".into(), Value::from(self.sequence_number));
        view.insert("node_id".into(), Value::String(self.node_id.as_str().into()));
        view.insert(
            "payload".into(),
            Value::Object(self.payload.clone().into_iter().collect()),
        );
        digest_value(&Value::Object(view))
    }

    /// Bytes a signature is computed over.
    pub fn signing_bytes(&self) -> Vec<u8> {
        self.digest().into_bytes()
    }

    pub fn signed(mut self, signature: String) -> Self {
        self.signature = Some(signature);
        self
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    pub fn proposal_id(&self) -> Option<&str> {
        self.payload.get(keys::PROPOSAL_ID).and_then(Value::as_str)
    }

    /// Digest of the proposal this message is about (not the message digest).
    pub fn proposal_digest(&self) -> Option<&str> {
        self.payload.get(keys::DIGEST).and_then(Value::as_str)
    }

    /// Embedded proposal; only PRE-PREPAREs carry one.
    pub fn proposal(&self) -> Option<ConsensusProposal> {
        self.payload_field(keys::PROPOSAL)
    }

    pub fn payload_field<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.payload
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// `(type, view, sequence)`; two messages from one sender with the same
    /// slot must agree on the proposal digest.
    pub fn slot(&self) -> (MessageType, u64, u64) {
        (self.message_type, self.view, self.sequence_number)
    }
}
