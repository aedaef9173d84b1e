use serde::{Deserialize, Serialize};

use crate::utils::{time::current_time_millis, NodeId};

/// A cluster member as seen by one engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PbftNode {
    pub node_id: NodeId,

    /// Raw Ed25519 public key, hex on the wire.
    #[serde(default, with = "opt_hex")]
    pub public_key: Option<Vec<u8>>,

    /// Written only by primary selection.
    #[serde(default)]
    pub is_primary: bool,

    /// Local suspicion, informational. Set on equivocation or a bad signature.
    #[serde(default)]
    pub is_faulty: bool,

    /// Unix millis of the last message or heartbeat seen from this node.
    pub last_heartbeat: u64,
}

impl PbftNode {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            public_key: None,
            is_primary: false,
            is_faulty: false,
            last_heartbeat: current_time_millis(),
        }
    }

    pub fn with_public_key(mut self, public_key: Vec<u8>) -> Self {
        self.public_key = Some(public_key);
        self
    }

    pub fn is_alive(&self, timeout_ms: u64, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_heartbeat) <= timeout_ms
    }

    pub fn touch(&mut self) {
        self.last_heartbeat = current_time_millis();
    }
}

mod opt_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_liveness_window() {
        let mut node = PbftNode::new("n1");
        node.last_heartbeat = 1_000;
        assert!(node.is_alive(5_000, 6_000));
        assert!(!node.is_alive(5_000, 6_001));
        // clock skew: heartbeat "in the future" still counts as alive
        assert!(node.is_alive(5_000, 500));
    }

    #[test]
    fn test_touch_refreshes_heartbeat() {
        let mut node = PbftNode::new("n1");
        node.last_heartbeat = 0;
        node.touch();
        assert!(node.last_heartbeat > 0);
    }

    #[test]
    fn test_public_key_serializes_as_hex() {
        let node = PbftNode::new("n1").with_public_key(vec![0xab, 0xcd]);
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["public_key"], "abcd");

        let back: PbftNode = serde_json::from_value(json).unwrap();
        assert_eq!(back.public_key, Some(vec![0xab, 0xcd]));
    }

    #[test]
    fn test_missing_public_key_defaults_to_none() {
        let back: PbftNode = serde_json::from_str(r#"{"node_id":"n2","last_heartbeat":5}"#).unwrap();
        assert_eq!(back.public_key, None);
        assert!(!back.is_primary);
    }
}
