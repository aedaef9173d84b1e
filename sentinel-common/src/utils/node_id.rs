use serde::{Deserialize, Serialize};

/// Unique identifier for a replica in the consensus group.
///
/// `NodeId` is a lightweight wrapper around `String`, designed to:
/// - Ensure type safety across APIs
/// - Enable strong `HashMap`/`BTreeMap` keys (ordering is used by primary selection)
/// - Provide readable formatting and conversions
#[derive(Default, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    /// Example:
    /// ```rust
    /// use sentinel_common::utils::NodeId;
    /// let id: NodeId = "node-A".into();
    /// assert_eq!(id.as_str(), "node-A");
    /// ```
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId(s)
    }
}
