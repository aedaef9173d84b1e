use std::collections::BTreeSet;
use std::{fs, io, path::Path};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sentinel_common::{NodeId, PbftError, Result};
use sentinel_consensus::EngineConfig;

/// Layout of a simulated cluster: who is in it, who stays silent, and the
/// proposals to run through it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub node_ids: Vec<NodeId>,
    /// Registered everywhere but never started, to simulate crashed nodes.
    pub silent: Vec<NodeId>,
    /// Generate Ed25519 keys for every running node and require signatures.
    pub secure: bool,
    /// Template for every engine; `node_id` and `total_nodes` are filled per node.
    pub engine: EngineConfig,
    /// Times a client re-submits a proposal that did not commit.
    pub max_submit_attempts: u32,
    pub proposals: Vec<Value>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_ids: Self::node_names(4),
            silent: Vec::new(),
            secure: false,
            engine: EngineConfig::default(),
            max_submit_attempts: 3,
            proposals: vec![
                json!({"action": "scale_db_pool", "target": 20}),
                json!({"action": "rotate_keys"}),
                json!({"action": "drain_node", "node": "n4"}),
            ],
        }
    }
}

impl ClusterConfig {
    /// `n1`, `n2`, ... `nN`.
    pub fn node_names(count: usize) -> Vec<NodeId> {
        (1..=count).map(|i| NodeId(format!("n{}", i))).collect()
    }

    pub fn with_nodes(mut self, count: usize) -> Self {
        self.node_ids = Self::node_names(count);
        self
    }

    /// Engine settings for one member of this cluster.
    pub fn engine_config_for(&self, node_id: &NodeId) -> EngineConfig {
        EngineConfig {
            node_id: node_id.clone(),
            total_nodes: self.node_ids.len(),
            require_signatures: self.secure || self.engine.require_signatures,
            ..self.engine.clone()
        }
    }

    pub fn running(&self) -> impl Iterator<Item = &NodeId> {
        self.node_ids.iter().filter(move |id| !self.silent.contains(id))
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_ids.is_empty() {
            return Err(PbftError::Config("cluster needs at least one node".into()));
        }
        let unique: BTreeSet<&NodeId> = self.node_ids.iter().collect();
        if unique.len() != self.node_ids.len() {
            return Err(PbftError::Config("node ids must be unique".into()));
        }
        if let Some(stranger) = self.silent.iter().find(|id| !unique.contains(id)) {
            return Err(PbftError::Config(format!("silent node {} is not a member", stranger)));
        }
        if self.running().next().is_none() {
            return Err(PbftError::Config("every node is silent".into()));
        }
        if self.max_submit_attempts == 0 {
            return Err(PbftError::Config("max_submit_attempts must be at least 1".into()));
        }
        for id in &self.node_ids {
            self.engine_config_for(id).validate()?;
        }
        Ok(())
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        fs::write(path, json)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let data = fs::read_to_string(path)?;
        serde_json::from_str::<ClusterConfig>(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = ClusterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.node_ids.len(), 4);
        assert_eq!(config.running().count(), 4);
    }

    #[test]
    fn test_engine_config_is_filled_per_node() {
        let config = ClusterConfig {
            secure: true,
            ..ClusterConfig::default().with_nodes(7)
        };
        let engine = config.engine_config_for(&NodeId::from("n3"));
        assert_eq!(engine.node_id, NodeId::from("n3"));
        assert_eq!(engine.total_nodes, 7);
        assert!(engine.require_signatures);
        assert_eq!(engine.prepare_timeout_ms, config.engine.prepare_timeout_ms);
    }

    #[test]
    fn test_validate_rejects_bad_layouts() {
        let duplicate = ClusterConfig {
            node_ids: vec![NodeId::from("a"), NodeId::from("a")],
            ..ClusterConfig::default()
        };
        assert!(matches!(duplicate.validate(), Err(PbftError::Config(_))));

        let stranger = ClusterConfig {
            silent: vec![NodeId::from("zz")],
            ..ClusterConfig::default()
        };
        assert!(stranger.validate().is_err());

        let all_silent = ClusterConfig {
            silent: ClusterConfig::node_names(4),
            ..ClusterConfig::default()
        };
        assert!(all_silent.validate().is_err());

        let empty = ClusterConfig {
            node_ids: Vec::new(),
            ..ClusterConfig::default()
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.json");
        let config = ClusterConfig {
            silent: vec![NodeId::from("n1")],
            ..ClusterConfig::default().with_nodes(5)
        };

        config.save_to_file(&path).unwrap();
        let loaded = ClusterConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.json");
        fs::write(&path, r#"{"node_ids": ["a", "b", "c", "d"], "engine": {"prepare_timeout_ms": 500}}"#).unwrap();

        let loaded = ClusterConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.node_ids.len(), 4);
        assert_eq!(loaded.engine.prepare_timeout_ms, 500);
        assert_eq!(loaded.engine.commit_timeout_ms, EngineConfig::default().commit_timeout_ms);
        assert_eq!(loaded.max_submit_attempts, 3);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "not json").unwrap();

        let err = ClusterConfig::load_from_file(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
