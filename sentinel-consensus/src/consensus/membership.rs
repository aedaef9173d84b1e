use std::collections::BTreeMap;

use sentinel_common::{env::node::PbftNode, NodeId};
use tracing::info;

/// Registered nodes, kept sorted by id so primary selection is a lookup.
#[derive(Debug, Clone, Default)]
pub struct Membership {
    nodes: BTreeMap<NodeId, PbftNode>,
    primary: Option<NodeId>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites `node`. Returns `true` if the id was new.
    ///
    /// `is_primary` on the incoming value is ignored; it is recomputed by
    /// [`Membership::select_primary`].
    pub fn register(&mut self, mut node: PbftNode) -> bool {
        node.is_primary = false;
        self.nodes.insert(node.node_id.clone(), node).is_none()
    }

    /// `sorted(ids)[view mod len]`, or `None` with no members.
    pub fn primary_for_view(&self, view: u64) -> Option<&NodeId> {
        if self.nodes.is_empty() {
            return None;
        }
        let index = (view % self.nodes.len() as u64) as usize;
        self.nodes.keys().nth(index)
    }

    /// Recomputes the primary for `view` and rewrites every `is_primary` flag.
    pub fn select_primary(&mut self, view: u64) -> Option<NodeId> {
        let primary = self.primary_for_view(view).cloned()?;
        for (id, node) in self.nodes.iter_mut() {
            node.is_primary = *id == primary;
        }
        if self.primary.as_ref() != Some(&primary) {
            info!("👑 Primary for view {} is {}", view, primary);
        }
        self.primary = Some(primary.clone());
        Some(primary)
    }

    pub fn primary(&self) -> Option<&NodeId> {
        self.primary.as_ref()
    }

    pub fn get(&self, id: &NodeId) -> Option<&PbftNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn public_key(&self, id: &NodeId) -> Option<&[u8]> {
        self.nodes.get(id).and_then(|n| n.public_key.as_deref())
    }

    pub fn set_public_key(&mut self, id: &NodeId, public_key: Vec<u8>) -> bool {
        match self.nodes.get_mut(id) {
            Some(node) => {
                node.public_key = Some(public_key);
                true
            }
            None => false,
        }
    }

    pub fn mark_faulty(&mut self, id: &NodeId) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.is_faulty = true;
        }
    }

    pub fn touch(&mut self, id: &NodeId) -> bool {
        match self.nodes.get_mut(id) {
            Some(node) => {
                node.touch();
                true
            }
            None => false,
        }
    }

    pub fn live_count(&self, timeout_ms: u64, now_ms: u64) -> usize {
        self.nodes.values().filter(|n| n.is_alive(timeout_ms, now_ms)).count()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &PbftNode> {
        self.nodes.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn membership(ids: &[&str]) -> Membership {
        let mut m = Membership::new();
        for id in ids {
            m.register(PbftNode::new(*id));
        }
        m
    }

    #[test]
    fn test_primary_is_independent_of_registration_order() {
        let a = membership(&["n3", "n1", "n4", "n2"]);
        let b = membership(&["n1", "n2", "n3", "n4"]);
        for view in 0..8 {
            assert_eq!(a.primary_for_view(view), b.primary_for_view(view));
        }
        assert_eq!(a.primary_for_view(0), Some(&NodeId::from("n1")));
        assert_eq!(a.primary_for_view(5), Some(&NodeId::from("n2")));
    }

    #[test]
    fn test_select_primary_sets_exactly_one_flag() {
        let mut m = membership(&["a", "b", "c"]);
        m.select_primary(1);
        let flagged: Vec<_> = m.nodes().filter(|n| n.is_primary).map(|n| n.node_id.clone()).collect();
        assert_eq!(flagged, vec![NodeId::from("b")]);

        m.select_primary(2);
        assert!(m.get(&NodeId::from("c")).unwrap().is_primary);
        assert!(!m.get(&NodeId::from("b")).unwrap().is_primary);
    }

    #[test]
    fn test_empty_membership_has_no_primary() {
        let mut m = Membership::new();
        assert!(m.select_primary(0).is_none());
        assert!(m.primary().is_none());
    }

    #[test]
    fn test_register_overwrites_and_ignores_primary_flag() {
        let mut m = membership(&["a"]);
        let mut replacement = PbftNode::new("a").with_public_key(vec![1, 2]);
        replacement.is_primary = true;

        assert!(!m.register(replacement));
        assert_eq!(m.len(), 1);
        assert_eq!(m.public_key(&NodeId::from("a")), Some(&[1u8, 2][..]));
        assert!(!m.get(&NodeId::from("a")).unwrap().is_primary);
    }

    #[test]
    fn test_live_count() {
        let mut m = membership(&["a", "b"]);
        let now = sentinel_common::utils::time::current_time_millis();
        assert_eq!(m.live_count(5_000, now), 2);

        m.mark_faulty(&NodeId::from("b"));
        assert!(m.get(&NodeId::from("b")).unwrap().is_faulty);
        assert_eq!(m.live_count(5_000, now + 60_000), 0);
        assert!(m.touch(&NodeId::from("a")));
        assert!(!m.touch(&NodeId::from("zz")));
    }
}
