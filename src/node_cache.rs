//! Map of discovery-key → last-known node identity (spec.md §2, §4.10).

use dashmap::DashMap;

use crate::model::NodeData;

#[derive(Default)]
pub struct NodeCache {
    nodes: DashMap<String, NodeData>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, node: NodeData) {
        self.nodes.insert(key.into(), node);
    }

    pub fn remove(&self, key: &str) -> Option<NodeData> {
        self.nodes.remove(key).map(|(_, v)| v)
    }

    pub fn get(&self, key: &str) -> Option<NodeData> {
        self.nodes.get(key).map(|e| e.value().clone())
    }

    pub fn all(&self) -> Vec<(String, NodeData)> {
        self.nodes
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn insert_get_remove_roundtrip() {
        let cache = NodeCache::new();
        let node = NodeData {
            ip: "10.0.0.1".into(),
            name: "A".into(),
            api_addr: "10.0.0.1:2375".into(),
            cpus: 4.0,
            memory: 8 << 30,
            labels: HashMap::new(),
        };
        cache.insert("10.0.0.1", node.clone());
        assert_eq!(cache.get("10.0.0.1").unwrap().name, "A");
        assert_eq!(cache.remove("10.0.0.1").unwrap().name, "A");
        assert!(cache.get("10.0.0.1").is_none());
    }
}
