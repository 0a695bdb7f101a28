//! Translates a stream of backend entry add/remove into pool and
//! node-cache mutations (spec.md §4.10).

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::model::{EngineState, NodeData, Server};
use crate::node_cache::NodeCache;
use crate::notify::{ClusterNotifier, WatchEvent};
use crate::pool::EnginesPool;

/// One raw discovery entry: an opaque key plus the bytes a `NodeData`
/// decodes from.
#[derive(Debug, Clone)]
pub struct DiscoveryEntry {
    pub key: String,
    pub data: Vec<u8>,
}

/// The discovery collaborator (spec.md §6): an external subscription
/// that invokes the handler for every change batch. Modeled as a
/// callback-registered subscription with an explicit stop handle (§9);
/// the handler must be reentrancy-safe since it mutates shared caches.
#[async_trait]
pub trait DiscoveryHandler: Send + Sync {
    async fn on_batch(
        &self,
        added: Vec<DiscoveryEntry>,
        removed: Vec<DiscoveryEntry>,
        err: Option<String>,
    );
}

/// Capability interface the adapter uses to ask whether a server key is
/// still declared by some other group, implemented by the Cluster
/// aggregator. Injected rather than a back-pointer (§9), same as `PoolSink`.
pub trait GroupMembership: Send + Sync {
    fn in_any_group(&self, key: &str) -> bool;
}

#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Watches for changes until `shutdown_rx` observes `true`, invoking
    /// `handler.on_batch` for every batch.
    async fn watch(
        self: Arc<Self>,
        shutdown_rx: tokio::sync::watch::Receiver<bool>,
        handler: Arc<dyn DiscoveryHandler>,
    );
}

fn decode_entry(entry: &DiscoveryEntry) -> Option<NodeData> {
    match serde_json::from_slice::<NodeData>(&entry.data) {
        Ok(mut node) => {
            node.name = node.name.to_uppercase();
            Some(node)
        }
        Err(e) => {
            warn!(key = %entry.key, error = %e, "failed to decode discovery entry, skipping");
            None
        }
    }
}

/// Adapts a `DiscoverySource`'s batches into `EnginesPool`/`NodeCache`
/// mutations and a single watch-event notification per batch.
pub struct DiscoveryAdapter {
    pool: Arc<EnginesPool>,
    node_cache: Arc<NodeCache>,
    notifier: Arc<dyn ClusterNotifier>,
    membership: Arc<dyn GroupMembership>,
}

impl DiscoveryAdapter {
    pub fn new(
        pool: Arc<EnginesPool>,
        node_cache: Arc<NodeCache>,
        notifier: Arc<dyn ClusterNotifier>,
        membership: Arc<dyn GroupMembership>,
    ) -> Self {
        Self {
            pool,
            node_cache,
            notifier,
            membership,
        }
    }
}

#[async_trait]
impl DiscoveryHandler for DiscoveryAdapter {
    async fn on_batch(
        &self,
        added: Vec<DiscoveryEntry>,
        removed: Vec<DiscoveryEntry>,
        err: Option<String>,
    ) {
        if let Some(e) = &err {
            warn!(error = %e, "discovery batch reported an error");
        }

        let mut events = Vec::with_capacity(added.len() + removed.len());

        // Removals are applied before additions within a batch (§5 Ordering).
        for entry in &removed {
            let Some(node) = decode_entry(entry) else {
                continue;
            };
            let key = Server::new(&node.ip, &node.name).key().to_string();
            self.node_cache.remove(&key);
            // A server declared by more than one group must not be
            // disconnected just because discovery stopped seeing it
            // independently of that other group (§4.11).
            if self.membership.in_any_group(&key) {
                debug!(key, "discovery: removal ignored, server still covered by a group");
                continue;
            }
            events.push(WatchEvent {
                key: key.clone(),
                state: EngineState::Disconnected,
            });
            self.pool.remove_engine(&node.ip, &node.name);
            debug!(key, "discovery: evicted engine");
        }

        for entry in &added {
            let Some(node) = decode_entry(entry) else {
                continue;
            };
            let key = Server::new(&node.ip, &node.name).key().to_string();
            self.node_cache.insert(key.clone(), node.clone());
            self.pool.add_engine(&node.ip, &node.name);
            events.push(WatchEvent {
                key,
                state: EngineState::Healthy,
            });
            debug!(name = %node.name, "discovery: admitted engine");
        }

        self.notifier
            .notify_group_engines_watch_event("discovery batch processed", &events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::FakeEngineClient;
    use crate::pool::EngineClientFactory;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    struct FakeFactory;
    impl EngineClientFactory for FakeFactory {
        fn build(&self, _ip: &str, _name: &str) -> Arc<dyn crate::engine::EngineClient> {
            Arc::new(FakeEngineClient::new())
        }
    }

    struct NoopSink;
    impl crate::pool::PoolSink for NoopSink {
        fn engine_connected(&self, _engine: Arc<crate::engine::Engine>) {}
        fn engine_disconnected(&self, _engine: Arc<crate::engine::Engine>) {}
    }

    struct NoGroups;
    impl GroupMembership for NoGroups {
        fn in_any_group(&self, _key: &str) -> bool {
            false
        }
    }

    struct RecordingNotifier {
        events: Mutex<Vec<WatchEvent>>,
    }
    impl ClusterNotifier for RecordingNotifier {
        fn notify_group_engines_watch_event(&self, _msg: &str, events: &[WatchEvent]) {
            self.events.lock().unwrap().extend_from_slice(events);
        }
        fn notify_group_meta_containers_event(&self, _msg: &str, _err: Option<&str>, _meta_id: &str) {}
    }

    fn entry(ip: &str, name: &str) -> DiscoveryEntry {
        let node = NodeData {
            ip: ip.to_string(),
            name: name.to_string(),
            api_addr: format!("{ip}:2375"),
            cpus: 2.0,
            memory: 4 << 30,
            labels: HashMap::new(),
        };
        DiscoveryEntry {
            key: ip.to_string(),
            data: serde_json::to_vec(&node).unwrap(),
        }
    }

    #[tokio::test]
    async fn added_entries_populate_pool_and_node_cache() {
        let node_cache = Arc::new(NodeCache::new());
        let pool = Arc::new(EnginesPool::new(
            node_cache.clone(),
            Arc::new(FakeFactory),
            Arc::new(NoopSink),
            0.0,
            Duration::from_millis(1),
            1,
        ));
        let notifier = Arc::new(RecordingNotifier {
            events: Mutex::new(vec![]),
        });
        let adapter = DiscoveryAdapter::new(
            pool.clone(),
            node_cache.clone(),
            notifier.clone(),
            Arc::new(NoGroups),
        );

        adapter
            .on_batch(vec![entry("10.0.0.1", "host-a")], vec![], None)
            .await;

        assert!(node_cache.get("10.0.0.1").is_some());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.list_engines().len(), 1);
        assert_eq!(notifier.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn decode_failure_does_not_block_other_entries() {
        let node_cache = Arc::new(NodeCache::new());
        let pool = Arc::new(EnginesPool::new(
            node_cache.clone(),
            Arc::new(FakeFactory),
            Arc::new(NoopSink),
            0.0,
            Duration::from_millis(1),
            1,
        ));
        let notifier = Arc::new(RecordingNotifier {
            events: Mutex::new(vec![]),
        });
        let adapter = DiscoveryAdapter::new(
            pool.clone(),
            node_cache.clone(),
            notifier.clone(),
            Arc::new(NoGroups),
        );

        let bad = DiscoveryEntry {
            key: "bad".into(),
            data: b"not json".to_vec(),
        };
        adapter
            .on_batch(vec![bad, entry("10.0.0.2", "host-b")], vec![], None)
            .await;

        assert!(node_cache.get("10.0.0.1").is_none());
        assert!(node_cache.get("10.0.0.2").is_some());
    }

    struct AlwaysCovered;
    impl GroupMembership for AlwaysCovered {
        fn in_any_group(&self, _key: &str) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn removal_of_a_server_still_covered_by_another_group_keeps_the_engine() {
        let node_cache = Arc::new(NodeCache::new());
        let pool = Arc::new(EnginesPool::new(
            node_cache.clone(),
            Arc::new(FakeFactory),
            Arc::new(NoopSink),
            0.0,
            Duration::from_millis(1),
            1,
        ));
        let notifier = Arc::new(RecordingNotifier {
            events: Mutex::new(vec![]),
        });
        let adapter = DiscoveryAdapter::new(
            pool.clone(),
            node_cache.clone(),
            notifier.clone(),
            Arc::new(AlwaysCovered),
        );

        adapter
            .on_batch(vec![entry("10.0.0.1", "host-a")], vec![], None)
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.list_engines().len(), 1);

        adapter
            .on_batch(vec![], vec![entry("10.0.0.1", "host-a")], None)
            .await;

        assert!(node_cache.get("10.0.0.1").is_none());
        assert_eq!(pool.list_engines().len(), 1, "engine kept alive via other group");
    }
}
