//! Connection-attempt scheduler: admits (IP,name) tuples, drives engines
//! to Healthy/Disconnected, releases them (spec.md §4.3).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineClient};
use crate::model::{EngineState, NodeData, Server};
use crate::node_cache::NodeCache;

/// Builds an `EngineClient` for a freshly admitted (ip, name) tuple. An
/// external collaborator — production code wires this to whatever
/// transport actually dials the remote container daemon.
pub trait EngineClientFactory: Send + Sync {
    fn build(&self, ip: &str, name: &str) -> Arc<dyn EngineClient>;
}

/// Builds `EngineClient::LoggingEngineClient`. Used by the standalone
/// binary, which carries no real container-daemon transport.
pub struct LoggingEngineClientFactory;

impl EngineClientFactory for LoggingEngineClientFactory {
    fn build(&self, ip: &str, name: &str) -> Arc<dyn EngineClient> {
        Arc::new(crate::engine::LoggingEngineClient::new(ip, name))
    }
}

/// Capability interface the pool uses to report connection-state
/// transitions, implemented by the Cluster aggregator. Modeled as an
/// injected capability rather than a back-pointer to break the
/// pool→cluster→pool ownership cycle (§9).
pub trait PoolSink: Send + Sync {
    fn engine_connected(&self, engine: Arc<Engine>);
    fn engine_disconnected(&self, engine: Arc<Engine>);
}

struct PendingConnect {
    cancelled: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct EnginesPool {
    node_cache: Arc<NodeCache>,
    client_factory: Arc<dyn EngineClientFactory>,
    sink: Arc<dyn PoolSink>,
    overcommit: f64,
    reconnect_backoff: Duration,
    max_attempts: u32,
    engines: DashMap<String, Arc<Engine>>,
    pending: DashMap<String, PendingConnect>,
}

impl EnginesPool {
    pub fn new(
        node_cache: Arc<NodeCache>,
        client_factory: Arc<dyn EngineClientFactory>,
        sink: Arc<dyn PoolSink>,
        overcommit: f64,
        reconnect_backoff: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            node_cache,
            client_factory,
            sink,
            overcommit,
            reconnect_backoff,
            max_attempts,
            engines: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    fn key(ip: &str, name: &str) -> String {
        Server::new(ip, name).key().to_string()
    }

    /// Idempotent: if an engine already exists for (ip, name), nothing
    /// happens; otherwise a connect task is enqueued.
    pub fn add_engine(self: &Arc<Self>, ip: &str, name: &str) {
        let key = Self::key(ip, name);
        if self.engines.contains_key(&key) || self.pending.contains_key(&key) {
            debug!(key, "engine already known to pool, skipping add");
            return;
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let pool = self.clone();
        let ip = ip.to_string();
        let name = name.to_string();
        let key_for_task = key.clone();
        let cancel_flag = cancelled.clone();

        let handle = tokio::spawn(async move {
            pool.connect_loop(&key_for_task, &ip, &name, cancel_flag).await;
        });

        self.pending.insert(key, PendingConnect { cancelled, handle });
    }

    async fn connect_loop(
        self: Arc<Self>,
        key: &str,
        ip: &str,
        name: &str,
        cancelled: Arc<AtomicBool>,
    ) {
        let mut attempt: u32 = 0;
        loop {
            if cancelled.load(Ordering::Acquire) {
                debug!(key, "connect task cancelled before establishing a connection");
                return;
            }

            let node = self.node_cache.get(key).unwrap_or_else(|| NodeData {
                ip: ip.to_string(),
                name: name.to_string(),
                api_addr: String::new(),
                cpus: 0.0,
                memory: 0,
                labels: HashMap::new(),
            });

            let client = self.client_factory.build(ip, name);
            let engine = Arc::new(Engine::new(&node, self.overcommit, client));

            match engine.refresh_containers().await {
                Ok(()) => {
                    engine.set_state(EngineState::Healthy);
                    self.engines.insert(key.to_string(), engine.clone());
                    self.pending.remove(key);
                    info!(key, engine = %engine.id, "engine connected and healthy");
                    self.sink.engine_connected(engine);
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    warn!(key, attempt, error = %e, "engine connect attempt failed");
                    if self.max_attempts > 0 && attempt >= self.max_attempts {
                        warn!(key, "giving up on engine after {} attempts", attempt);
                        self.pending.remove(key);
                        return;
                    }
                    let delay = self
                        .reconnect_backoff
                        .saturating_mul(1u32 << attempt.min(5))
                        .min(Duration::from_secs(60));
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Cancels any pending connect and transitions the engine to
    /// Disconnected.
    pub fn remove_engine(&self, ip: &str, name: &str) {
        let key = Self::key(ip, name);
        if let Some((_, pending)) = self.pending.remove(&key) {
            pending.cancelled.store(true, Ordering::Release);
            pending.handle.abort();
        }
        if let Some((_, engine)) = self.engines.remove(&key) {
            engine.set_state(EngineState::Disconnected);
            info!(key, engine = %engine.id, "engine disconnected and removed from pool");
            self.sink.engine_disconnected(engine);
        }
    }

    pub fn get_engine(&self, ip: &str, name: &str) -> Option<Arc<Engine>> {
        self.engines.get(&Self::key(ip, name)).map(|e| e.clone())
    }

    pub fn list_engines(&self) -> Vec<Arc<Engine>> {
        self.engines.iter().map(|e| e.value().clone()).collect()
    }

    /// Cancels all pending connect tasks.
    pub fn release(&self) {
        for entry in self.pending.iter() {
            entry.value().cancelled.store(true, Ordering::Release);
            entry.value().handle.abort();
        }
        self.pending.clear();
        info!("engines pool released, all pending connects cancelled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::FakeEngineClient;
    use std::sync::Mutex;

    struct FakeFactory;
    impl EngineClientFactory for FakeFactory {
        fn build(&self, _ip: &str, _name: &str) -> Arc<dyn EngineClient> {
            Arc::new(FakeEngineClient::new())
        }
    }

    struct RecordingSink {
        connected: Mutex<Vec<String>>,
        disconnected: Mutex<Vec<String>>,
    }
    impl RecordingSink {
        fn new() -> Self {
            Self {
                connected: Mutex::new(vec![]),
                disconnected: Mutex::new(vec![]),
            }
        }
    }
    impl PoolSink for RecordingSink {
        fn engine_connected(&self, engine: Arc<Engine>) {
            self.connected.lock().unwrap().push(engine.id.clone());
        }
        fn engine_disconnected(&self, engine: Arc<Engine>) {
            self.disconnected.lock().unwrap().push(engine.id.clone());
        }
    }

    #[tokio::test]
    async fn add_engine_is_idempotent_and_reaches_healthy() {
        let sink = Arc::new(RecordingSink::new());
        let pool = Arc::new(EnginesPool::new(
            Arc::new(NodeCache::new()),
            Arc::new(FakeFactory),
            sink.clone(),
            0.0,
            Duration::from_millis(1),
            3,
        ));

        pool.add_engine("10.0.0.1", "A");
        pool.add_engine("10.0.0.1", "A"); // idempotent

        // Give the spawned connect task a chance to run.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(pool.list_engines().len(), 1);
        assert_eq!(sink.connected.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_engine_marks_disconnected_and_notifies_sink() {
        let sink = Arc::new(RecordingSink::new());
        let pool = Arc::new(EnginesPool::new(
            Arc::new(NodeCache::new()),
            Arc::new(FakeFactory),
            sink.clone(),
            0.0,
            Duration::from_millis(1),
            3,
        ));

        pool.add_engine("10.0.0.1", "A");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let engine = pool.get_engine("10.0.0.1", "A").unwrap();
        assert!(engine.is_healthy());

        pool.remove_engine("10.0.0.1", "A");
        assert_eq!(engine.state(), EngineState::Disconnected);
        assert_eq!(sink.disconnected.lock().unwrap().len(), 1);
        assert!(pool.get_engine("10.0.0.1", "A").is_none());
    }
}
