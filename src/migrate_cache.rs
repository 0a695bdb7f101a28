//! Delayed per-engine migration batcher with cancel semantics
//! (spec.md §4.7).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::engine::Engine;

/// Performs the actual migration for (group, engine) once its batch
/// timer expires without being cancelled. Takes the disconnected
/// engine itself, not just its id: by the time the batch fires the
/// engine is already gone from the pool, so there is nothing left to
/// look it up by.
#[async_trait]
pub trait MigrateExecutor: Send + Sync {
    async fn execute_migrate(&self, group_id: &str, engine: Arc<Engine>);
}

struct PendingMigrate {
    cancelled: Arc<AtomicBool>,
}

pub struct MigrateCache {
    pending: DashMap<(String, String), PendingMigrate>,
    delay: Duration,
    executor: Arc<dyn MigrateExecutor>,
}

impl MigrateCache {
    pub fn new(delay: Duration, executor: Arc<dyn MigrateExecutor>) -> Arc<Self> {
        Arc::new(Self {
            pending: DashMap::new(),
            delay,
            executor,
        })
    }

    pub fn contains(&self, group_id: &str, engine_id: &str) -> bool {
        self.pending
            .contains_key(&(group_id.to_string(), engine_id.to_string()))
    }

    /// Enqueues a migration for `engine` in `group_id`; a request
    /// arriving while a timer is already pending just joins it. Keyed
    /// by the engine's own id, never a pool key — that's what `contains`
    /// and the executor are compared against downstream.
    pub fn enqueue(self: &Arc<Self>, group_id: &str, engine: Arc<Engine>) {
        let key = (group_id.to_string(), engine.id.clone());
        if self.pending.contains_key(&key) {
            debug!(group_id, engine_id = %engine.id, "joined pending migrate batch");
            return;
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        self.pending.insert(
            key.clone(),
            PendingMigrate {
                cancelled: cancelled.clone(),
            },
        );

        let this = self.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.flush(&key, engine, cancelled).await;
        });
    }

    async fn flush(&self, key: &(String, String), engine: Arc<Engine>, cancelled: Arc<AtomicBool>) {
        // Remove ourselves first so a fresh enqueue() after this point
        // starts its own timer rather than joining a dead batch.
        self.pending.remove(key);
        if cancelled.load(Ordering::Acquire) {
            debug!(group_id = %key.0, engine_id = %key.1, "migrate batch cancelled, skipping");
            return;
        }
        info!(group_id = %key.0, engine_id = %key.1, "executing migrate batch");
        self.executor.execute_migrate(&key.0, engine).await;
    }

    /// Cancels all pending migrations for `group_id`.
    pub fn remove_group(&self, group_id: &str) {
        let keys: Vec<(String, String)> = self
            .pending
            .iter()
            .filter(|e| e.key().0 == group_id)
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            if let Some((_, batch)) = self.pending.remove(&key) {
                batch.cancelled.store(true, Ordering::Release);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::FakeEngineClient;
    use crate::model::NodeData;
    use std::sync::atomic::AtomicUsize;

    struct CountingExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MigrateExecutor for CountingExecutor {
        async fn execute_migrate(&self, _group_id: &str, _engine: Arc<Engine>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn engine(ip: &str, name: &str) -> Arc<Engine> {
        let node = NodeData {
            ip: ip.to_string(),
            name: name.to_string(),
            api_addr: String::new(),
            cpus: 0.0,
            memory: 0,
            labels: Default::default(),
        };
        Arc::new(Engine::new(&node, 0.0, Arc::new(FakeEngineClient::new())))
    }

    #[tokio::test]
    async fn enqueue_runs_after_delay() {
        let executor = Arc::new(CountingExecutor {
            calls: AtomicUsize::new(0),
        });
        let cache = MigrateCache::new(Duration::from_millis(10), executor.clone());
        let e1 = engine("10.0.0.1", "A");
        cache.enqueue("g1", e1.clone());
        assert!(cache.contains("g1", &e1.id));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!cache.contains("g1", &e1.id));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remove_group_cancels_pending_migrations() {
        let executor = Arc::new(CountingExecutor {
            calls: AtomicUsize::new(0),
        });
        let cache = MigrateCache::new(Duration::from_millis(20), executor.clone());
        cache.enqueue("g1", engine("10.0.0.1", "A"));
        cache.enqueue("g1", engine("10.0.0.2", "B"));
        cache.enqueue("g2", engine("10.0.0.3", "C"));
        cache.remove_group("g1");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }
}
