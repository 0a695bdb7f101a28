//! Delayed, per-meta upgrade batcher with a completion signal
//! (spec.md §4.7). Requests arriving while a timer is pending join the
//! batch; the timer fires once and every waiter observes the same
//! outcome.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Performs the actual upgrade for a meta once its batch timer expires.
/// An external collaborator of the lifecycle pipeline (the real
/// implementation drives `Engine::create_container`/`remove_container`
/// per replica); this trait is the seam.
#[async_trait]
pub trait UpgradeExecutor: Send + Sync {
    async fn execute_upgrade(&self, meta_id: &str, image_tag: &str) -> bool;
}

struct PendingUpgrade {
    image_tag: Mutex<String>,
    waiters: Mutex<Vec<oneshot::Sender<bool>>>,
}

pub struct UpgradeCache {
    pending: DashMap<String, PendingUpgrade>,
    delay: Duration,
    executor: Arc<dyn UpgradeExecutor>,
}

impl UpgradeCache {
    pub fn new(delay: Duration, executor: Arc<dyn UpgradeExecutor>) -> Arc<Self> {
        Arc::new(Self {
            pending: DashMap::new(),
            delay,
            executor,
        })
    }

    pub fn contains(&self, meta_id: &str) -> bool {
        self.pending.contains_key(meta_id)
    }

    /// Enqueues an upgrade request for `meta_id` and awaits the batch's
    /// completion signal (a one-shot completion handle per §9; the
    /// waiter blocks on it exactly once).
    pub async fn enqueue(self: &Arc<Self>, meta_id: &str, image_tag: String) -> bool {
        let (tx, rx) = oneshot::channel();

        let is_new = match self.pending.entry(meta_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) => {
                *e.get().image_tag.lock() = image_tag.clone();
                e.get().waiters.lock().push(tx);
                false
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(PendingUpgrade {
                    image_tag: Mutex::new(image_tag.clone()),
                    waiters: Mutex::new(vec![tx]),
                });
                true
            }
        };

        if is_new {
            let this = self.clone();
            let meta_id = meta_id.to_string();
            let delay = self.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                this.flush(&meta_id).await;
            });
        } else {
            debug!(meta_id, "joined pending upgrade batch");
        }

        rx.await.unwrap_or(false)
    }

    async fn flush(&self, meta_id: &str) {
        let Some((_, batch)) = self.pending.remove(meta_id) else {
            return;
        };
        let tag = batch.image_tag.lock().clone();
        let result = self.executor.execute_upgrade(meta_id, &tag).await;
        info!(meta_id, tag, result, "upgrade batch executed");
        for tx in batch.waiters.into_inner() {
            let _ = tx.send(result);
        }
    }
}
