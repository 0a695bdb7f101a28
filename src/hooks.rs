//! Async dispatch of lifecycle events to per-meta webhook endpoints
//! (spec.md §4.8). Delivery is best-effort; failures are logged, never
//! surfaced to the caller.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::model::{HookEvent, MetaData};

/// The webhook transport. An external collaborator — production code
/// wires this to an HTTP client.
#[async_trait]
pub trait WebhookClient: Send + Sync {
    async fn deliver(
        &self,
        url: &str,
        event: HookEvent,
        meta_id: &str,
        payload: &serde_json::Value,
    ) -> Result<(), String>;
}

pub struct HooksProcessor {
    client: Arc<dyn WebhookClient>,
}

impl HooksProcessor {
    pub fn new(client: Arc<dyn WebhookClient>) -> Arc<Self> {
        Arc::new(Self { client })
    }

    /// Enqueues an asynchronous delivery to every webhook declared on
    /// `meta` for `event`. Never blocks the caller.
    pub fn dispatch(self: &Arc<Self>, event: HookEvent, meta: &MetaData) {
        for hook in meta.base.web_hooks.clone() {
            let client = self.client.clone();
            let meta_id = meta.meta_id().to_string();
            let payload = serde_json::json!({
                "event": event.to_string(),
                "meta_id": meta_id,
                "group_id": meta.group_id(),
                "instances": meta.base.instances,
            });
            tokio::spawn(async move {
                if let Err(e) = client.deliver(&hook.url, event, &meta_id, &payload).await {
                    warn!(url = %hook.url, meta_id, %event, error = %e, "webhook delivery failed");
                }
            });
        }
    }
}

/// Logs instead of delivering. Used by the standalone binary, which
/// carries no HTTP client.
pub struct LoggingWebhookClient;

#[async_trait]
impl WebhookClient for LoggingWebhookClient {
    async fn deliver(
        &self,
        url: &str,
        event: HookEvent,
        meta_id: &str,
        _payload: &serde_json::Value,
    ) -> Result<(), String> {
        tracing::debug!(url, meta_id, %event, "webhook delivery (logging stub)");
        Ok(())
    }
}
