//! Notification/webhook collaborator (spec.md §6): external surfaces the
//! core reports lifecycle and discovery events to. An external
//! collaborator — this module only defines the boundary plus a logging
//! no-op used by the standalone binary and tests.

use crate::model::EngineState;

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub key: String,
    pub state: EngineState,
}

pub trait ClusterNotifier: Send + Sync {
    fn notify_group_engines_watch_event(&self, msg: &str, events: &[WatchEvent]);
    fn notify_group_meta_containers_event(&self, msg: &str, err: Option<&str>, meta_id: &str);
}

/// Logs events instead of delivering them anywhere. Used by the
/// standalone binary, which carries no RPC front end to forward to.
pub struct LoggingNotifier;

impl ClusterNotifier for LoggingNotifier {
    fn notify_group_engines_watch_event(&self, msg: &str, events: &[WatchEvent]) {
        tracing::info!(msg, count = events.len(), "group engines watch event");
    }

    fn notify_group_meta_containers_event(&self, msg: &str, err: Option<&str>, meta_id: &str) {
        match err {
            Some(e) => tracing::warn!(msg, meta_id, error = e, "group meta containers event"),
            None => tracing::info!(msg, meta_id, "group meta containers event"),
        }
    }
}
