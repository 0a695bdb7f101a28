//! Core data model: servers, groups, engines, containers and meta-records
//! (spec.md §3).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `(IP, Name)`. `Name` is upper-cased on ingress (§9 "uppercasing of
/// names"). A server is identified by whichever of `ip`/`name` is
/// non-empty, `ip` preferred.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Server {
    pub ip: String,
    pub name: String,
}

impl Server {
    pub fn new(ip: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            name: name.into().to_uppercase(),
        }
    }

    /// Stable identity used as a map key: `ip` if non-empty, else `name`.
    pub fn key(&self) -> &str {
        if !self.ip.is_empty() {
            &self.ip
        } else {
            &self.name
        }
    }
}

/// A named declarative set of servers that can host replicas of metas
/// bound to the group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub is_cluster: bool,
    pub location: String,
    pub servers: Vec<Server>,
    pub contact_info: String,
}

/// Decoded discovery entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeData {
    pub ip: String,
    pub name: String,
    pub api_addr: String,
    pub cpus: f64,
    pub memory: u64,
    pub labels: HashMap<String, String>,
}

/// Connection state of a live engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Pending,
    Healthy,
    Unhealthy,
    Disconnected,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineState::Pending => "pending",
            EngineState::Healthy => "healthy",
            EngineState::Unhealthy => "unhealthy",
            EngineState::Disconnected => "disconnected",
        };
        write!(f, "{s}")
    }
}

/// Declared spec of a container, as handed to the engine client on create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Requested CPUs, used for placement weighting (§4.4).
    #[serde(default)]
    pub cpus: f64,
    /// Requested memory in bytes, used for placement weighting (§4.4).
    #[serde(default)]
    pub memory: u64,
}

/// Observed runtime facts about a container, as reported by an engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub state: String,
}

/// A container as an engine reports it: observed facts plus the spec it
/// was created with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub info: ContainerInfo,
    pub config: ContainerSpec,
}

impl Container {
    /// Meta identity labels are injected by placement (`meta_id` label);
    /// an engine is "bound" to a meta when any of its containers carries
    /// this label with that meta's id.
    pub fn meta_id(&self) -> Option<&str> {
        self.config.labels.get("meta_id").map(String::as_str)
    }
}

/// Action accepted by `Engine::operate_container`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerAction {
    Start,
    Stop,
    Restart,
    Kill,
    Pause,
    Unpause,
}

impl std::fmt::Display for ContainerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerAction::Start => "start",
            ContainerAction::Stop => "stop",
            ContainerAction::Restart => "restart",
            ContainerAction::Kill => "kill",
            ContainerAction::Pause => "pause",
            ContainerAction::Unpause => "unpause",
        };
        write!(f, "{s}")
    }
}

/// One placed replica's durable record: index, container id, spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseConfig {
    pub id: String,
    pub index: i64,
    pub config: ContainerSpec,
}

/// Webhook declared on a meta; delivered by `HooksProcessor`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebHook {
    pub url: String,
}

/// The canonical spec of a replicated workload, without its placements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaBase {
    pub meta_id: String,
    pub group_id: String,
    pub instances: i64,
    #[serde(default)]
    pub web_hooks: Vec<WebHook>,
    pub config: ContainerSpec,
}

/// `MetaBase` plus its current placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaData {
    #[serde(flatten)]
    pub base: MetaBase,
    #[serde(default)]
    pub base_configs: Vec<BaseConfig>,
}

impl MetaData {
    pub fn meta_id(&self) -> &str {
        &self.base.meta_id
    }

    pub fn group_id(&self) -> &str {
        &self.base.group_id
    }

    pub fn name(&self) -> &str {
        &self.base.config.name
    }
}

/// Lifecycle events fanned out by `HooksProcessor` (spec.md §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    Create,
    Update,
    Upgrade,
    Remove,
    Operate,
    Recovery,
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HookEvent::Create => "create",
            HookEvent::Update => "update",
            HookEvent::Upgrade => "upgrade",
            HookEvent::Remove => "remove",
            HookEvent::Operate => "operate",
            HookEvent::Recovery => "recovery",
        };
        write!(f, "{s}")
    }
}

/// Container name as produced by placement: `CLUSTER-{group_id[:8]}-{name}-{index}`.
pub fn container_name(group_id: &str, config_name: &str, index: i64) -> String {
    let prefix: String = group_id.chars().take(8).collect();
    format!("CLUSTER-{prefix}-{config_name}-{index}")
}

/// Environment injected into created containers (spec.md §6).
pub fn injected_env(
    group_id: &str,
    meta_id: &str,
    index: i64,
    original_name: &str,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("HUMPBACK_CLUSTER_GROUPID".to_string(), group_id.to_string());
    env.insert("HUMPBACK_CLUSTER_METAID".to_string(), meta_id.to_string());
    env.insert(
        "HUMPBACK_CLUSTER_CONTAINER_INDEX".to_string(),
        index.to_string(),
    );
    env.insert(
        "HUMPBACK_CLUSTER_CONTAINER_ORIGINALNAME".to_string(),
        original_name.to_string(),
    );
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_uppercases_name() {
        let s = Server::new("10.0.0.1", "host-a");
        assert_eq!(s.name, "HOST-A");
    }

    #[test]
    fn server_key_prefers_ip() {
        let s = Server::new("10.0.0.1", "HOST-A");
        assert_eq!(s.key(), "10.0.0.1");
        let s2 = Server::new("", "HOST-A");
        assert_eq!(s2.key(), "HOST-A");
    }

    #[test]
    fn container_name_uses_short_group_prefix() {
        let name = container_name("abcdefgh12345", "web", 2);
        assert_eq!(name, "CLUSTER-abcdefgh-web-2");
    }
}
