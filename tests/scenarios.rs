//! End-to-end scenarios exercised against the public `Cluster` API only,
//! mirroring the fake-client integration style the core's own unit tests
//! use for `EnginesPool`/`DiscoveryAdapter`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cluster_core::cache::ContainersConfigCache;
use cluster_core::config::ClusterCoreConfig;
use cluster_core::discovery::{DiscoveryAdapter, DiscoveryEntry, DiscoveryHandler, GroupMembership};
use cluster_core::engine::fake::FakeEngineClient;
use cluster_core::engine::EngineClient;
use cluster_core::error::ClusterError;
use cluster_core::hooks::{HooksProcessor, LoggingWebhookClient};
use cluster_core::model::{ContainerSpec, EngineState, Group, NodeData, Server};
use cluster_core::node_cache::NodeCache;
use cluster_core::notify::LoggingNotifier;
use cluster_core::pool::EngineClientFactory;
use cluster_core::Cluster;

struct FakeFactory;
impl EngineClientFactory for FakeFactory {
    fn build(&self, _ip: &str, _name: &str) -> Arc<dyn EngineClient> {
        Arc::new(FakeEngineClient::new())
    }
}

fn spec(name: &str) -> ContainerSpec {
    ContainerSpec {
        name: name.to_string(),
        image: "busybox".into(),
        command: vec![],
        env: Default::default(),
        labels: Default::default(),
        cpus: 1.0,
        memory: 512 << 20,
    }
}

fn node(ip: &str, name: &str, cpus: f64, memory: u64) -> NodeData {
    NodeData {
        ip: ip.to_string(),
        name: name.to_string(),
        api_addr: format!("{ip}:2375"),
        cpus,
        memory,
        labels: HashMap::new(),
    }
}

fn test_config() -> ClusterCoreConfig {
    let mut config = ClusterCoreConfig::default();
    config.createretry = 2;
    config.upgradedelay_secs = 0;
    config.migratedelay_secs = 0;
    config
}

fn build_cluster(node_cache: Arc<NodeCache>) -> Arc<Cluster> {
    Cluster::new(
        test_config(),
        Arc::new(ContainersConfigCache::new()),
        node_cache,
        Arc::new(FakeFactory),
        HooksProcessor::new(Arc::new(LoggingWebhookClient)),
        Arc::new(LoggingNotifier),
    )
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

fn three_server_group(group_id: &str) -> Group {
    Group {
        id: group_id.to_string(),
        name: group_id.to_string(),
        is_cluster: false,
        location: String::new(),
        servers: vec![
            Server::new("10.0.0.1", "A"),
            Server::new("10.0.0.2", "B"),
            Server::new("10.0.0.3", "C"),
        ],
        contact_info: String::new(),
    }
}

/// S1 — two healthy engines, one unhealthy: three replicas land only on
/// the healthy pair, named with the group's container-naming convention.
#[tokio::test]
async fn s1_create_skips_unhealthy_engine() {
    let node_cache = Arc::new(NodeCache::new());
    node_cache.insert("10.0.0.1", node("10.0.0.1", "A", 2.0, 4 << 30));
    node_cache.insert("10.0.0.2", node("10.0.0.2", "B", 2.0, 4 << 30));
    node_cache.insert("10.0.0.3", node("10.0.0.3", "C", 2.0, 4 << 30));

    let cluster = build_cluster(node_cache);
    cluster.set_group(three_server_group("g1"));
    wait_until(|| cluster.engines_pool().list_engines().len() == 3).await;

    let c = cluster.engines_pool().get_engine("10.0.0.3", "C").unwrap();
    c.set_state(EngineState::Unhealthy);

    let meta = cluster
        .create_containers("g1", 3, vec![], spec("web"))
        .await
        .unwrap();

    assert_eq!(meta.base_configs.len(), 3);
    assert!(!c.has_meta(meta.meta_id()), "unhealthy engine must not host any replica");
    let mut names: Vec<_> = meta.base_configs.iter().map(|bc| bc.config.name.clone()).collect();
    names.sort();
    assert_eq!(
        names,
        vec![
            "CLUSTER-g1-web-0".to_string(),
            "CLUSTER-g1-web-1".to_string(),
            "CLUSTER-g1-web-2".to_string(),
        ]
    );
}

/// S2 — name conflict against a live meta.
#[tokio::test]
async fn s2_create_rejects_duplicate_name() {
    let node_cache = Arc::new(NodeCache::new());
    node_cache.insert("10.0.0.1", node("10.0.0.1", "A", 2.0, 4 << 30));
    let cluster = build_cluster(node_cache);
    cluster.set_group(Group {
        id: "g1".into(),
        name: "g1".into(),
        is_cluster: false,
        location: String::new(),
        servers: vec![Server::new("10.0.0.1", "A")],
        contact_info: String::new(),
    });
    wait_until(|| cluster.engines_pool().list_engines().len() == 1).await;

    cluster.create_containers("g1", 1, vec![], spec("web")).await.unwrap();
    let err = cluster
        .create_containers("g1", 1, vec![], spec("web"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::CreateContainerNameConflict(_, _)));
}

/// S3 — shrink drops replicas down to the requested count.
#[tokio::test]
async fn s3_update_shrink_converges_on_instance_count() {
    let node_cache = Arc::new(NodeCache::new());
    node_cache.insert("10.0.0.1", node("10.0.0.1", "A", 4.0, 8 << 30));
    node_cache.insert("10.0.0.2", node("10.0.0.2", "B", 4.0, 8 << 30));
    let cluster = build_cluster(node_cache);
    cluster.set_group(Group {
        id: "g1".into(),
        name: "g1".into(),
        is_cluster: false,
        location: String::new(),
        servers: vec![Server::new("10.0.0.1", "A"), Server::new("10.0.0.2", "B")],
        contact_info: String::new(),
    });
    wait_until(|| cluster.engines_pool().list_engines().len() == 2).await;

    let meta = cluster
        .create_containers("g1", 4, vec![], spec("web"))
        .await
        .unwrap();
    assert_eq!(meta.base_configs.len(), 4);

    let shrunk = cluster.update_containers(meta.meta_id(), 1, vec![]).await.unwrap();
    assert_eq!(shrunk.base.instances, 1);
    assert_eq!(shrunk.base_configs.len(), 1);
}

/// S4 — an engine flapping to Unhealthy mid-upgrade does not stop the
/// batch; the other engines' containers still get upgraded.
#[tokio::test]
async fn s4_upgrade_tolerates_one_engine_going_unhealthy() {
    let node_cache = Arc::new(NodeCache::new());
    node_cache.insert("10.0.0.1", node("10.0.0.1", "A", 2.0, 4 << 30));
    node_cache.insert("10.0.0.2", node("10.0.0.2", "B", 2.0, 4 << 30));
    let cluster = build_cluster(node_cache);
    cluster.set_group(Group {
        id: "g1".into(),
        name: "g1".into(),
        is_cluster: false,
        location: String::new(),
        servers: vec![Server::new("10.0.0.1", "A"), Server::new("10.0.0.2", "B")],
        contact_info: String::new(),
    });
    wait_until(|| cluster.engines_pool().list_engines().len() == 2).await;

    let meta = cluster
        .create_containers("g1", 2, vec![], spec("web"))
        .await
        .unwrap();
    assert_eq!(meta.base_configs.len(), 2);

    // A flaps to Unhealthy before the (zero-delay) upgrade batch executes.
    let a = cluster.engines_pool().get_engine("10.0.0.1", "A").unwrap();
    a.set_state(EngineState::Unhealthy);

    let result = cluster.upgrade_containers(meta.meta_id(), "v2".to_string()).await;
    assert!(result.is_ok(), "batch succeeds as long as one engine upgraded");
}

struct GroupOf(Arc<Cluster>);
impl GroupMembership for GroupOf {
    fn in_any_group(&self, key: &str) -> bool {
        self.0.in_any_group(key)
    }
}

/// S5 — discovery eviction of a server still declared by a second group
/// must not disconnect its engine.
#[tokio::test]
async fn s5_discovery_eviction_keeps_engine_shared_by_another_group() {
    let node_cache = Arc::new(NodeCache::new());
    let cluster = build_cluster(node_cache.clone());

    cluster.set_group(Group {
        id: "g1".into(),
        name: "g1".into(),
        is_cluster: false,
        location: String::new(),
        servers: vec![Server::new("10.0.0.1", "A")],
        contact_info: String::new(),
    });
    cluster.set_group(Group {
        id: "g2".into(),
        name: "g2".into(),
        is_cluster: false,
        location: String::new(),
        servers: vec![Server::new("10.0.0.1", "A")],
        contact_info: String::new(),
    });
    wait_until(|| cluster.engines_pool().list_engines().len() == 1).await;

    let adapter = DiscoveryAdapter::new(
        cluster.engines_pool(),
        node_cache,
        Arc::new(LoggingNotifier),
        Arc::new(GroupOf(cluster.clone())),
    );

    let removed = DiscoveryEntry {
        key: "10.0.0.1".into(),
        data: serde_json::to_vec(&node("10.0.0.1", "A", 2.0, 4 << 30)).unwrap(),
    };
    adapter.on_batch(vec![], vec![removed], None).await;

    assert!(
        cluster.engines_pool().get_engine("10.0.0.1", "A").is_some(),
        "server still declared by g2 must stay connected"
    );
}

/// S6 — after a restart, the cache's base-configs don't match anything
/// any engine reports; one restorer tick re-derives a clean placement.
#[tokio::test]
async fn s6_restorer_recreates_orphaned_meta() {
    let node_cache = Arc::new(NodeCache::new());
    node_cache.insert("10.0.0.1", node("10.0.0.1", "A", 4.0, 8 << 30));
    node_cache.insert("10.0.0.2", node("10.0.0.2", "B", 4.0, 8 << 30));
    node_cache.insert("10.0.0.3", node("10.0.0.3", "C", 4.0, 8 << 30));

    let cache = Arc::new(ContainersConfigCache::new());
    let meta = cache
        .create_meta_data("g1", 3, vec![], spec("web"))
        .unwrap();
    // Simulate a prior process's stale base-configs: IDs no engine will
    // ever report after the restart.
    for i in 0..3 {
        cache
            .set_container_base_config(
                meta.meta_id(),
                cluster_core::model::BaseConfig {
                    id: format!("stale-{i}"),
                    index: i,
                    config: spec("web"),
                },
            )
            .unwrap();
    }

    let cluster = Cluster::new(
        test_config(),
        cache,
        node_cache,
        Arc::new(FakeFactory),
        HooksProcessor::new(Arc::new(LoggingWebhookClient)),
        Arc::new(LoggingNotifier),
    );
    cluster.set_group(three_server_group("g1"));
    wait_until(|| cluster.engines_pool().list_engines().len() == 3).await;

    cluster.restorer_tick().await;

    let recovered = cluster.get_meta_data(meta.meta_id()).unwrap();
    assert_eq!(recovered.base_configs.len(), 3);
    for bc in &recovered.base_configs {
        assert!(!bc.id.starts_with("stale-"), "orphaned base-configs must be replaced");
    }
}
