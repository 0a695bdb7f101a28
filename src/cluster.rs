//! The aggregator that owns groups, engines and in-flight placements and
//! exposes the public lifecycle API (spec.md §4.5-§4.11, §5).
//!
//! `Cluster` is constructed with `Arc::new_cyclic` so that `EnginesPool`,
//! `UpgradeCache` and `MigrateCache` can hold a weak back-reference to it
//! (as the injected `PoolSink`/`UpgradeExecutor`/`MigrateExecutor`
//! capabilities) without an ownership cycle (§9).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::cache::ContainersConfigCache;
use crate::config::ClusterCoreConfig;
use crate::discovery::GroupMembership;
use crate::engine::Engine;
use crate::error::{ClusterError, Result};
use crate::hooks::HooksProcessor;
use crate::migrate_cache::{MigrateCache, MigrateExecutor};
use crate::model::{BaseConfig, ContainerAction, ContainerSpec, Group, HookEvent, MetaData, Server, WebHook};
use crate::node_cache::NodeCache;
use crate::notify::ClusterNotifier;
use crate::placement::create_replicas;
use crate::pool::{EngineClientFactory, EnginesPool, PoolSink};
use crate::upgrade_cache::{UpgradeCache, UpgradeExecutor};

/// A create/update/reduce/remove batch currently in flight for a
/// workload name (spec.md §4.6). Keyed purely by name, cluster-wide: two
/// groups racing to set up the same workload name block each other, same
/// as the system this core was modeled on.
struct PendingEntry {
    group_id: String,
}

/// Outcome of one engine/container pair in an operate/remove batch. The
/// batch as a whole still succeeds when individual pairs fail; callers
/// inspect `error` per pair.
#[derive(Debug, Clone)]
pub struct OperationOutcome {
    pub engine_ip: String,
    pub container_id: String,
    pub error: Option<String>,
}

pub struct Cluster {
    config: ClusterCoreConfig,
    groups: RwLock<HashMap<String, Group>>,
    pool: Arc<EnginesPool>,
    node_cache: Arc<NodeCache>,
    cache: Arc<ContainersConfigCache>,
    pending: DashMap<String, PendingEntry>,
    hooks: Arc<HooksProcessor>,
    notifier: Arc<dyn ClusterNotifier>,
    upgrade_cache: Arc<UpgradeCache>,
    migrate_cache: Arc<MigrateCache>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
}

struct ClusterSink(Weak<Cluster>);

impl PoolSink for ClusterSink {
    fn engine_connected(&self, engine: Arc<Engine>) {
        if let Some(cluster) = self.0.upgrade() {
            info!(engine = %engine.id, "cluster observed engine connect");
            cluster
                .notifier
                .notify_group_meta_containers_event("engine connected", None, &engine.id);
        }
    }

    fn engine_disconnected(&self, engine: Arc<Engine>) {
        if let Some(cluster) = self.0.upgrade() {
            let key = Server::new(&engine.ip, &engine.name).key().to_string();
            let group_id = cluster.group_for_server_key(&key).unwrap_or_default();
            cluster.migrate_cache.enqueue(&group_id, engine);
        }
    }
}

struct ClusterExecutor(Weak<Cluster>);

#[async_trait]
impl UpgradeExecutor for ClusterExecutor {
    async fn execute_upgrade(&self, meta_id: &str, image_tag: &str) -> bool {
        match self.0.upgrade() {
            Some(cluster) => cluster.do_execute_upgrade(meta_id, image_tag).await,
            None => false,
        }
    }
}

#[async_trait]
impl MigrateExecutor for ClusterExecutor {
    async fn execute_migrate(&self, group_id: &str, engine: Arc<Engine>) {
        if let Some(cluster) = self.0.upgrade() {
            cluster.do_execute_migrate(group_id, engine).await;
        }
    }
}

impl Cluster {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ClusterCoreConfig,
        cache: Arc<ContainersConfigCache>,
        node_cache: Arc<NodeCache>,
        client_factory: Arc<dyn EngineClientFactory>,
        hooks: Arc<HooksProcessor>,
        notifier: Arc<dyn ClusterNotifier>,
    ) -> Arc<Self> {
        let overcommit = config.overcommit;
        let migrate_delay = config.migrate_delay();
        let upgrade_delay = config.upgrade_delay();

        Arc::new_cyclic(|weak: &Weak<Cluster>| {
            let pool = Arc::new(EnginesPool::new(
                node_cache.clone(),
                client_factory,
                Arc::new(ClusterSink(weak.clone())),
                overcommit,
                Duration::from_secs(1),
                0,
            ));
            let migrate_cache = MigrateCache::new(migrate_delay, Arc::new(ClusterExecutor(weak.clone())));
            let upgrade_cache = UpgradeCache::new(upgrade_delay, Arc::new(ClusterExecutor(weak.clone())));
            let (shutdown_tx, _) = tokio::sync::watch::channel(false);

            Cluster {
                config,
                groups: RwLock::new(HashMap::new()),
                pool,
                node_cache,
                cache,
                pending: DashMap::new(),
                hooks,
                notifier,
                upgrade_cache,
                migrate_cache,
                shutdown_tx,
            }
        })
    }

    pub fn engines_pool(&self) -> Arc<EnginesPool> {
        self.pool.clone()
    }

    pub fn get_meta_data(&self, meta_id: &str) -> Option<MetaData> {
        self.cache.get_meta_data(meta_id)
    }

    // -- lifecycle -----------------------------------------------------

    pub fn start(self: &Arc<Self>) {
        let shutdown_rx = self.shutdown_tx.subscribe();
        let restorer = crate::restorer::MetaRestorer::new(
            self.clone(),
            self.config.recovery_interval(),
            shutdown_rx,
        );
        tokio::spawn(restorer.run());
        info!("cluster started");
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.pool.release();
        info!("cluster stopped");
    }

    // -- group membership -----------------------------------------------

    pub fn set_group(&self, mut group: Group) {
        for s in group.servers.iter_mut() {
            *s = Server::new(&s.ip, &s.name);
        }

        let mut groups = self.groups.write();
        let previous = groups.insert(group.id.clone(), group.clone());

        let old_keys: HashSet<String> = previous
            .as_ref()
            .map(|g| g.servers.iter().map(|s| s.key().to_string()).collect())
            .unwrap_or_default();
        let new_keys: HashSet<String> = group.servers.iter().map(|s| s.key().to_string()).collect();

        for s in &group.servers {
            if !old_keys.contains(s.key()) {
                self.pool.add_engine(&s.ip, &s.name);
            }
        }

        if let Some(previous) = previous {
            for s in &previous.servers {
                if new_keys.contains(s.key()) {
                    continue;
                }
                let covered_elsewhere = groups
                    .values()
                    .any(|g| g.id != group.id && g.servers.iter().any(|gs| gs.key() == s.key()));
                if !covered_elsewhere {
                    self.pool.remove_engine(&s.ip, &s.name);
                }
            }
        }

        info!(group_id = %group.id, servers = group.servers.len(), "group set");
    }

    pub async fn remove_group(&self, group_id: &str) -> Result<()> {
        self.migrate_cache.remove_group(group_id);

        let metas = self.cache.get_group_meta_data(group_id);
        let removals = metas.iter().map(|m| self.remove_containers(m.meta_id(), ""));
        let _ = futures::future::join_all(removals).await;

        let removed = self.groups.write().remove(group_id);
        if let Some(removed) = removed {
            let groups = self.groups.read();
            for s in &removed.servers {
                let covered_elsewhere = groups.values().any(|g| g.servers.iter().any(|gs| gs.key() == s.key()));
                if !covered_elsewhere {
                    self.pool.remove_engine(&s.ip, &s.name);
                }
            }
        }
        info!(group_id, "group removed");
        Ok(())
    }

    fn group_server_keys(&self, group_id: &str) -> HashSet<String> {
        self.groups
            .read()
            .get(group_id)
            .map(|g| g.servers.iter().map(|s| s.key().to_string()).collect())
            .unwrap_or_default()
    }

    fn group_for_server_key(&self, key: &str) -> Option<String> {
        self.groups
            .read()
            .values()
            .find(|g| g.servers.iter().any(|s| s.key() == key))
            .map(|g| g.id.clone())
    }

    fn engines_in_group(&self, group_id: &str) -> Vec<Arc<Engine>> {
        let keys = self.group_server_keys(group_id);
        self.pool
            .list_engines()
            .into_iter()
            .filter(|e| keys.contains(Server::new(&e.ip, &e.name).key()))
            .collect()
    }

    fn healthy_engines_in_group(&self, group_id: &str) -> Vec<Arc<Engine>> {
        self.engines_in_group(group_id)
            .into_iter()
            .filter(|e| e.is_healthy())
            .collect()
    }

    // -- admission gating (§4.6) ----------------------------------------

    fn contains_pending(&self, group_id: &str, name: &str) -> bool {
        self.pending.get(name).map(|e| e.group_id == group_id).unwrap_or(false)
    }

    fn check_name_uniqueness(&self, group_id: &str, name: &str) -> Result<()> {
        if self.pending.contains_key(name) || self.cache.get_meta_data_of_name(group_id, name).is_some() {
            return Err(ClusterError::CreateContainerNameConflict(
                name.to_string(),
                group_id.to_string(),
            ));
        }
        Ok(())
    }

    fn validate_meta_data(&self, meta_id: &str) -> Result<MetaData> {
        if self.upgrade_cache.contains(meta_id) {
            return Err(ClusterError::ContainersUpgrading(meta_id.to_string()));
        }
        let meta = self
            .cache
            .get_meta_data(meta_id)
            .ok_or_else(|| ClusterError::MetaDataNotFound(meta_id.to_string()))?;

        let migrating = self
            .engines_in_group(meta.group_id())
            .iter()
            .any(|e| self.migrate_cache.contains(meta.group_id(), &e.id));
        if migrating {
            return Err(ClusterError::ContainersMigrating(meta_id.to_string()));
        }

        if self.contains_pending(meta.group_id(), meta.name()) {
            return Err(ClusterError::ContainersSetting(meta_id.to_string()));
        }

        Ok(meta)
    }

    // -- create / update / remove (§4.5, §4.6) ---------------------------

    pub async fn create_containers(
        &self,
        group_id: &str,
        instances: i64,
        web_hooks: Vec<WebHook>,
        config: ContainerSpec,
    ) -> Result<MetaData> {
        if instances <= 0 {
            return Err(ClusterError::ContainersInstancesInvalid(instances));
        }
        if !self.groups.read().contains_key(group_id) {
            return Err(ClusterError::GroupNotFound(group_id.to_string()));
        }
        self.check_name_uniqueness(group_id, &config.name)?;

        if self.engines_in_group(group_id).is_empty() {
            return Err(ClusterError::NoEngineAvailable(group_id.to_string()));
        }

        self.pending.insert(
            config.name.clone(),
            PendingEntry {
                group_id: group_id.to_string(),
            },
        );
        let meta = match self.cache.create_meta_data(group_id, instances, web_hooks, config.clone()) {
            Ok(meta) => meta,
            Err(e @ ClusterError::CreateContainerNameConflict(_, _)) => {
                self.pending.remove(&config.name);
                return Err(e);
            }
            Err(e) => {
                self.pending.remove(&config.name);
                return Err(ClusterError::ContainersMetaCreateFailure(e.to_string()));
            }
        };

        let engines = self.healthy_engines_in_group(group_id);
        let placed = create_replicas(
            &engines,
            &self.cache,
            meta.meta_id(),
            group_id,
            &config,
            instances,
            self.config.createretry,
        )
        .await;
        self.pending.remove(&config.name);

        if placed.is_empty() {
            let _ = self.cache.remove_meta_data(meta.meta_id());
            return Err(ClusterError::NoEngineAvailable(group_id.to_string()));
        }

        let final_meta = self.cache.get_meta_data(meta.meta_id()).unwrap();
        self.hooks.dispatch(HookEvent::Create, &final_meta);
        self.notifier
            .notify_group_meta_containers_event("containers created", None, meta.meta_id());
        Ok(final_meta)
    }

    pub async fn update_containers(
        &self,
        meta_id: &str,
        instances: i64,
        web_hooks: Vec<WebHook>,
    ) -> Result<MetaData> {
        if instances <= 0 {
            return Err(ClusterError::ContainersInstancesInvalid(instances));
        }
        let meta = self.validate_meta_data(meta_id)?;
        self.cache.set_meta_data(meta_id, instances, web_hooks)?;

        let current = self.cache.get_meta_data_base_configs_count(meta_id) as i64;
        if instances > current {
            let grow = instances - current;
            self.pending.insert(
                meta.name().to_string(),
                PendingEntry {
                    group_id: meta.group_id().to_string(),
                },
            );
            let engines = self.healthy_engines_in_group(meta.group_id());
            create_replicas(
                &engines,
                &self.cache,
                meta_id,
                meta.group_id(),
                &meta.base.config,
                grow,
                self.config.createretry,
            )
            .await;
            self.pending.remove(meta.name());
        } else if instances < current {
            self.reduce_containers(&meta, current - instances).await;
        }

        let final_meta = self.cache.get_meta_data(meta_id).unwrap();
        self.hooks.dispatch(HookEvent::Update, &final_meta);
        self.notifier
            .notify_group_meta_containers_event("containers updated", None, meta_id);
        Ok(final_meta)
    }

    /// Drops `n` replicas of `meta`, preferring the engine currently
    /// hosting the most of them (spec.md §4.6).
    async fn reduce_containers(&self, meta: &MetaData, n: i64) {
        self.pending.insert(
            meta.name().to_string(),
            PendingEntry {
                group_id: meta.group_id().to_string(),
            },
        );

        for _ in 0..n {
            let engines = self.engines_in_group(meta.group_id());
            let heaviest = engines
                .iter()
                .map(|e| (e.clone(), e.container_count_of_meta(meta.meta_id())))
                .filter(|(_, count)| *count > 0)
                .max_by_key(|(_, count)| *count);

            let Some((engine, _)) = heaviest else {
                break;
            };
            let Some(container) = engine.containers_of_meta(meta.meta_id()).into_iter().next() else {
                break;
            };

            match engine.remove_container(&container.info.id).await {
                Ok(()) => {
                    let _ = self.cache.remove_container_base_config(meta.meta_id(), &container.info.id);
                }
                Err(e) => {
                    warn!(meta_id = meta.meta_id(), error = %e, "failed to remove container during reduce");
                }
            }
        }

        self.pending.remove(meta.name());
    }

    pub async fn remove_containers(&self, meta_id: &str, container_id: &str) -> Result<Vec<OperationOutcome>> {
        let meta = self.validate_meta_data(meta_id)?;
        self.pending.insert(
            meta.name().to_string(),
            PendingEntry {
                group_id: meta.group_id().to_string(),
            },
        );

        let engines = self.engines_in_group(meta.group_id());
        let mut outcomes = Vec::new();
        'outer: for engine in &engines {
            for container in engine.containers_of_meta(meta_id) {
                if !container_id.is_empty() && container.info.id != container_id {
                    continue;
                }
                let result = engine.remove_container(&container.info.id).await;
                let error = result.err().map(|e| e.to_string());
                if error.is_none() {
                    let _ = self.cache.remove_container_base_config(meta_id, &container.info.id);
                }
                outcomes.push(OperationOutcome {
                    engine_ip: engine.ip.clone(),
                    container_id: container.info.id.clone(),
                    error,
                });
                if !container_id.is_empty() {
                    break 'outer;
                }
            }
        }

        self.pending.remove(meta.name());
        if self.cache.get_meta_data_base_configs_count(meta_id) == 0 {
            let _ = self.cache.remove_meta_data(meta_id);
        }
        self.hooks.dispatch(HookEvent::Remove, &meta);
        self.notifier
            .notify_group_meta_containers_event("containers removed", None, meta_id);
        Ok(outcomes)
    }

    pub async fn operate_containers(
        &self,
        meta_id: &str,
        container_id: &str,
        action: ContainerAction,
    ) -> Result<Vec<OperationOutcome>> {
        let meta = self.validate_meta_data(meta_id)?;
        let engines = self.engines_in_group(meta.group_id());

        let mut outcomes = Vec::new();
        'outer: for engine in &engines {
            for container in engine.containers_of_meta(meta_id) {
                if !container_id.is_empty() && container.info.id != container_id {
                    continue;
                }
                let error = if engine.is_healthy() {
                    engine
                        .operate_container(&container.info.id, action)
                        .await
                        .err()
                        .map(|e| e.to_string())
                } else {
                    Some(format!("engine state is {}", engine.state()))
                };
                outcomes.push(OperationOutcome {
                    engine_ip: engine.ip.clone(),
                    container_id: container.info.id.clone(),
                    error,
                });
                if !container_id.is_empty() {
                    break 'outer;
                }
            }
        }

        self.hooks.dispatch(HookEvent::Operate, &meta);
        Ok(outcomes)
    }

    // -- upgrade (§4.7) ---------------------------------------------------

    pub async fn upgrade_containers(&self, meta_id: &str, image_tag: String) -> Result<Vec<BaseConfig>> {
        self.validate_meta_data(meta_id)?;
        let ok = self.upgrade_cache.enqueue(meta_id, image_tag).await;
        if !ok {
            return Err(ClusterError::UpgradeFailed(meta_id.to_string()));
        }
        let meta = self
            .cache
            .get_meta_data(meta_id)
            .ok_or_else(|| ClusterError::MetaDataNotFound(meta_id.to_string()))?;
        self.hooks.dispatch(HookEvent::Upgrade, &meta);
        Ok(meta.base_configs.clone())
    }

    async fn do_execute_upgrade(&self, meta_id: &str, image_tag: &str) -> bool {
        let Some(meta) = self.cache.get_meta_data(meta_id) else {
            return false;
        };
        let engines = self.healthy_engines_in_group(meta.group_id());
        let mut any_success = false;

        for engine in &engines {
            for container in engine.containers_of_meta(meta_id) {
                let mut new_spec = container.config.clone();
                new_spec.image = image_tag.to_string();

                if let Err(e) = engine.remove_container(&container.info.id).await {
                    warn!(meta_id, error = %e, "upgrade: failed to remove old container");
                    continue;
                }
                let _ = self.cache.remove_container_base_config(meta_id, &container.info.id);

                match engine.create_container(&new_spec).await {
                    Ok(new_container) => {
                        let index = meta
                            .base_configs
                            .iter()
                            .find(|bc| bc.id == container.info.id)
                            .map(|bc| bc.index)
                            .unwrap_or(0);
                        let _ = self.cache.set_container_base_config(
                            meta_id,
                            BaseConfig {
                                id: new_container.info.id,
                                index,
                                config: new_spec,
                            },
                        );
                        any_success = true;
                    }
                    Err(e) => {
                        warn!(meta_id, error = %e, "upgrade: failed to create replacement container");
                    }
                }
            }
        }

        any_success
    }

    // -- migrate (§4.7) ----------------------------------------------------

    /// `engine` is the pre-disconnect handle captured by `ClusterSink`,
    /// not a fresh pool lookup: by the time this runs, the engine is
    /// already gone from `EnginesPool`, so there is nothing left to find
    /// it by.
    async fn do_execute_migrate(&self, group_id: &str, engine: Arc<Engine>) {
        for container in engine.containers() {
            let Some(meta_id) = container.meta_id().map(str::to_string) else {
                continue;
            };
            let Some(meta) = self.cache.get_meta_data(&meta_id) else {
                continue;
            };
            let targets: Vec<Arc<Engine>> = self
                .healthy_engines_in_group(group_id)
                .into_iter()
                .filter(|e| e.id != engine.id)
                .collect();
            let placed = create_replicas(
                &targets,
                &self.cache,
                &meta_id,
                group_id,
                &meta.base.config,
                1,
                self.config.createretry,
            )
            .await;
            if !placed.is_empty() {
                let _ = self.cache.remove_container_base_config(&meta_id, &container.info.id);
                let _ = engine.remove_container(&container.info.id).await;
            } else {
                warn!(meta_id, engine_id = %engine.id, "migrate: no target engine available for replica");
            }
        }
    }

    // -- recovery (§4.5, §4.9) ----------------------------------------------

    pub async fn recovery_containers(&self, meta_id: &str) -> Result<MetaData> {
        let meta = self
            .cache
            .get_meta_data(meta_id)
            .ok_or_else(|| ClusterError::MetaDataNotFound(meta_id.to_string()))?;
        let engines = self.healthy_engines_in_group(meta.group_id());

        let live_ids: HashSet<String> = engines.iter().flat_map(|e| e.containers().into_iter().map(|c| c.info.id)).collect();
        for bc in &meta.base_configs {
            if !live_ids.contains(&bc.id) {
                let _ = self.cache.remove_container_base_config(meta_id, &bc.id);
            }
        }

        let count = self.cache.get_meta_data_base_configs_count(meta_id) as i64;
        if !engines.is_empty() && meta.base.instances != count {
            if meta.base.instances > count {
                create_replicas(
                    &engines,
                    &self.cache,
                    meta_id,
                    meta.group_id(),
                    &meta.base.config,
                    meta.base.instances - count,
                    self.config.createretry,
                )
                .await;
            } else {
                let refreshed = self.cache.get_meta_data(meta_id).unwrap();
                self.reduce_containers(&refreshed, count - meta.base.instances).await;
            }
        }

        let final_meta = self.cache.get_meta_data(meta_id).unwrap();
        self.hooks.dispatch(HookEvent::Recovery, &final_meta);
        self.notifier
            .notify_group_meta_containers_event("meta recovered", None, meta_id);
        Ok(final_meta)
    }

    /// One sweep of the meta restorer (spec.md §4.9): detects metas whose
    /// bound containers no engine reports any more, and metas that never
    /// got any replica placed despite declaring instances.
    pub async fn restorer_tick(&self) {
        for meta in self.cache.all_meta_data() {
            let engines = self.healthy_engines_in_group(meta.group_id());
            if engines.is_empty() {
                continue;
            }
            let live_ids: HashSet<String> = engines.iter().flat_map(|e| e.containers().into_iter().map(|c| c.info.id)).collect();

            let orphaned = !meta.base_configs.is_empty() && meta.base_configs.iter().all(|bc| !live_ids.contains(&bc.id));
            let missing = meta.base_configs.is_empty() && meta.base.instances > 0;

            if orphaned || missing {
                if let Err(e) = self.recovery_containers(meta.meta_id()).await {
                    warn!(meta_id = meta.meta_id(), error = %e, "restorer recovery failed");
                }
            }
        }
    }
}

impl GroupMembership for Cluster {
    fn in_any_group(&self, key: &str) -> bool {
        self.groups.read().values().any(|g| g.servers.iter().any(|s| s.key() == key))
    }
}
