//! Durable store of metas keyed by `MetaID`, plus reverse indexes
//! (spec.md §4.1).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{ClusterError, Result};
use crate::model::{BaseConfig, ContainerSpec, MetaBase, MetaData, WebHook};

struct Inner {
    metas: HashMap<String, MetaData>,
    by_group: HashMap<String, HashSet<String>>,
    by_group_name: HashMap<(String, String), String>,
    by_container: HashMap<String, String>,
}

impl Inner {
    fn new() -> Self {
        Self {
            metas: HashMap::new(),
            by_group: HashMap::new(),
            by_group_name: HashMap::new(),
            by_container: HashMap::new(),
        }
    }

    fn index_insert(&mut self, meta: &MetaData) {
        self.by_group
            .entry(meta.group_id().to_string())
            .or_default()
            .insert(meta.meta_id().to_string());
        self.by_group_name.insert(
            (meta.group_id().to_string(), meta.name().to_string()),
            meta.meta_id().to_string(),
        );
        for bc in &meta.base_configs {
            self.by_container
                .insert(bc.id.clone(), meta.meta_id().to_string());
        }
    }

    fn index_remove(&mut self, meta: &MetaData) {
        if let Some(set) = self.by_group.get_mut(meta.group_id()) {
            set.remove(meta.meta_id());
            if set.is_empty() {
                self.by_group.remove(meta.group_id());
            }
        }
        self.by_group_name
            .remove(&(meta.group_id().to_string(), meta.name().to_string()));
        for bc in &meta.base_configs {
            self.by_container.remove(&bc.id);
        }
    }
}

/// Persistent store of meta-records and their base-configs. All mutations
/// are serialized relative to each other via an internal lock; reads
/// snapshot under the read lock.
pub struct ContainersConfigCache {
    cache_root: Option<PathBuf>,
    inner: RwLock<Inner>,
}

impl ContainersConfigCache {
    pub fn new() -> Self {
        Self {
            cache_root: None,
            inner: RwLock::new(Inner::new()),
        }
    }

    /// Load from `cache_root`. An empty root means in-memory only.
    pub fn init(cache_root: &str) -> Result<Self> {
        if cache_root.is_empty() {
            return Ok(Self::new());
        }
        let root = PathBuf::from(cache_root);
        std::fs::create_dir_all(&root)?;

        let mut inner = Inner::new();
        let mut loaded = 0usize;
        let mut discarded = 0usize;
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = std::fs::read(&path)?;
            match serde_json::from_slice::<MetaData>(&bytes) {
                Ok(meta) => {
                    inner.index_insert(&meta);
                    inner.metas.insert(meta.meta_id().to_string(), meta);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "discarding partially written meta record");
                    discarded += 1;
                }
            }
        }
        info!(loaded, discarded, root = %root.display(), "loaded containers config cache");

        Ok(Self {
            cache_root: Some(root),
            inner: RwLock::new(inner),
        })
    }

    fn meta_path(&self, meta_id: &str) -> Option<PathBuf> {
        self.cache_root.as_ref().map(|r| r.join(format!("{meta_id}.json")))
    }

    /// Atomic replace-on-write: write to a temp file, then rename.
    fn persist(&self, meta: &MetaData) -> Result<()> {
        let Some(path) = self.meta_path(meta.meta_id()) else {
            return Ok(());
        };
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(meta)?;
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove_persisted(&self, meta_id: &str) -> Result<()> {
        if let Some(path) = self.meta_path(meta_id) {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn create_meta_data(
        &self,
        group_id: &str,
        instances: i64,
        web_hooks: Vec<WebHook>,
        config: ContainerSpec,
    ) -> Result<MetaData> {
        let mut inner = self.inner.write();
        let key = (group_id.to_string(), config.name.clone());
        if inner.by_group_name.contains_key(&key) {
            return Err(ClusterError::CreateContainerNameConflict(
                config.name.clone(),
                group_id.to_string(),
            ));
        }
        let meta = MetaData {
            base: MetaBase {
                meta_id: uuid::Uuid::new_v4().to_string(),
                group_id: group_id.to_string(),
                instances,
                web_hooks,
                config,
            },
            base_configs: Vec::new(),
        };
        inner.index_insert(&meta);
        inner.metas.insert(meta.meta_id().to_string(), meta.clone());
        drop(inner);
        self.persist(&meta)?;
        debug!(meta_id = %meta.meta_id(), group_id, "created meta data");
        Ok(meta)
    }

    pub fn set_meta_data(
        &self,
        meta_id: &str,
        instances: i64,
        web_hooks: Vec<WebHook>,
    ) -> Result<MetaData> {
        let mut inner = self.inner.write();
        let meta = inner
            .metas
            .get_mut(meta_id)
            .ok_or_else(|| ClusterError::MetaDataNotFound(meta_id.to_string()))?;
        meta.base.instances = instances;
        meta.base.web_hooks = web_hooks;
        let snapshot = meta.clone();
        drop(inner);
        self.persist(&snapshot)?;
        Ok(snapshot)
    }

    pub fn remove_meta_data(&self, meta_id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let meta = inner
            .metas
            .remove(meta_id)
            .ok_or_else(|| ClusterError::MetaDataNotFound(meta_id.to_string()))?;
        inner.index_remove(&meta);
        drop(inner);
        self.remove_persisted(meta_id)?;
        debug!(meta_id, "removed meta data");
        Ok(())
    }

    pub fn get_meta_data(&self, meta_id: &str) -> Option<MetaData> {
        self.inner.read().metas.get(meta_id).cloned()
    }

    pub fn get_meta_data_of_container(&self, container_id: &str) -> Option<MetaData> {
        let inner = self.inner.read();
        let meta_id = inner.by_container.get(container_id)?;
        inner.metas.get(meta_id).cloned()
    }

    pub fn get_meta_data_of_name(&self, group_id: &str, name: &str) -> Option<MetaData> {
        let inner = self.inner.read();
        let meta_id = inner
            .by_group_name
            .get(&(group_id.to_string(), name.to_string()))?;
        inner.metas.get(meta_id).cloned()
    }

    pub fn get_group_meta_data(&self, group_id: &str) -> Vec<MetaData> {
        let inner = self.inner.read();
        inner
            .by_group
            .get(group_id)
            .map(|ids| ids.iter().filter_map(|id| inner.metas.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn get_meta_data_base_configs(&self, meta_id: &str) -> Vec<BaseConfig> {
        self.inner
            .read()
            .metas
            .get(meta_id)
            .map(|m| m.base_configs.clone())
            .unwrap_or_default()
    }

    pub fn get_meta_data_base_configs_count(&self, meta_id: &str) -> usize {
        self.inner
            .read()
            .metas
            .get(meta_id)
            .map(|m| m.base_configs.len())
            .unwrap_or(0)
    }

    /// Smallest non-negative integer not currently used by a base-config
    /// of `meta_id` (invariant 2). Returns -1 if the meta does not exist.
    pub fn make_container_idle_index(&self, meta_id: &str) -> i64 {
        let inner = self.inner.read();
        let Some(meta) = inner.metas.get(meta_id) else {
            return -1;
        };
        let used: HashSet<i64> = meta.base_configs.iter().map(|bc| bc.index).collect();
        let mut idx = 0i64;
        while used.contains(&idx) {
            idx += 1;
        }
        idx
    }

    pub fn set_container_base_config(&self, meta_id: &str, base_config: BaseConfig) -> Result<()> {
        let mut inner = self.inner.write();
        let meta = inner
            .metas
            .get_mut(meta_id)
            .ok_or_else(|| ClusterError::MetaDataNotFound(meta_id.to_string()))?;
        meta.base_configs.retain(|bc| bc.id != base_config.id);
        meta.base_configs.push(base_config.clone());
        inner
            .by_container
            .insert(base_config.id.clone(), meta_id.to_string());
        let snapshot = inner.metas.get(meta_id).cloned().unwrap();
        drop(inner);
        self.persist(&snapshot)
    }

    pub fn remove_container_base_config(&self, meta_id: &str, container_id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let meta = inner
            .metas
            .get_mut(meta_id)
            .ok_or_else(|| ClusterError::MetaDataNotFound(meta_id.to_string()))?;
        meta.base_configs.retain(|bc| bc.id != container_id);
        inner.by_container.remove(container_id);
        let snapshot = inner.metas.get(meta_id).cloned().unwrap();
        drop(inner);
        self.persist(&snapshot)
    }

    /// All metas, for restorer/recovery sweeps.
    pub fn all_meta_data(&self) -> Vec<MetaData> {
        self.inner.read().metas.values().cloned().collect()
    }
}

impl Default for ContainersConfigCache {
    fn default() -> Self {
        Self::new()
    }
}
