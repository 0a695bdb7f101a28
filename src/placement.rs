//! Weighted ranking by free resources, affinity to engines already
//! hosting the meta, blacklist of failed engines, randomized tie-break
//! (spec.md §4.4).

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::cache::ContainersConfigCache;
use crate::engine::Engine;
use crate::error::ClusterError;
use crate::model::{container_name, injected_env, BaseConfig, Container, ContainerSpec};

fn weighted_sort(engines: &mut [Arc<Engine>]) {
    engines.sort_by(|a, b| {
        b.free_memory()
            .partial_cmp(&a.free_memory())
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.free_cpus().partial_cmp(&a.free_cpus()).unwrap_or(Ordering::Equal))
            .then_with(|| a.name.cmp(&b.name))
    });
}

/// Pick one engine for a replica of `meta_id` among `candidates`.
///
/// 1. Only Healthy candidates are considered.
/// 2. The affinity set ("Alloc") is every candidate already bound to the meta.
/// 3. The remaining candidates are weighted by free memory/cpu, ties by name.
/// 4. Blacklisted engines are dropped from the weighted list; if that
///    empties it and the affinity set is non-empty, fall back to the
///    affinity set in randomized order.
pub fn select_engine(
    candidates: &[Arc<Engine>],
    meta_id: &str,
    blacklist: &HashSet<String>,
) -> Option<Arc<Engine>> {
    let healthy: Vec<Arc<Engine>> = candidates.iter().filter(|e| e.is_healthy()).cloned().collect();
    let affinity: Vec<Arc<Engine>> = healthy.iter().filter(|e| e.has_meta(meta_id)).cloned().collect();

    let mut weighted = healthy;
    weighted_sort(&mut weighted);
    let filtered: Vec<Arc<Engine>> = weighted
        .into_iter()
        .filter(|e| !blacklist.contains(&e.id))
        .collect();

    if filtered.is_empty() && !affinity.is_empty() {
        let mut alloc = affinity;
        alloc.shuffle(&mut rand::thread_rng());
        return alloc.into_iter().next();
    }

    filtered.into_iter().next()
}

/// A successful placement, ready to be reported via the notification
/// collaborator.
pub struct CreatedPair {
    pub engine_ip: String,
    pub engine_name: String,
    pub container: Container,
}

fn is_terminal(err: &ClusterError) -> bool {
    matches!(err, ClusterError::NoEngineAvailable(_))
        || err.to_string().contains(" not found")
}

/// Place `instances` replicas of `base_spec` across `candidates`, each with
/// a freshly allocated idle-index, retrying per-instance up to
/// `create_retry` times (spec.md §4.4). Every success is recorded as a
/// `BaseConfig` in `cache`.
pub async fn create_replicas(
    candidates: &[Arc<Engine>],
    cache: &ContainersConfigCache,
    meta_id: &str,
    group_id: &str,
    base_spec: &ContainerSpec,
    instances: i64,
    create_retry: u32,
) -> Vec<CreatedPair> {
    let mut placed = Vec::new();

    for _ in 0..instances {
        let index = cache.make_container_idle_index(meta_id);
        if index < 0 {
            warn!(meta_id, "no idle index available, skipping replica");
            continue;
        }

        let mut blacklist: HashSet<String> = HashSet::new();
        let mut attempt = 0u32;
        loop {
            let Some(engine) = select_engine(candidates, meta_id, &blacklist) else {
                warn!(meta_id, "no engine available for replica {}", index);
                break;
            };

            let mut spec = base_spec.clone();
            spec.name = container_name(group_id, &base_spec.name, index);
            spec.labels.insert("meta_id".to_string(), meta_id.to_string());
            spec.labels
                .insert("group_id".to_string(), group_id.to_string());
            for (k, v) in injected_env(group_id, meta_id, index, &base_spec.name) {
                spec.env.insert(k, v);
            }

            match engine.create_container(&spec).await {
                Ok(container) => {
                    let base_config = BaseConfig {
                        id: container.info.id.clone(),
                        index,
                        config: spec.clone(),
                    };
                    if let Err(e) = cache.set_container_base_config(meta_id, base_config) {
                        warn!(meta_id, error = %e, "failed to persist base config");
                    }
                    debug!(meta_id, engine = %engine.id, index, "placed replica");
                    placed.push(CreatedPair {
                        engine_ip: engine.ip.clone(),
                        engine_name: engine.name.clone(),
                        container,
                    });
                    break;
                }
                Err(e) => {
                    blacklist.insert(engine.id.clone());
                    if is_terminal(&e) {
                        warn!(meta_id, error = %e, "terminal placement error, not retrying this instance");
                        break;
                    }
                    attempt += 1;
                    if attempt > create_retry {
                        warn!(meta_id, error = %e, attempts = attempt, "exhausted create retries for this instance");
                        break;
                    }
                    debug!(meta_id, error = %e, attempt, "retrying placement on a different engine");
                }
            }
        }
    }

    placed
}
