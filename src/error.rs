use thiserror::Error;

/// Standard Result type for the cluster core.
pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("discovery entry is invalid: {0}")]
    DiscoveryInvalid(String),

    #[error("group not found: {0}")]
    GroupNotFound(String),

    #[error("no engine available in group {0}")]
    NoEngineAvailable(String),

    #[error("meta data not found: {0}")]
    MetaDataNotFound(String),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("instances must be > 0, got {0}")]
    ContainersInstancesInvalid(i64),

    #[error("container name '{0}' already in use in group {1}")]
    CreateContainerNameConflict(String, String),

    #[error("failed to create meta data: {0}")]
    ContainersMetaCreateFailure(String),

    #[error("failed to create container: {0}")]
    CreateContainerFailure(String),

    #[error("meta {0} is upgrading")]
    ContainersUpgrading(String),

    #[error("meta {0} is migrating")]
    ContainersMigrating(String),

    #[error("meta {0} has a create/reduce/remove batch in flight")]
    ContainersSetting(String),

    #[error("engine {0} is {1}, refusing operation")]
    EngineUnavailable(String, String),

    #[error("upgrade batch for meta {0} did not land on any engine")]
    UpgradeFailed(String),

    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache (de)serialization error: {0}")]
    Cache(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] anyhow::Error),
}
