use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Runtime options for the cluster control core (spec.md §6).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClusterCoreConfig {
    /// Overcommit ratio applied to every engine's reported capacity.
    /// Must be > -1.0; values in (-1, 0) under-subscribe the host.
    pub overcommit: f64,
    /// Per-instance placement retry attempts before giving up on a replica.
    pub createretry: u32,
    /// Delay before an upgrade batch for a meta is executed.
    pub upgradedelay_secs: u64,
    /// Delay before a migrate batch for an engine is executed.
    pub migratedelay_secs: u64,
    /// Interval between MetaRestorer ticks.
    pub recoveryinterval_secs: u64,
    /// Free-form deployment location tag, propagated to nothing but logs.
    pub location: String,
    /// Root directory for the persisted meta cache. Empty means in-memory only.
    pub cacheroot: String,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,cluster_core=debug".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Default for ClusterCoreConfig {
    fn default() -> Self {
        Self {
            overcommit: 0.05,
            createretry: 0,
            upgradedelay_secs: 10,
            migratedelay_secs: 30,
            recoveryinterval_secs: 120,
            location: String::new(),
            cacheroot: String::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ClusterCoreConfig {
    /// Load configuration: compile-time defaults, layered with
    /// `cluster.toml` (if present) and `CLUSTER__`-prefixed environment
    /// variables, in that order.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = config::Config::try_from(&ClusterCoreConfig::default())
            .context("failed to serialize default configuration")?;

        let mut builder = config::Config::builder().add_source(defaults);

        let config_paths = ["/etc/cluster-core/cluster", "config/cluster"];
        for path in config_paths {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CLUSTER")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .context("failed to build configuration")?
            .try_deserialize()
            .context("failed to deserialize configuration")
    }

    /// Validate configuration. `overcommit <= -1.0` makes capacity
    /// non-positive and is rejected; defaults are preserved by the caller
    /// (validation never mutates `self`).
    pub fn validate(&self) -> Result<()> {
        if self.overcommit <= -1.0 {
            anyhow::bail!(
                "overcommit must be > -1.0, got {} (capacity would be non-positive)",
                self.overcommit
            );
        }
        Ok(())
    }

    pub fn upgrade_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.upgradedelay_secs)
    }

    pub fn migrate_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.migratedelay_secs)
    }

    pub fn recovery_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.recoveryinterval_secs)
    }
}
