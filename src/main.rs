use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use cluster_core::cache::ContainersConfigCache;
use cluster_core::config::{ClusterCoreConfig, LogFormat};
use cluster_core::hooks::{HooksProcessor, LoggingWebhookClient};
use cluster_core::node_cache::NodeCache;
use cluster_core::notify::LoggingNotifier;
use cluster_core::pool::LoggingEngineClientFactory;
use cluster_core::Cluster;

#[tokio::main]
async fn main() -> Result<()> {
    // Phase 1: basic tracing so config loading itself gets logged.
    let _basic_tracing = init_tracing_basic();

    info!("starting cluster-core v{}", env!("CARGO_PKG_VERSION"));

    let config = ClusterCoreConfig::load().context("failed to load configuration")?;
    config.validate().context("configuration validation failed")?;

    // Phase 2: re-initialize tracing with the loaded config.
    drop(_basic_tracing);
    init_tracing_from_config(&config);

    info!(cache_root = %config.cacheroot, "configuration loaded");

    let cache = Arc::new(
        ContainersConfigCache::init(&config.cacheroot).context("failed to load containers config cache")?,
    );
    let node_cache = Arc::new(NodeCache::new());
    let hooks = HooksProcessor::new(Arc::new(LoggingWebhookClient));
    let notifier = Arc::new(LoggingNotifier);

    let cluster = Cluster::new(
        config,
        cache,
        node_cache,
        Arc::new(LoggingEngineClientFactory),
        hooks,
        notifier,
    );

    cluster.start();
    info!("cluster-core is ready");

    shutdown_signal().await;

    cluster.stop();
    info!("cluster-core shut down gracefully");
    Ok(())
}

/// Phase 1: basic tracing init so we can log during config loading.
fn init_tracing_basic() -> tracing::subscriber::DefaultGuard {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,cluster_core=debug"));

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_default(subscriber)
}

/// Phase 2: re-initialize tracing with configuration values, replacing
/// the thread-local subscriber from phase 1 with a global one.
fn init_tracing_from_config(config: &ClusterCoreConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match &config.logging.format {
        LogFormat::Json => {
            let layer = fmt::layer().json().with_target(true).with_thread_ids(true);
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
        LogFormat::Pretty => {
            let layer = fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false);
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => warn!("received ctrl-c, shutting down"),
        _ = terminate => warn!("received SIGTERM, shutting down"),
    }
}
