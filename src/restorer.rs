//! Periodic loop that re-binds orphaned metas to healthy engines and
//! triggers container recreation (spec.md §4.9). Started on
//! `Cluster::start`, stopped on `Cluster::stop`.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tracing::{debug, info};

use crate::cluster::Cluster;

pub struct MetaRestorer {
    cluster: Arc<Cluster>,
    interval: Duration,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
}

impl MetaRestorer {
    pub fn new(
        cluster: Arc<Cluster>,
        interval: Duration,
        shutdown_rx: tokio::sync::watch::Receiver<bool>,
    ) -> Self {
        Self {
            cluster,
            interval,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!(interval_secs = self.interval.as_secs(), "starting meta restorer");
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("running restorer tick");
                    self.cluster.restorer_tick().await;
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("meta restorer stopping");
                        break;
                    }
                }
            }
        }
    }
}
