//! Configuration watcher.
//!
//! Polls the storage modification time and reconciles after every change.
//! A slower supervision tick reconciles even without changes so listeners
//! that gave up on a missing device or a busy port get another chance.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use nmea_core::config::load_config;
use nmea_core::ConfigStorage;
use nmea_providers::StopSignal;

use crate::lifecycle::{ConnectionManager, ReconcileReport};

/// Default modification-time polling interval.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default supervision interval.
pub const SUPERVISE_INTERVAL: Duration = Duration::from_secs(10);

pub struct ConfigWatcher {
    storage: Arc<dyn ConfigStorage>,
    manager: Arc<ConnectionManager>,
    poll_interval: Duration,
    supervise_interval: Duration,
    last_modified: Option<SystemTime>,
}

impl ConfigWatcher {
    pub fn new(storage: Arc<dyn ConfigStorage>, manager: Arc<ConnectionManager>) -> Self {
        let last_modified = storage.modified().ok();
        Self {
            storage,
            manager,
            poll_interval: POLL_INTERVAL,
            supervise_interval: SUPERVISE_INTERVAL,
            last_modified,
        }
    }

    pub fn with_intervals(mut self, poll: Duration, supervise: Duration) -> Self {
        self.poll_interval = poll;
        self.supervise_interval = supervise;
        self
    }

    /// Reload and reconcile if the storage changed since the last check.
    pub async fn check(&mut self) -> Option<ReconcileReport> {
        let modified = match self.storage.modified() {
            Ok(modified) => modified,
            Err(e) => {
                debug!("Config not readable, keeping current: {}", e);
                return None;
            }
        };
        if self.last_modified == Some(modified) {
            return None;
        }
        self.last_modified = Some(modified);

        let previous = self.manager.state().config();
        let (config, warnings) = match load_config(self.storage.as_ref(), &previous) {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!("Config reload failed, keeping current: {}", e);
                return None;
            }
        };
        for warning in warnings {
            warn!("Config: {}", warning);
        }

        info!("Configuration changed, reconciling listeners");
        Some(self.manager.apply_config(config).await)
    }

    /// Run until `stop` fires.
    pub async fn run(mut self, stop: StopSignal) {
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut supervise = tokio::time::interval(self.supervise_interval);
        supervise.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Both intervals fire immediately; the startup reconcile already ran.
        poll.tick().await;
        supervise.tick().await;

        loop {
            tokio::select! {
                _ = stop.wait() => break,
                _ = poll.tick() => {
                    if let Some(report) = self.check().await {
                        debug!("Config reconcile: {:?}", report);
                    }
                }
                _ = supervise.tick() => {
                    let report = self.manager.reconcile().await;
                    if !report.is_empty() {
                        info!("Supervision restarted {:?}", report.started);
                    }
                }
            }
        }
        debug!("Config watcher stopped");
    }
}
