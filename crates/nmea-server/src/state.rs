//! Shared engine state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use nmea_core::RelayConfig;
use nmea_providers::{SentenceSink, StopSignal};

use crate::emission::{Emitter, Publisher};
use crate::pipeline::IngestPipeline;
use crate::statistics::StatisticsCollector;

/// State shared by the lifecycle manager, listeners and query handlers.
pub struct EngineState {
    config: RwLock<RelayConfig>,
    emitter: Arc<Emitter>,
    pipeline: Arc<IngestPipeline>,
    stats: Arc<StatisticsCollector>,
    shutdown: StopSignal,
    bluetooth_connected: Arc<AtomicBool>,
}

impl EngineState {
    pub fn new(config: RelayConfig, publisher: Arc<dyn Publisher>) -> Self {
        let stats = Arc::new(StatisticsCollector::new());
        let emitter = Arc::new(Emitter::new(
            publisher,
            stats.clone(),
            config.circuit_config(),
            config.emission.max_per_second,
        ));
        let pipeline = Arc::new(IngestPipeline::new(
            config.sentence_filter(),
            emitter.clone(),
            stats.clone(),
        ));

        Self {
            config: RwLock::new(config),
            emitter,
            pipeline,
            stats,
            shutdown: StopSignal::new(),
            bluetooth_connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Current configuration.
    pub fn config(&self) -> RelayConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the configuration and retune the filter and emission path.
    ///
    /// Listeners are not touched; the lifecycle manager reconciles them.
    pub fn set_config(&self, config: RelayConfig) {
        self.pipeline.set_filter(config.sentence_filter());
        self.emitter
            .reconfigure(config.circuit_config(), config.emission.max_per_second);
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    pub fn emitter(&self) -> &Arc<Emitter> {
        &self.emitter
    }

    pub fn pipeline(&self) -> &Arc<IngestPipeline> {
        &self.pipeline
    }

    /// The pipeline as the sink handed to listeners.
    pub fn sink(&self) -> Arc<dyn SentenceSink> {
        self.pipeline.clone()
    }

    pub fn statistics(&self) -> &Arc<StatisticsCollector> {
        &self.stats
    }

    /// Process-wide shutdown signal; every listener stop signal is a child.
    pub fn shutdown_signal(&self) -> &StopSignal {
        &self.shutdown
    }

    /// Flag set by Bluetooth discovery while a GPS is bound.
    pub fn bluetooth_connected(&self) -> &Arc<AtomicBool> {
        &self.bluetooth_connected
    }

    pub fn is_bluetooth_connected(&self) -> bool {
        self.bluetooth_connected.load(Ordering::SeqCst)
    }
}
