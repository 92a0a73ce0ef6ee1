//! Connection lifecycle manager.
//!
//! Reconciles the desired listener per transport kind (from the current
//! configuration) with the listeners actually running. A slot is restarted
//! when its descriptor changed or its task died, stopped when disabled and
//! left alone otherwise, so calling [`ConnectionManager::reconcile`] twice in
//! a row is a no-op the second time.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Local;
use tracing::{debug, info, warn};

use nmea_core::{
    ConfigError, ConfigStorage, Endpoint, ListenerDescriptor, RelayConfig, TransportKind,
};
use nmea_protocol::StatusSnapshot;
use nmea_providers::{
    BluetoothDiscovery, DeviceOpener, DiscoveryTiming, Listener, ListenerContext, SerialTransport,
    ShellBluetoothHost, TcpClientTransport, TcpServerTransport, TokioSerialOpener, UdpClientTransport,
    UdpServerTransport,
};

use crate::state::EngineState;

/// Builds and spawns the listener for a descriptor.
pub trait ListenerLauncher: Send + Sync + 'static {
    fn launch(&self, descriptor: &ListenerDescriptor, state: &EngineState) -> Listener;
}

/// Launches the real transports.
pub struct DefaultLauncher {
    opener: Arc<dyn DeviceOpener>,
}

impl DefaultLauncher {
    pub fn new(opener: Arc<dyn DeviceOpener>) -> Self {
        Self { opener }
    }
}

impl Default for DefaultLauncher {
    fn default() -> Self {
        Self::new(Arc::new(TokioSerialOpener))
    }
}

impl ListenerLauncher for DefaultLauncher {
    fn launch(&self, descriptor: &ListenerDescriptor, state: &EngineState) -> Listener {
        let ctx = ListenerContext::new(descriptor.source(), state.sink(), state.shutdown_signal());

        match &descriptor.endpoint {
            Endpoint::Device { baud_rate, .. } if descriptor.is_auto_serial() => {
                let timing = DiscoveryTiming {
                    scan_interval: state.config().bluetooth_scan_interval(),
                    ..DiscoveryTiming::default()
                };
                let discovery = BluetoothDiscovery::new(
                    ShellBluetoothHost::default(),
                    self.opener.clone(),
                    *baud_rate,
                    timing,
                )
                .with_connected_flag(state.bluetooth_connected().clone());
                Listener::start(discovery, ctx)
            }
            Endpoint::Device { path, baud_rate } => {
                Listener::start(SerialTransport::new(path.clone(), *baud_rate, self.opener.clone()), ctx)
            }
            Endpoint::Bind { addr } if descriptor.kind == TransportKind::Udp => {
                Listener::start(UdpServerTransport::new(*addr), ctx)
            }
            Endpoint::Bind { addr } => Listener::start(TcpServerTransport::new(*addr), ctx),
            Endpoint::Broadcast { port, sender } => {
                Listener::start(UdpClientTransport::new(*port, *sender), ctx)
            }
            Endpoint::Connect { host, port } => {
                Listener::start(TcpClientTransport::new(host.clone(), *port), ctx)
            }
        }
    }
}

/// A listener together with the descriptor it was started from.
#[derive(Debug)]
pub struct RunningListener {
    pub descriptor: ListenerDescriptor,
    pub listener: Listener,
}

/// Actions taken by one reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<TransportKind>,
    pub stopped: Vec<TransportKind>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty()
    }
}

/// Owns the engine state and the running listeners.
pub struct ConnectionManager {
    state: Arc<EngineState>,
    launcher: Box<dyn ListenerLauncher>,
    running: Mutex<HashMap<TransportKind, RunningListener>>,
    reconcile_lock: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    pub fn new(state: Arc<EngineState>, launcher: impl ListenerLauncher) -> Self {
        Self {
            state,
            launcher: Box::new(launcher),
            running: Mutex::new(HashMap::new()),
            reconcile_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    fn running(&self) -> MutexGuard<'_, HashMap<TransportKind, RunningListener>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bring the running listeners in line with the configuration.
    ///
    /// Concurrent calls are serialized.
    pub async fn reconcile(&self) -> ReconcileReport {
        let _guard = self.reconcile_lock.lock().await;
        let mut report = ReconcileReport::default();
        if self.state.shutdown_signal().is_triggered() {
            return report;
        }

        let desired = self.state.config().descriptors();

        let mut stale = Vec::new();
        {
            let mut running = self.running();
            for wanted in &desired {
                let outdated = running.get(&wanted.kind).is_some_and(|current| {
                    !wanted.enabled || current.descriptor != *wanted || !current.listener.is_alive()
                });
                if let Some(old) = outdated.then(|| running.remove(&wanted.kind)).flatten() {
                    stale.push(old);
                }
            }
        }

        for old in stale {
            let kind = old.descriptor.kind;
            let was_alive = old.listener.is_alive();
            let exit = old.listener.shutdown().await;
            if was_alive {
                info!("Stopped {} listener ({})", kind, exit);
            } else {
                info!("{} listener had exited: {}", kind, exit);
            }
            report.stopped.push(kind);
        }

        for wanted in desired.into_iter().filter(|d| d.enabled) {
            if self.running().contains_key(&wanted.kind) {
                continue;
            }
            let listener = self.launcher.launch(&wanted, &self.state);
            info!("Started {} listener: {}", wanted.kind, wanted);
            report.started.push(wanted.kind);
            self.running().insert(
                wanted.kind,
                RunningListener {
                    descriptor: wanted,
                    listener,
                },
            );
        }

        if !report.is_empty() {
            debug!(
                "Reconcile: started {:?}, stopped {:?}",
                report.started, report.stopped
            );
        }
        report
    }

    /// Replace the configuration and reconcile right away.
    pub async fn apply_config(&self, config: RelayConfig) -> ReconcileReport {
        self.state.set_config(config);
        self.reconcile().await
    }

    /// Merge `updates` over the current settings, persist them and apply.
    ///
    /// Invalid values keep their current setting and come back as warnings.
    /// Nothing is applied when the save fails.
    pub async fn update_config(
        &self,
        storage: &dyn ConfigStorage,
        updates: BTreeMap<String, String>,
    ) -> Result<(ReconcileReport, Vec<String>), ConfigError> {
        let current = self.state.config();
        let mut values = current.to_key_values();
        values.extend(updates);

        let (config, warnings) = RelayConfig::from_key_values(&values, &current);
        for warning in &warnings {
            warn!("Config update: {}", warning);
        }
        storage.save(&config.to_key_values())?;

        info!("Configuration saved, reconciling listeners");
        Ok((self.apply_config(config).await, warnings))
    }

    /// Stop every listener; no further reconcile starts anything.
    pub async fn shutdown(&self) {
        let _guard = self.reconcile_lock.lock().await;
        self.state.shutdown_signal().trigger();

        let running: Vec<RunningListener> = self.running().drain().map(|(_, r)| r).collect();
        for r in running {
            let exit = r.listener.shutdown().await;
            info!("{} listener {}", r.descriptor.kind, exit);
        }
    }

    /// Whether the listener of `kind` is running.
    pub fn is_active(&self, kind: TransportKind) -> bool {
        self.running()
            .get(&kind)
            .is_some_and(|r| r.listener.is_alive())
    }

    /// Descriptors of the listeners currently held.
    pub fn running_descriptors(&self) -> Vec<ListenerDescriptor> {
        let mut descriptors: Vec<_> = self.running().values().map(|r| r.descriptor.clone()).collect();
        descriptors.sort_by_key(|d| d.kind);
        descriptors
    }

    /// Connection status for the dashboard.
    pub fn get_status(&self) -> StatusSnapshot {
        let config = self.state.config();

        let (udp_active, tcp_active, serial_connected) = {
            let running = self.running();
            let alive = |kind: TransportKind| running.get(&kind).is_some_and(|r| r.listener.is_alive());
            let serial_connected = match running.get(&TransportKind::Serial) {
                Some(r) if r.descriptor.is_auto_serial() => {
                    r.listener.is_alive() && self.state.is_bluetooth_connected()
                }
                Some(r) => r.listener.is_alive(),
                None => false,
            };
            (alive(TransportKind::Udp), alive(TransportKind::Tcp), serial_connected)
        };

        StatusSnapshot {
            udp_active,
            tcp_active,
            serial_connected,
            connections_active: [udp_active, tcp_active, serial_connected]
                .iter()
                .filter(|active| **active)
                .count(),
            udp_enabled: config.udp.enabled,
            tcp_enabled: config.tcp.enabled,
            serial_enabled: config.serial.enabled,
            udp_mode: config.udp.mode,
            tcp_mode: config.tcp.mode,
            timestamp: Local::now().format("%H:%M:%S").to_string(),
            statistics: Some(self.state.statistics().snapshot()),
            circuit: Some(self.state.emitter().circuit()),
        }
    }
}
