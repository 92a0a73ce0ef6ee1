//! Bluetooth GPS discovery.
//!
//! When the serial port is configured as `AUTO`, this automaton occupies the
//! serial slot instead of a plain serial listener. It finds a GPS among the
//! nearby Bluetooth devices, binds it to a virtual serial device, proves it
//! talks NMEA and only then starts a serial listener on that device:
//!
//! ```text
//! IDLE -> SCANNING -> PROBING -> BINDING -> TESTING -> CONNECTED
//!   ^                   ^  |        |          |            |
//!   |                   +--+--------+----------+ next       | device lost
//!   +---- no candidate left                                 v
//!                               SCANNING <-- grace -- RECONNECTING
//! ```
//!
//! Scanning and the serial listener never use the bound device at the same
//! time: the listener is stopped before the binding is released, and a
//! rescan only starts after that.

pub mod host;

pub use host::{parse_scan_output, parse_spp_channel, BluetoothCandidate, BluetoothHost, ShellBluetoothHost};

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use nmea_core::{clean, is_gps_sentence, Source};

use crate::framing::LineFramer;
use crate::listener::{Listener, ListenerContext, ListenerExit, Transport};
use crate::stop::Bounded;
use crate::transport::{DeviceOpener, SerialTransport};

/// Upper bound on binding one candidate, device wait included.
///
/// Must exceed the host's own worst case, or a bind that succeeds late is
/// dropped without being released.
const BIND_LIMIT: Duration = Duration::from_secs(30);

/// Automaton position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Idle,
    Scanning,
    Probing,
    Binding,
    Testing,
    Connected,
    Reconnecting,
}

impl fmt::Display for DiscoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiscoveryState::Idle => "IDLE",
            DiscoveryState::Scanning => "SCANNING",
            DiscoveryState::Probing => "PROBING_CHANNEL",
            DiscoveryState::Binding => "BINDING",
            DiscoveryState::Testing => "TESTING",
            DiscoveryState::Connected => "CONNECTED",
            DiscoveryState::Reconnecting => "RECONNECTING",
        };
        f.write_str(name)
    }
}

/// Discovery timings.
#[derive(Debug, Clone)]
pub struct DiscoveryTiming {
    /// Minimum time between two scans.
    pub scan_interval: Duration,
    /// Pause between two automaton steps.
    pub tick: Duration,
    /// How long a bound device may stay silent before it is abandoned.
    pub test_timeout: Duration,
    /// Pause between losing a device and rescanning.
    pub reconnect_grace: Duration,
}

impl Default for DiscoveryTiming {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
            tick: Duration::from_secs(10),
            test_timeout: Duration::from_secs(50),
            reconnect_grace: Duration::from_secs(5),
        }
    }
}

/// Bluetooth discovery automaton; runs as the serial slot's listener.
pub struct BluetoothDiscovery<H> {
    host: H,
    opener: Arc<dyn DeviceOpener>,
    baud_rate: u32,
    timing: DiscoveryTiming,
    connected: Arc<AtomicBool>,
    state: DiscoveryState,
    bound: Option<PathBuf>,
    serial: Option<Listener>,
    last_scan: Option<Instant>,
}

impl<H: BluetoothHost> BluetoothDiscovery<H> {
    pub fn new(host: H, opener: Arc<dyn DeviceOpener>, baud_rate: u32, timing: DiscoveryTiming) -> Self {
        Self {
            host,
            opener,
            baud_rate,
            timing,
            connected: Arc::new(AtomicBool::new(false)),
            state: DiscoveryState::Idle,
            bound: None,
            serial: None,
            last_scan: None,
        }
    }

    /// Share an existing "connected" flag (read by the status snapshot).
    pub fn with_connected_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        flag.store(false, Ordering::SeqCst);
        self.connected = flag;
        self
    }

    pub fn connected_flag(&self) -> Arc<AtomicBool> {
        self.connected.clone()
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    pub fn bound_path(&self) -> Option<&Path> {
        self.bound.as_deref()
    }

    pub fn serial_alive(&self) -> bool {
        self.serial.as_ref().is_some_and(Listener::is_alive)
    }

    /// Run one pass of the automaton and report where it ended.
    pub async fn step(&mut self, ctx: &ListenerContext) -> DiscoveryState {
        let mut rescan_now = false;

        if self.state == DiscoveryState::Connected {
            if let Some(path) = self.bound.clone() {
                if self.host.is_healthy(&path) {
                    self.ensure_serial(ctx, &path);
                    return self.state;
                }
                warn!("Bluetooth device {} lost", path.display());
            }
            self.enter(DiscoveryState::Reconnecting);
            self.disconnect().await;
            if !ctx.sleep(self.timing.reconnect_grace).await {
                return self.state;
            }
            rescan_now = true;
        }

        let now = Instant::now();
        let due = self
            .last_scan
            .map_or(true, |at| now.duration_since(at) >= self.timing.scan_interval);
        if !due && !rescan_now {
            self.enter(DiscoveryState::Idle);
            return self.state;
        }
        self.last_scan = Some(now);

        if let Some(path) = self.host.existing_binding() {
            if self.host.is_healthy(&path) {
                info!("Testing existing binding {}", path.display());
                self.enter(DiscoveryState::Testing);
                if self.test_gps(ctx, &path).await {
                    self.connect(ctx, path);
                    return self.state;
                }
            }
        }

        if ctx.is_stopped() || !self.host.available().await {
            debug!("Bluetooth host not available");
            self.enter(DiscoveryState::Idle);
            return self.state;
        }

        self.enter(DiscoveryState::Scanning);
        let candidates = match self.host.scan().await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Bluetooth scan failed: {}", e);
                self.enter(DiscoveryState::Idle);
                return self.state;
            }
        };
        info!("Found {} Bluetooth device(s)", candidates.len());

        for candidate in candidates {
            if ctx.is_stopped() {
                break;
            }

            self.enter(DiscoveryState::Probing);
            let channel = match self.host.find_spp_channel(&candidate.mac).await {
                Ok(Some(channel)) => channel,
                Ok(None) => {
                    debug!("{} ({}) has no serial port service", candidate.name, candidate.mac);
                    continue;
                }
                Err(e) => {
                    debug!("Browsing {} failed: {}", candidate.mac, e);
                    continue;
                }
            };

            self.enter(DiscoveryState::Binding);
            let path = match ctx.within(BIND_LIMIT, self.host.bind(&candidate.mac, channel)).await {
                Bounded::Ready(Ok(path)) => path,
                Bounded::Ready(Err(e)) => {
                    warn!("Binding {} failed: {}", candidate.mac, e);
                    continue;
                }
                Bounded::TimedOut => {
                    warn!("Binding {} timed out", candidate.mac);
                    if let Some(stale) = self.host.existing_binding() {
                        if let Err(e) = self.host.release(&stale).await {
                            debug!("Release of {} failed: {}", stale.display(), e);
                        }
                    }
                    continue;
                }
                Bounded::Stopped => break,
            };

            self.enter(DiscoveryState::Testing);
            if self.test_gps(ctx, &path).await {
                info!(
                    "GPS found: {} ({}) on channel {}",
                    candidate.name, candidate.mac, channel
                );
                self.connect(ctx, path);
                return self.state;
            }

            info!("{} ({}) is not a GPS", candidate.name, candidate.mac);
            if let Err(e) = self.host.release(&path).await {
                debug!("Release of {} failed: {}", path.display(), e);
            }
        }

        self.enter(DiscoveryState::Idle);
        self.state
    }

    fn enter(&mut self, state: DiscoveryState) {
        if self.state != state {
            debug!("Bluetooth discovery: {} -> {}", self.state, state);
            self.state = state;
        }
    }

    /// Read the device until a GPS sentence shows up or the test times out.
    async fn test_gps(&self, ctx: &ListenerContext, path: &Path) -> bool {
        let path_str = path.to_string_lossy();
        let mut device = match self.opener.open(&path_str, self.baud_rate) {
            Ok(device) => device,
            Err(e) => {
                debug!("Cannot test {}: {}", path_str, e);
                return false;
            }
        };

        let deadline = Instant::now() + self.timing.test_timeout;
        let mut framer = LineFramer::default();
        let mut buf = [0u8; 512];
        while Instant::now() < deadline {
            match ctx.bounded(device.read(&mut buf)).await {
                Bounded::Stopped | Bounded::Ready(Ok(0)) => return false,
                Bounded::TimedOut => continue,
                Bounded::Ready(Ok(n)) => {
                    let found = framer.push(&buf[..n]).iter().any(|line| {
                        clean(&String::from_utf8_lossy(line)).is_some_and(|text| is_gps_sentence(&text))
                    });
                    if found {
                        return true;
                    }
                }
                Bounded::Ready(Err(e)) => debug!("Read error while testing {}: {}", path_str, e),
            }
        }
        false
    }

    fn connect(&mut self, ctx: &ListenerContext, path: PathBuf) {
        self.connected.store(true, Ordering::SeqCst);
        self.enter(DiscoveryState::Connected);
        self.ensure_serial(ctx, &path);
        self.bound = Some(path);
    }

    /// Start the serial listener if it is not running.
    fn ensure_serial(&mut self, ctx: &ListenerContext, path: &Path) {
        if self.serial_alive() {
            return;
        }
        if self.serial.is_some() {
            info!("Restarting serial listener on {}", path.display());
        }
        let transport = SerialTransport::new(path.to_string_lossy(), self.baud_rate, self.opener.clone());
        self.serial = Some(Listener::start(transport, ctx.child(Source::Serial)));
    }

    /// Stop the serial listener, then release the binding.
    async fn disconnect(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(listener) = self.serial.take() {
            let exit = listener.shutdown().await;
            debug!("Serial listener {}", exit);
        }
        if let Some(path) = self.bound.take() {
            if let Err(e) = self.host.release(&path).await {
                debug!("Release of {} failed: {}", path.display(), e);
            }
        }
    }
}

impl<H: BluetoothHost> Transport for BluetoothDiscovery<H> {
    fn describe(&self) -> String {
        "bluetooth gps discovery".to_string()
    }

    async fn run(mut self, ctx: ListenerContext) -> ListenerExit {
        info!("Bluetooth discovery started");
        loop {
            self.step(&ctx).await;
            if !ctx.sleep(self.timing.tick).await {
                break;
            }
        }
        self.disconnect().await;
        info!("Bluetooth discovery stopped");
        ListenerExit::Stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BluetoothError, ListenerError};
    use crate::listener::testing::CollectingSink;
    use crate::stop::StopSignal;
    use crate::transport::serial::DeviceStream;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    const GGA: &[u8] = b"$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47\r\n";

    #[derive(Default)]
    struct FakeHost {
        available: bool,
        existing: Option<PathBuf>,
        scans: AtomicUsize,
        candidates: Vec<BluetoothCandidate>,
        channels: HashMap<String, u8>,
        healthy: Mutex<bool>,
        released: Mutex<Vec<PathBuf>>,
    }

    impl FakeHost {
        fn with_devices(devices: &[(&str, &str, Option<u8>)]) -> Self {
            Self {
                available: true,
                candidates: devices
                    .iter()
                    .map(|(mac, name, _)| BluetoothCandidate {
                        mac: mac.to_string(),
                        name: name.to_string(),
                    })
                    .collect(),
                channels: devices
                    .iter()
                    .filter_map(|(mac, _, ch)| ch.map(|ch| (mac.to_string(), ch)))
                    .collect(),
                healthy: Mutex::new(true),
                released: Mutex::new(Vec::new()),
                ..Default::default()
            }
        }
    }

    impl BluetoothHost for FakeHost {
        async fn available(&self) -> bool {
            self.available
        }

        async fn scan(&self) -> Result<Vec<BluetoothCandidate>, BluetoothError> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            Ok(self.candidates.clone())
        }

        async fn find_spp_channel(&self, mac: &str) -> Result<Option<u8>, BluetoothError> {
            Ok(self.channels.get(mac).copied())
        }

        async fn bind(&self, mac: &str, _channel: u8) -> Result<PathBuf, BluetoothError> {
            Ok(PathBuf::from(format!("/fake/{mac}")))
        }

        async fn release(&self, path: &Path) -> Result<(), BluetoothError> {
            self.released.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }

        fn existing_binding(&self) -> Option<PathBuf> {
            self.existing.clone()
        }

        fn is_healthy(&self, _path: &Path) -> bool {
            *self.healthy.lock().unwrap()
        }
    }

    /// Serves canned bytes per device path.
    struct CannedOpener {
        devices: HashMap<String, &'static [u8]>,
        opens: AtomicUsize,
    }

    impl DeviceOpener for CannedOpener {
        fn open(&self, path: &str, _baud_rate: u32) -> Result<DeviceStream, ListenerError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let bytes = self.devices.get(path).copied().unwrap_or_default();
            Ok(Box::new(std::io::Cursor::new(bytes.to_vec())))
        }
    }

    /// Devices that stay open but never send anything.
    #[derive(Default)]
    struct SilentOpener {
        peers: Mutex<Vec<tokio::io::DuplexStream>>,
    }

    impl DeviceOpener for SilentOpener {
        fn open(&self, _path: &str, _baud_rate: u32) -> Result<DeviceStream, ListenerError> {
            let (device, peer) = tokio::io::duplex(64);
            self.peers.lock().unwrap().push(peer);
            Ok(Box::new(device))
        }
    }

    fn canned() -> Arc<CannedOpener> {
        Arc::new(CannedOpener {
            devices: HashMap::from([
                ("/fake/AA:AA:AA:AA:AA:02".to_string(), &b"$IIMTW,12.5,C*05\r\n"[..]),
                (
                    "/fake/AA:AA:AA:AA:AA:03".to_string(),
                    &b"garbage\r\n$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47\r\n"[..],
                ),
                ("/dev/rfcomm0".to_string(), GGA),
            ]),
            opens: AtomicUsize::new(0),
        })
    }

    fn opener() -> Arc<dyn DeviceOpener> {
        canned()
    }

    fn context(sink: Arc<CollectingSink>) -> ListenerContext {
        ListenerContext::new(Source::Serial, sink, &StopSignal::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovers_gps_among_candidates() {
        let host = FakeHost::with_devices(&[
            ("AA:AA:AA:AA:AA:01", "Headset", None),
            ("AA:AA:AA:AA:AA:02", "Thermometer", Some(1)),
            ("AA:AA:AA:AA:AA:03", "GPS", Some(2)),
        ]);
        let sink = Arc::new(CollectingSink::default());
        let ctx = context(sink.clone());
        let mut discovery = BluetoothDiscovery::new(host, opener(), 4800, DiscoveryTiming::default());
        let connected = discovery.connected_flag();

        assert_eq!(discovery.step(&ctx).await, DiscoveryState::Connected);
        assert!(connected.load(Ordering::SeqCst));
        assert_eq!(
            discovery.bound_path(),
            Some(Path::new("/fake/AA:AA:AA:AA:AA:03"))
        );
        // The non-GPS device was released after its test.
        assert_eq!(
            *discovery.host.released.lock().unwrap(),
            vec![PathBuf::from("/fake/AA:AA:AA:AA:AA:02")]
        );

        let lines = sink.wait_for(2).await;
        assert!(lines.iter().all(|(source, _)| *source == Source::Serial));
        assert!(lines.iter().any(|(_, text)| text.starts_with("$GPGGA")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_host_stays_idle() {
        let host = FakeHost::default();
        let ctx = context(Arc::new(CollectingSink::default()));
        let mut discovery = BluetoothDiscovery::new(host, opener(), 4800, DiscoveryTiming::default());

        assert_eq!(discovery.step(&ctx).await, DiscoveryState::Idle);
        assert!(!discovery.connected_flag().load(Ordering::SeqCst));
        assert!(discovery.bound_path().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_waits_for_interval() {
        let host = FakeHost::with_devices(&[("AA:AA:AA:AA:AA:02", "Thermometer", Some(1))]);
        let ctx = context(Arc::new(CollectingSink::default()));
        let mut discovery = BluetoothDiscovery::new(host, opener(), 4800, DiscoveryTiming::default());

        assert_eq!(discovery.step(&ctx).await, DiscoveryState::Idle);
        assert_eq!(discovery.host.released.lock().unwrap().len(), 1);

        // Too early for another scan.
        assert_eq!(discovery.step(&ctx).await, DiscoveryState::Idle);
        assert_eq!(discovery.host.released.lock().unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        discovery.step(&ctx).await;
        assert_eq!(discovery.host.released.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_device_is_released_before_rescan() {
        let host = FakeHost::with_devices(&[("AA:AA:AA:AA:AA:03", "GPS", Some(2))]);
        let ctx = context(Arc::new(CollectingSink::default()));
        let mut discovery = BluetoothDiscovery::new(host, opener(), 4800, DiscoveryTiming::default());
        assert_eq!(discovery.step(&ctx).await, DiscoveryState::Connected);

        *discovery.host.healthy.lock().unwrap() = false;
        let state = discovery.step(&ctx).await;

        let released = discovery.host.released.lock().unwrap().clone();
        assert_eq!(released, vec![PathBuf::from("/fake/AA:AA:AA:AA:AA:03")]);
        // The rescan found the same GPS again.
        assert_eq!(state, DiscoveryState::Connected);
        assert!(discovery.connected_flag().load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reuses_existing_binding() {
        let host = FakeHost {
            available: true,
            existing: Some(PathBuf::from("/dev/rfcomm0")),
            healthy: Mutex::new(true),
            ..FakeHost::default()
        };
        let ctx = context(Arc::new(CollectingSink::default()));
        let mut discovery = BluetoothDiscovery::new(host, opener(), 4800, DiscoveryTiming::default());

        assert_eq!(discovery.step(&ctx).await, DiscoveryState::Connected);
        assert_eq!(discovery.bound_path(), Some(Path::new("/dev/rfcomm0")));
        assert_eq!(discovery.host.scans.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_abandoned_after_test_window() {
        let host = FakeHost::with_devices(&[("AA:AA:AA:AA:AA:04", "Silent", Some(1))]);
        let ctx = context(Arc::new(CollectingSink::default()));
        let timing = DiscoveryTiming::default();
        let window = timing.test_timeout;
        let mut discovery = BluetoothDiscovery::new(host, Arc::new(SilentOpener::default()), 4800, timing);

        let started = Instant::now();
        assert_eq!(discovery.step(&ctx).await, DiscoveryState::Idle);

        assert!(started.elapsed() >= window);
        assert!(!discovery.connected_flag().load(Ordering::SeqCst));
        assert_eq!(
            *discovery.host.released.lock().unwrap(),
            vec![PathBuf::from("/fake/AA:AA:AA:AA:AA:04")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_serial_listener_restarted_while_connected() {
        let host = FakeHost::with_devices(&[("AA:AA:AA:AA:AA:03", "GPS", Some(2))]);
        let sink = Arc::new(CollectingSink::default());
        let ctx = context(sink.clone());
        let devices = canned();
        let mut discovery = BluetoothDiscovery::new(host, devices.clone(), 4800, DiscoveryTiming::default());

        assert_eq!(discovery.step(&ctx).await, DiscoveryState::Connected);
        // One open for the test read, one for the serial listener.
        assert_eq!(devices.opens.load(Ordering::SeqCst), 2);

        // The canned device runs dry, which ends the serial listener.
        for _ in 0..100 {
            if !discovery.serial_alive() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!discovery.serial_alive());

        assert_eq!(discovery.step(&ctx).await, DiscoveryState::Connected);
        assert_eq!(devices.opens.load(Ordering::SeqCst), 3);
        assert_eq!(discovery.host.scans.load(Ordering::SeqCst), 1);
        assert!(discovery.host.released.lock().unwrap().is_empty());

        let lines = sink.wait_for(4).await;
        let fixes = lines.iter().filter(|(_, text)| text.starts_with("$GPGGA")).count();
        assert_eq!(fixes, 2);
    }

    #[test]
    fn test_bind_limit_covers_host_worst_case() {
        assert!(BIND_LIMIT > host::worst_case_bind());
    }
}
