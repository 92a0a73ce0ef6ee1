//! Relay configuration and its storage.
//!
//! Configuration is a flat `KEY=VALUE` text file (the `.env` format used by
//! the dashboard that edits it):
//!
//! ```text
//! ENABLE_SERIAL=true
//! SERIAL_PORT=AUTO
//! SERIAL_BAUDRATE=4800
//! ENABLE_UDP=true
//! UDP_MODE=server
//! UDP_PORT=5005
//! ENABLE_TCP=true
//! TCP_MODE=client
//! TCP_TARGET_IP=192.168.1.20
//! TCP_TARGET_PORT=50110
//! ```
//!
//! Parsing never fails as a whole. A missing key takes its default value and
//! an unparsable value keeps the value from the previous configuration; each
//! such fallback is reported as a warning string for the caller to log.
//!
//! Storage is abstracted behind [`ConfigStorage`] so the watcher and the
//! update path can be exercised without touching the filesystem.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};
use thiserror::Error;

use crate::circuit::CircuitConfig;
use crate::model::Source;
use crate::sentence::{SentenceFilter, DEFAULT_DENY_PATTERN};

/// Serial port value that hands the serial slot to Bluetooth discovery.
pub const AUTO_SERIAL_PORT: &str = "AUTO";

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("Configuration not found: {0}")]
    NotFound(String),
    /// Failed to read configuration.
    #[error("Read error: {0}")]
    ReadError(String),
    /// Failed to write configuration.
    #[error("Write error: {0}")]
    WriteError(String),
    /// Configuration data is invalid.
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

// ============================================================================
// Listener descriptors
// ============================================================================

/// Transport family; at most one listener runs per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Serial,
    Udp,
    Tcp,
}

impl TransportKind {
    pub const ALL: [TransportKind; 3] = [TransportKind::Serial, TransportKind::Udp, TransportKind::Tcp];
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Serial => "serial",
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
        };
        f.write_str(name)
    }
}

/// Whether a network transport listens locally or reaches out to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Server,
    Client,
}

impl FromStr for Role {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "server" => Ok(Role::Server),
            "client" => Ok(Role::Client),
            other => Err(ConfigError::InvalidData(format!("unknown mode '{other}'"))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Server => "server",
            Role::Client => "client",
        })
    }
}

/// Where a listener gets its bytes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Endpoint {
    /// Local serial device, or [`AUTO_SERIAL_PORT`] for Bluetooth discovery.
    Device { path: String, baud_rate: u32 },
    /// Local address to bind (UDP/TCP server).
    Bind { addr: SocketAddr },
    /// Local broadcast port, optionally restricted to one sender (UDP client).
    Broadcast { port: u16, sender: Option<IpAddr> },
    /// Remote peer to connect to (TCP client).
    Connect { host: String, port: u16 },
}

/// Desired state of one listener slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerDescriptor {
    pub kind: TransportKind,
    pub role: Role,
    pub endpoint: Endpoint,
    pub enabled: bool,
}

impl ListenerDescriptor {
    /// Whether this descriptor defers to Bluetooth discovery.
    pub fn is_auto_serial(&self) -> bool {
        matches!(&self.endpoint, Endpoint::Device { path, .. } if path.eq_ignore_ascii_case(AUTO_SERIAL_PORT))
    }

    /// Source tag attached to sentences read by this listener.
    pub fn source(&self) -> Source {
        match (self.kind, self.role) {
            (TransportKind::Serial, _) => Source::Serial,
            (TransportKind::Udp, Role::Server) => Source::Udp,
            (TransportKind::Udp, Role::Client) => Source::UdpClient,
            (TransportKind::Tcp, Role::Server) => Source::Tcp,
            (TransportKind::Tcp, Role::Client) => Source::TcpClient,
        }
    }
}

impl fmt::Display for ListenerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.endpoint {
            Endpoint::Device { path, baud_rate } => write!(f, "{} {path} @ {baud_rate} bps", self.kind),
            Endpoint::Bind { addr } => write!(f, "{} {} on {addr}", self.kind, self.role),
            Endpoint::Broadcast { port, sender: Some(ip) } => {
                write!(f, "{} {} on port {port} from {ip}", self.kind, self.role)
            }
            Endpoint::Broadcast { port, sender: None } => {
                write!(f, "{} {} on port {port}", self.kind, self.role)
            }
            Endpoint::Connect { host, port } => write!(f, "{} {} to {host}:{port}", self.kind, self.role),
        }
    }
}

// ============================================================================
// Configuration types
// ============================================================================

/// Serial transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialSettings {
    pub enabled: bool,
    /// Device path or `AUTO`.
    pub port: String,
    pub baud_rate: u32,
}

/// UDP or TCP transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSettings {
    pub enabled: bool,
    pub mode: Role,
    pub bind_ip: IpAddr,
    pub port: u16,
    /// Peer address in client mode (may be empty).
    pub target_ip: String,
    pub target_port: u16,
}

/// Sentence filter policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterSettings {
    /// Deny pattern; empty disables the denylist.
    pub deny_pattern: String,
    pub require_checksum: bool,
}

/// Emission path tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmissionSettings {
    /// Live emissions per second; zero disables the limit.
    pub max_per_second: u32,
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

/// Complete relay configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    pub debug: bool,
    pub serial: SerialSettings,
    pub udp: NetworkSettings,
    pub tcp: NetworkSettings,
    pub filter: FilterSettings,
    pub emission: EmissionSettings,
    pub bluetooth_scan_interval_secs: u64,
    /// WebSocket push server port.
    pub ws_port: u16,
    /// Status/history HTTP port.
    pub http_port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            debug: false,
            serial: SerialSettings {
                enabled: true,
                port: default_serial_port().to_string(),
                baud_rate: 4800,
            },
            udp: NetworkSettings {
                enabled: true,
                mode: Role::Server,
                bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                port: 5005,
                target_ip: String::new(),
                target_port: 50110,
            },
            tcp: NetworkSettings {
                enabled: true,
                mode: Role::Server,
                bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                port: 5006,
                target_ip: String::new(),
                target_port: 50110,
            },
            filter: FilterSettings {
                deny_pattern: DEFAULT_DENY_PATTERN.to_string(),
                require_checksum: true,
            },
            emission: EmissionSettings {
                max_per_second: 100,
                failure_threshold: 5,
                cooldown_secs: 30,
            },
            bluetooth_scan_interval_secs: 60,
            ws_port: 5000,
            http_port: 5001,
        }
    }
}

fn default_serial_port() -> &'static str {
    if cfg!(target_os = "linux") {
        AUTO_SERIAL_PORT
    } else if cfg!(windows) {
        "COM3"
    } else {
        "/dev/ttyUSB0"
    }
}

impl RelayConfig {
    /// Parse a configuration from key-value pairs.
    ///
    /// Missing keys take their default; invalid values keep the value from
    /// `previous`. Returns the configuration and one warning per fallback.
    pub fn from_key_values(values: &BTreeMap<String, String>, previous: &RelayConfig) -> (Self, Vec<String>) {
        let defaults = RelayConfig::default();
        let mut reader = KeyReader {
            values,
            warnings: Vec::new(),
        };

        let serial = SerialSettings {
            enabled: reader.get("ENABLE_SERIAL", defaults.serial.enabled, previous.serial.enabled, parse_bool),
            port: reader.string("SERIAL_PORT", &defaults.serial.port),
            baud_rate: reader.get("SERIAL_BAUDRATE", defaults.serial.baud_rate, previous.serial.baud_rate, parse_nonzero),
        };

        let udp = reader.network("UDP", &defaults.udp, &previous.udp);
        let tcp = reader.network("TCP", &defaults.tcp, &previous.tcp);

        let deny_pattern = reader.string("NMEA_DENY_PATTERN", &defaults.filter.deny_pattern);
        let deny_pattern = if SentenceFilter::new(&deny_pattern, true).is_ok() {
            deny_pattern
        } else {
            reader
                .warnings
                .push(format!("NMEA_DENY_PATTERN: invalid pattern '{deny_pattern}', keeping previous"));
            previous.filter.deny_pattern.clone()
        };
        let filter = FilterSettings {
            deny_pattern,
            require_checksum: reader.get(
                "NMEA_REQUIRE_CHECKSUM",
                defaults.filter.require_checksum,
                previous.filter.require_checksum,
                parse_bool,
            ),
        };

        let emission = EmissionSettings {
            max_per_second: reader.get(
                "EMIT_MAX_PER_SECOND",
                defaults.emission.max_per_second,
                previous.emission.max_per_second,
                parse_from_str,
            ),
            failure_threshold: reader.get(
                "BREAKER_FAILURE_THRESHOLD",
                defaults.emission.failure_threshold,
                previous.emission.failure_threshold,
                parse_nonzero,
            ),
            cooldown_secs: reader.get(
                "BREAKER_COOLDOWN_SECS",
                defaults.emission.cooldown_secs,
                previous.emission.cooldown_secs,
                parse_from_str,
            ),
        };

        let config = RelayConfig {
            debug: reader.get("DEBUG", defaults.debug, previous.debug, parse_bool),
            serial,
            udp,
            tcp,
            filter,
            emission,
            bluetooth_scan_interval_secs: reader.get(
                "BLUETOOTH_SCAN_INTERVAL_SECS",
                defaults.bluetooth_scan_interval_secs,
                previous.bluetooth_scan_interval_secs,
                parse_nonzero,
            ),
            ws_port: reader.get("WS_PORT", defaults.ws_port, previous.ws_port, parse_nonzero),
            http_port: reader.get("HTTP_PORT", defaults.http_port, previous.http_port, parse_nonzero),
        };

        (config, reader.warnings)
    }

    /// Serialize to key-value pairs in the file format.
    pub fn to_key_values(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        let mut put = |key: &str, value: String| {
            out.insert(key.to_string(), value);
        };

        put("DEBUG", self.debug.to_string());
        put("ENABLE_SERIAL", self.serial.enabled.to_string());
        put("SERIAL_PORT", self.serial.port.clone());
        put("SERIAL_BAUDRATE", self.serial.baud_rate.to_string());
        for (prefix, net) in [("UDP", &self.udp), ("TCP", &self.tcp)] {
            put(&format!("ENABLE_{prefix}"), net.enabled.to_string());
            put(&format!("{prefix}_MODE"), net.mode.to_string());
            put(&format!("{prefix}_IP"), net.bind_ip.to_string());
            put(&format!("{prefix}_PORT"), net.port.to_string());
            put(&format!("{prefix}_TARGET_IP"), net.target_ip.clone());
            put(&format!("{prefix}_TARGET_PORT"), net.target_port.to_string());
        }
        put("NMEA_DENY_PATTERN", self.filter.deny_pattern.clone());
        put("NMEA_REQUIRE_CHECKSUM", self.filter.require_checksum.to_string());
        put("EMIT_MAX_PER_SECOND", self.emission.max_per_second.to_string());
        put("BREAKER_FAILURE_THRESHOLD", self.emission.failure_threshold.to_string());
        put("BREAKER_COOLDOWN_SECS", self.emission.cooldown_secs.to_string());
        put(
            "BLUETOOTH_SCAN_INTERVAL_SECS",
            self.bluetooth_scan_interval_secs.to_string(),
        );
        put("WS_PORT", self.ws_port.to_string());
        put("HTTP_PORT", self.http_port.to_string());
        out
    }

    /// Desired listener for each transport kind.
    pub fn descriptors(&self) -> Vec<ListenerDescriptor> {
        TransportKind::ALL.iter().map(|kind| self.descriptor(*kind)).collect()
    }

    /// Descriptor for one transport kind.
    pub fn descriptor(&self, kind: TransportKind) -> ListenerDescriptor {
        match kind {
            TransportKind::Serial => ListenerDescriptor {
                kind: TransportKind::Serial,
                role: Role::Client,
                endpoint: Endpoint::Device {
                    path: self.serial.port.clone(),
                    baud_rate: self.serial.baud_rate,
                },
                enabled: self.serial.enabled && !self.serial.port.is_empty(),
            },
            TransportKind::Udp => network_descriptor(TransportKind::Udp, &self.udp),
            TransportKind::Tcp => network_descriptor(TransportKind::Tcp, &self.tcp),
        }
    }

    pub fn is_enabled(&self, kind: TransportKind) -> bool {
        match kind {
            TransportKind::Serial => self.serial.enabled,
            TransportKind::Udp => self.udp.enabled,
            TransportKind::Tcp => self.tcp.enabled,
        }
    }

    /// Build the sentence filter, falling back to the default policy.
    pub fn sentence_filter(&self) -> SentenceFilter {
        SentenceFilter::new(&self.filter.deny_pattern, self.filter.require_checksum)
            .unwrap_or_default()
    }

    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.emission.failure_threshold.max(1),
            cooldown: Duration::from_secs(self.emission.cooldown_secs),
            ..CircuitConfig::default()
        }
    }

    pub fn bluetooth_scan_interval(&self) -> Duration {
        Duration::from_secs(self.bluetooth_scan_interval_secs)
    }
}

fn network_descriptor(kind: TransportKind, net: &NetworkSettings) -> ListenerDescriptor {
    let endpoint = match (kind, net.mode) {
        (_, Role::Server) => Endpoint::Bind {
            addr: SocketAddr::new(net.bind_ip, net.port),
        },
        (TransportKind::Udp, Role::Client) => Endpoint::Broadcast {
            port: net.target_port,
            sender: net.target_ip.parse().ok().filter(|ip: &IpAddr| !ip.is_unspecified()),
        },
        (_, Role::Client) => Endpoint::Connect {
            host: net.target_ip.clone(),
            port: net.target_port,
        },
    };
    let enabled = match &endpoint {
        Endpoint::Connect { host, .. } => net.enabled && !host.is_empty(),
        _ => net.enabled,
    };
    ListenerDescriptor {
        kind,
        role: net.mode,
        endpoint,
        enabled,
    }
}

/// Typed lookups over the raw pairs, collecting fallback warnings.
struct KeyReader<'a> {
    values: &'a BTreeMap<String, String>,
    warnings: Vec<String>,
}

impl KeyReader<'_> {
    fn get<T: Clone>(
        &mut self,
        key: &str,
        default: T,
        previous: T,
        parse: impl Fn(&str) -> Option<T>,
    ) -> T {
        match self.values.get(key) {
            None => default,
            Some(raw) => match parse(raw.trim()) {
                Some(value) => value,
                None => {
                    self.warnings
                        .push(format!("{key}: invalid value '{raw}', keeping previous"));
                    previous
                }
            },
        }
    }

    fn string(&mut self, key: &str, default: &str) -> String {
        self.values
            .get(key)
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|| default.to_string())
    }

    fn network(&mut self, prefix: &str, defaults: &NetworkSettings, previous: &NetworkSettings) -> NetworkSettings {
        NetworkSettings {
            enabled: self.get(&format!("ENABLE_{prefix}"), defaults.enabled, previous.enabled, parse_bool),
            mode: self.get(&format!("{prefix}_MODE"), defaults.mode, previous.mode, |s| s.parse().ok()),
            bind_ip: self.get(&format!("{prefix}_IP"), defaults.bind_ip, previous.bind_ip, parse_from_str),
            port: self.get(&format!("{prefix}_PORT"), defaults.port, previous.port, parse_nonzero),
            target_ip: self.string(&format!("{prefix}_TARGET_IP"), &defaults.target_ip),
            target_port: self.get(
                &format!("{prefix}_TARGET_PORT"),
                defaults.target_port,
                previous.target_port,
                parse_nonzero,
            ),
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_from_str<T: FromStr>(s: &str) -> Option<T> {
    s.parse().ok()
}

fn parse_nonzero<T: FromStr + Default + PartialEq>(s: &str) -> Option<T> {
    s.parse().ok().filter(|v: &T| *v != T::default())
}

// ============================================================================
// Key-value file format
// ============================================================================

/// Parse `KEY=VALUE` lines.
///
/// Blank lines and `#` comments are skipped, an optional `export ` prefix is
/// accepted and matching single or double quotes around a value are removed.
/// Lines without `=` are ignored.
pub fn parse_key_values(text: &str) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        values.insert(key.to_string(), unquote(value.trim()).to_string());
    }
    values
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Render pairs in the file format.
pub fn render_key_values(values: &BTreeMap<String, String>) -> String {
    let mut out = String::from("# NMEA relay configuration\n");
    for (key, value) in values {
        if value.contains(char::is_whitespace) || value.contains('#') {
            out.push_str(&format!("{key}=\"{value}\"\n"));
        } else {
            out.push_str(&format!("{key}={value}\n"));
        }
    }
    out
}

// ============================================================================
// Storage
// ============================================================================

/// Persisted configuration source.
///
/// All methods are synchronous; the watcher calls them from its polling
/// task.
pub trait ConfigStorage: Send + Sync {
    /// Load the raw key-value pairs.
    fn load(&self) -> Result<BTreeMap<String, String>, ConfigError>;

    /// Replace the stored key-value pairs.
    fn save(&self, values: &BTreeMap<String, String>) -> Result<(), ConfigError>;

    /// Modification time used for change detection.
    fn modified(&self) -> Result<SystemTime, ConfigError>;
}

/// `.env`-style file storage.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStorage for FileConfigStore {
    fn load(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(parse_key_values(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ConfigError::NotFound(self.path.display().to_string()))
            }
            Err(e) => Err(ConfigError::ReadError(format!("{}: {e}", self.path.display()))),
        }
    }

    fn save(&self, values: &BTreeMap<String, String>) -> Result<(), ConfigError> {
        std::fs::write(&self.path, render_key_values(values))
            .map_err(|e| ConfigError::WriteError(format!("{}: {e}", self.path.display())))
    }

    fn modified(&self) -> Result<SystemTime, ConfigError> {
        let meta = std::fs::metadata(&self.path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::NotFound(self.path.display().to_string()),
            _ => ConfigError::ReadError(e.to_string()),
        })?;
        meta.modified()
            .map_err(|e| ConfigError::ReadError(e.to_string()))
    }
}

/// In-memory storage; every save advances the modification time.
#[derive(Debug)]
pub struct MemoryConfigStore {
    inner: RwLock<(BTreeMap<String, String>, SystemTime)>,
}

impl MemoryConfigStore {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self {
            inner: RwLock::new((values, SystemTime::UNIX_EPOCH)),
        }
    }
}

impl Default for MemoryConfigStore {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}

impl ConfigStorage for MemoryConfigStore {
    fn load(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| ConfigError::ReadError("lock poisoned".to_string()))?;
        Ok(inner.0.clone())
    }

    fn save(&self, values: &BTreeMap<String, String>) -> Result<(), ConfigError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| ConfigError::WriteError("lock poisoned".to_string()))?;
        inner.0 = values.clone();
        inner.1 += Duration::from_secs(1);
        Ok(())
    }

    fn modified(&self) -> Result<SystemTime, ConfigError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| ConfigError::ReadError("lock poisoned".to_string()))?;
        Ok(inner.1)
    }
}

/// Load a configuration from storage, keeping `previous` values on errors.
pub fn load_config<S: ConfigStorage + ?Sized>(
    storage: &S,
    previous: &RelayConfig,
) -> Result<(RelayConfig, Vec<String>), ConfigError> {
    let values = storage.load()?;
    Ok(RelayConfig::from_key_values(&values, previous))
}
