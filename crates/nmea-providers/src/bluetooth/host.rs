//! Bluetooth host capability.
//!
//! The discovery automaton only talks to [`BluetoothHost`]. The Linux
//! implementation drives the BlueZ command line tools (`hciconfig`,
//! `hcitool`, `sdptool`, `rfcomm`); every command runs with its own timeout
//! and is killed if it overruns.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info};

use crate::error::BluetoothError;

/// A nearby device found by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BluetoothCandidate {
    pub mac: String,
    pub name: String,
}

/// Host-side Bluetooth operations.
pub trait BluetoothHost: Send + Sync + 'static {
    /// Whether an adapter is present and up.
    fn available(&self) -> impl Future<Output = bool> + Send;

    /// Enumerate nearby devices.
    fn scan(&self) -> impl Future<Output = Result<Vec<BluetoothCandidate>, BluetoothError>> + Send;

    /// Look up the serial port profile channel of `mac`.
    fn find_spp_channel(&self, mac: &str) -> impl Future<Output = Result<Option<u8>, BluetoothError>> + Send;

    /// Bind a virtual serial device to `mac` on `channel`.
    fn bind(&self, mac: &str, channel: u8) -> impl Future<Output = Result<PathBuf, BluetoothError>> + Send;

    /// Release a binding created by [`bind`](BluetoothHost::bind).
    fn release(&self, path: &Path) -> impl Future<Output = Result<(), BluetoothError>> + Send;

    /// A device node left bound from an earlier run, if any.
    fn existing_binding(&self) -> Option<PathBuf>;

    /// Whether `path` still exists as a character device.
    fn is_healthy(&self, path: &Path) -> bool;
}

const SHORT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const SCAN_TIMEOUT: Duration = Duration::from_secs(20);
const BROWSE_TIMEOUT: Duration = Duration::from_secs(10);
const BIND_TIMEOUT: Duration = Duration::from_secs(10);
const DEVICE_WAIT_ATTEMPTS: u32 = 10;
const DEVICE_WAIT_STEP: Duration = Duration::from_millis(500);
const DEVICE_SETTLE: Duration = Duration::from_secs(2);

/// Longest [`ShellBluetoothHost::bind`] can take when every step runs to its limit.
pub(crate) fn worst_case_bind() -> Duration {
    SHORT_COMMAND_TIMEOUT + BIND_TIMEOUT + DEVICE_WAIT_STEP * DEVICE_WAIT_ATTEMPTS + DEVICE_SETTLE
}

/// BlueZ command line implementation.
#[derive(Debug, Clone)]
pub struct ShellBluetoothHost {
    adapter: String,
    rfcomm_index: u8,
    use_sudo: bool,
}

impl ShellBluetoothHost {
    pub fn new(adapter: impl Into<String>, rfcomm_index: u8, use_sudo: bool) -> Self {
        Self {
            adapter: adapter.into(),
            rfcomm_index,
            use_sudo,
        }
    }

    /// Device node for the configured rfcomm index.
    pub fn device_path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/rfcomm{}", self.rfcomm_index))
    }

    async fn run(&self, privileged: bool, args: &[&str], limit: Duration) -> Result<String, BluetoothError> {
        let mut command = if privileged && self.use_sudo {
            let mut c = Command::new("sudo");
            c.arg("-n").args(args);
            c
        } else {
            let mut c = Command::new(args[0]);
            c.args(&args[1..]);
            c
        };
        command.kill_on_drop(true);

        let label = args.join(" ");
        let output = tokio::time::timeout(limit, command.output())
            .await
            .map_err(|_| BluetoothError::Timeout {
                command: label.clone(),
                secs: limit.as_secs(),
            })??;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(BluetoothError::CommandFailed {
                command: label,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

impl Default for ShellBluetoothHost {
    fn default() -> Self {
        Self::new("hci0", 0, true)
    }
}

impl BluetoothHost for ShellBluetoothHost {
    async fn available(&self) -> bool {
        if let Err(e) = self.run(false, &["hciconfig"], SHORT_COMMAND_TIMEOUT).await {
            debug!("hciconfig unavailable: {}", e);
            return false;
        }
        let adapter = self.adapter.as_str();
        if self.run(false, &["hciconfig", adapter, "up"], SHORT_COMMAND_TIMEOUT).await.is_ok() {
            return true;
        }
        match self.run(true, &["hciconfig", adapter, "up"], SHORT_COMMAND_TIMEOUT).await {
            Ok(_) => true,
            Err(e) => {
                debug!("Could not bring {} up: {}", adapter, e);
                false
            }
        }
    }

    async fn scan(&self) -> Result<Vec<BluetoothCandidate>, BluetoothError> {
        info!("Scanning for Bluetooth devices");
        let output = self.run(false, &["hcitool", "scan"], SCAN_TIMEOUT).await?;
        Ok(parse_scan_output(&output))
    }

    async fn find_spp_channel(&self, mac: &str) -> Result<Option<u8>, BluetoothError> {
        let output = self.run(false, &["sdptool", "browse", mac], BROWSE_TIMEOUT).await?;
        Ok(parse_spp_channel(&output))
    }

    async fn bind(&self, mac: &str, channel: u8) -> Result<PathBuf, BluetoothError> {
        let path = self.device_path();
        // A stale binding makes `rfcomm bind` fail.
        let _ = self.release(&path).await;

        let index = self.rfcomm_index.to_string();
        let channel = channel.to_string();
        self.run(true, &["rfcomm", "bind", &index, mac, &channel], BIND_TIMEOUT)
            .await?;

        for _ in 0..DEVICE_WAIT_ATTEMPTS {
            if path.exists() {
                tokio::time::sleep(DEVICE_SETTLE).await;
                info!("Bound {} to {}", mac, path.display());
                return Ok(path);
            }
            tokio::time::sleep(DEVICE_WAIT_STEP).await;
        }
        Err(BluetoothError::BindTimeout(path))
    }

    async fn release(&self, _path: &Path) -> Result<(), BluetoothError> {
        let index = self.rfcomm_index.to_string();
        self.run(true, &["rfcomm", "release", &index], SHORT_COMMAND_TIMEOUT)
            .await
            .map(|_| ())
    }

    fn existing_binding(&self) -> Option<PathBuf> {
        let path = self.device_path();
        path.exists().then_some(path)
    }

    fn is_healthy(&self, path: &Path) -> bool {
        is_character_device(path)
    }
}

#[cfg(unix)]
fn is_character_device(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    std::fs::metadata(path)
        .map(|meta| meta.file_type().is_char_device())
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_character_device(path: &Path) -> bool {
    path.exists()
}

/// Parse `hcitool scan` output (`\tMAC\tName` lines).
pub fn parse_scan_output(output: &str) -> Vec<BluetoothCandidate> {
    output
        .lines()
        .filter_map(|line| {
            let (mac, name) = line.trim().split_once('\t')?;
            let mac = mac.trim();
            if !is_mac(mac) {
                return None;
            }
            Some(BluetoothCandidate {
                mac: mac.to_string(),
                name: name.trim().to_string(),
            })
        })
        .collect()
}

fn is_mac(s: &str) -> bool {
    let parts: Vec<&str> = s.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Find the RFCOMM channel of the serial port service in `sdptool browse`
/// output.
pub fn parse_spp_channel(output: &str) -> Option<u8> {
    let mut in_serial_service = false;
    for line in output.lines() {
        if line.contains("Serial Port") || line.contains("SPP") {
            in_serial_service = true;
        } else if in_serial_service && line.trim().is_empty() {
            in_serial_service = false;
        } else if in_serial_service {
            if let Some((_, channel)) = line.split_once("Channel:") {
                if let Ok(channel) = channel.trim().parse() {
                    return Some(channel);
                }
            }
        }
    }
    None
}
