//! Error types for listeners and Bluetooth discovery.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that end a listener task.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// A device could not be opened.
    #[error("Failed to open {path}: {reason}")]
    Open { path: String, reason: String },

    /// A local socket could not be bound.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The device or peer went away.
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// Read errors kept coming without a single good line in between.
    #[error("Too many consecutive errors ({0})")]
    TooManyErrors(u32),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The listener task panicked or was cancelled.
    #[error("Listener task failed: {0}")]
    Panicked(String),
}

/// Errors raised by the Bluetooth host capability.
#[derive(Debug, Error)]
pub enum BluetoothError {
    /// No usable Bluetooth adapter or tooling on this host.
    #[error("Bluetooth not available")]
    Unavailable,

    /// A host command exited with a failure status.
    #[error("Command '{command}' failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    /// A host command did not finish in time.
    #[error("Command '{command}' timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    /// The bound device node never appeared.
    #[error("Device {0} not created after bind")]
    BindTimeout(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
