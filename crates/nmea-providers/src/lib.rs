//! # nmea-providers
//!
//! Sentence sources for the NMEA relay.
//!
//! This crate provides:
//! - The listener framework: stop signals, line framing, the [`Transport`]
//!   trait and the [`Listener`] task handle
//! - Serial, UDP (server and client) and TCP (server and client) transports
//! - Bluetooth GPS discovery, which binds a device and feeds a serial
//!   listener from it
//!
//! Transports only frame bytes into lines; cleaning and validation happen
//! behind the [`SentenceSink`] they are given.

pub mod bluetooth;
pub mod error;
pub mod framing;
pub mod listener;
pub mod stop;
pub mod transport;

pub use bluetooth::{BluetoothDiscovery, BluetoothHost, DiscoveryState, DiscoveryTiming, ShellBluetoothHost};
pub use error::{BluetoothError, ListenerError};
pub use framing::LineFramer;
pub use listener::{Listener, ListenerContext, ListenerExit, SentenceSink, Transport, JOIN_TIMEOUT};
pub use stop::{Bounded, StopSignal, READ_TIMEOUT};
pub use transport::{
    Backoff, DeviceOpener, DeviceStream, SerialTransport, TcpClientTransport, TcpServerTransport, TokioSerialOpener,
    UdpClientTransport, UdpServerTransport,
};
