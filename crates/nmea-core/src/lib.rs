//! # nmea-core
//!
//! Core NMEA relay model and policies.
//!
//! This crate provides:
//! - Data model types (Source, RawFrame, Sentence)
//! - Sentence cleaning, checksum validation and the deny filter
//! - Bounded history of recent sentences
//! - Circuit breaker and rate limiter for the emission path
//! - Relay configuration and its key-value storage
//!
//! This crate is intentionally runtime-agnostic and contains no async code,
//! so the same policies can back the Linux relay and embedded builds.

pub mod circuit;
pub mod config;
pub mod history;
pub mod model;
pub mod rate_limit;
pub mod sentence;

pub use circuit::{CircuitBreaker, CircuitConfig, CircuitSnapshot, CircuitState};
pub use config::{
    ConfigError, ConfigStorage, Endpoint, FileConfigStore, ListenerDescriptor, MemoryConfigStore,
    RelayConfig, Role, TransportKind, AUTO_SERIAL_PORT,
};
pub use history::{HistoryBuffer, HistoryEntry, DEFAULT_HISTORY_CAPACITY};
pub use model::{RawFrame, Sentence, Source};
pub use rate_limit::RateLimiter;
pub use sentence::{clean, is_gps_sentence, validate_checksum, Rejection, SentenceFilter};
