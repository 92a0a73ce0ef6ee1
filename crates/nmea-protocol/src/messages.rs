//! Push-channel message types.
//!
//! This module defines the events the relay pushes to subscribers and the
//! snapshots it exposes to the dashboard:
//! - Relay → Subscriber: `nmea_data`, `nmea_data_web`, `nmea_history`,
//!   `status`, `history`
//! - Subscriber → Relay: `request_status`, `request_history`
//! - Queries: status snapshot, history page
//!
//! Events are serialized as JSON objects `{"event": ..., "data": ...}` over
//! WebSocket text frames.

use serde::{Deserialize, Serialize};

use nmea_core::{CircuitSnapshot, HistoryEntry, Role, Sentence};

/// Event name for bare sentence strings.
pub const NMEA_DATA_EVENT: &str = "nmea_data";

/// Event name for sentences with source and time.
pub const NMEA_DATA_WEB_EVENT: &str = "nmea_data_web";

/// Event name for the history sent to a new subscriber.
pub const NMEA_HISTORY_EVENT: &str = "nmea_history";

// ============================================================================
// Relay → Subscriber
// ============================================================================

/// Event pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum PushEvent {
    /// Bare sentence text, for simple subscribers such as chart plugins.
    #[serde(rename = "nmea_data")]
    NmeaData(String),

    /// Sentence with its source tag and wall-clock time.
    #[serde(rename = "nmea_data_web")]
    NmeaDataWeb(WebSentence),

    /// Recent formatted history lines, sent once on connect.
    #[serde(rename = "nmea_history")]
    NmeaHistory(Vec<String>),

    /// Status snapshot, sent in reply to `request_status`.
    #[serde(rename = "status")]
    Status(StatusSnapshot),

    /// History page, sent in reply to `request_history`.
    #[serde(rename = "history")]
    History(HistoryResponse),
}

impl PushEvent {
    /// Event name on the push channel.
    pub fn name(&self) -> &'static str {
        match self {
            PushEvent::NmeaData(_) => NMEA_DATA_EVENT,
            PushEvent::NmeaDataWeb(_) => NMEA_DATA_WEB_EVENT,
            PushEvent::NmeaHistory(_) => NMEA_HISTORY_EVENT,
            PushEvent::Status(_) => "status",
            PushEvent::History(_) => "history",
        }
    }

    /// Both live events for one sentence, bare form first.
    pub fn for_sentence(sentence: &Sentence) -> [PushEvent; 2] {
        [
            PushEvent::NmeaData(sentence.text.clone()),
            PushEvent::NmeaDataWeb(WebSentence::from(sentence)),
        ]
    }
}

/// Sentence payload for richer subscribers.
///
/// # Example
/// ```json
/// { "source": "SERIAL", "message": "$GPGGA,...*47", "timestamp": "12:35:19" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSentence {
    pub source: String,
    pub message: String,
    /// Local time as `HH:MM:SS`.
    pub timestamp: String,
}

impl From<&Sentence> for WebSentence {
    fn from(sentence: &Sentence) -> Self {
        Self {
            source: sentence.source.to_string(),
            message: sentence.text.clone(),
            timestamp: sentence.timestamp.format("%H:%M:%S").to_string(),
        }
    }
}

impl From<&HistoryEntry> for WebSentence {
    fn from(entry: &HistoryEntry) -> Self {
        Self {
            source: entry.source.to_string(),
            message: entry.text.clone(),
            timestamp: entry.clock(),
        }
    }
}

// ============================================================================
// Subscriber → Relay
// ============================================================================

/// Request sent by a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Ask for a status snapshot.
    RequestStatus,
    /// Ask for the most recent history entries.
    RequestHistory {
        #[serde(default = "default_history_page")]
        count: usize,
    },
}

fn default_history_page() -> usize {
    20
}

// ============================================================================
// Queries
// ============================================================================

/// Connection status exposed to the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub udp_active: bool,
    pub tcp_active: bool,
    pub serial_connected: bool,
    /// Number of active transports among the three above.
    pub connections_active: usize,
    pub udp_enabled: bool,
    pub tcp_enabled: bool,
    pub serial_enabled: bool,
    pub udp_mode: Role,
    pub tcp_mode: Role,
    /// Local time of the snapshot as `HH:MM:SS`.
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub statistics: Option<RelayStatistics>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub circuit: Option<CircuitSnapshot>,
}

/// Counters of the ingest and emission paths.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatistics {
    /// Sentences that passed validation.
    pub accepted: u64,
    pub rejected_empty: u64,
    pub rejected_not_nmea: u64,
    pub rejected_denied: u64,
    pub rejected_checksum: u64,
    /// Publish attempts that reached the push channel successfully.
    pub published: u64,
    /// Sentences kept in history but not pushed because of the rate limit.
    pub rate_limited: u64,
    /// Sentences not pushed because the circuit breaker was open.
    pub breaker_rejected: u64,
    pub publish_failures: u64,
    /// Accepted sentences per second over the last window.
    pub sentence_rate: f64,
    /// Seconds since the relay started.
    pub uptime: u64,
}

/// History page returned to the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryResponse {
    /// Formatted entries, most recent last.
    pub history: Vec<String>,
    /// Total entries currently held.
    pub count: usize,
}

impl HistoryResponse {
    pub fn new(entries: &[HistoryEntry], total: usize) -> Self {
        Self {
            history: format_entries(entries),
            count: total,
        }
    }
}

/// `[HH:MM:SS][SOURCE] text` lines, in order.
pub fn format_entries(entries: &[HistoryEntry]) -> Vec<String> {
    entries.iter().map(ToString::to_string).collect()
}
