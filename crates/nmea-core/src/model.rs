//! NMEA relay data model types.
//!
//! These types describe what flows through the relay:
//! - Raw frames as read by a transport
//! - Validated sentences handed to the emission path
//! - Source tags identifying which transport produced a sentence

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Transport that produced a sentence.
///
/// The display form is the tag used in history entries and push events
/// (e.g. `[12:00:01][SERIAL] $GPGGA,...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    #[serde(rename = "SERIAL")]
    Serial,
    #[serde(rename = "UDP")]
    Udp,
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP-CLIENT")]
    UdpClient,
    #[serde(rename = "TCP-CLIENT")]
    TcpClient,
    #[serde(rename = "TEST")]
    Test,
}

impl Source {
    /// The tag string for this source.
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Serial => "SERIAL",
            Source::Udp => "UDP",
            Source::Tcp => "TCP",
            Source::UdpClient => "UDP-CLIENT",
            Source::TcpClient => "TCP-CLIENT",
            Source::Test => "TEST",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bytes read by a transport, before cleaning and validation.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub source: Source,
    pub payload: Vec<u8>,
    pub arrived_at: SystemTime,
}

impl RawFrame {
    pub fn new(source: Source, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            source,
            payload: payload.into(),
            arrived_at: SystemTime::now(),
        }
    }

    /// Decode the payload, dropping bytes that are not valid UTF-8.
    ///
    /// Returns the text and whether any bytes had to be dropped.
    pub fn decode(&self) -> (String, bool) {
        match std::str::from_utf8(&self.payload) {
            Ok(text) => (text.to_string(), false),
            Err(_) => {
                let text = String::from_utf8_lossy(&self.payload)
                    .chars()
                    .filter(|c| *c != char::REPLACEMENT_CHARACTER)
                    .collect();
                (text, true)
            }
        }
    }
}

/// A cleaned, validated NMEA 0183 / AIS sentence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sentence {
    /// Sentence text, starting with `$` or `!`, without line terminator.
    pub text: String,
    pub source: Source,
    pub timestamp: DateTime<Local>,
}

impl Sentence {
    pub fn new(source: Source, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source,
            timestamp: Local::now(),
        }
    }

    /// Two-letter talker id (`GP`, `GN`, `AI`, ...), if present.
    pub fn talker(&self) -> Option<&str> {
        self.text.get(1..3)
    }

    /// Sentence formatter following the talker id (`GGA`, `VDM`, ...).
    pub fn sentence_id(&self) -> Option<&str> {
        let body = self.text.get(3..)?;
        let end = body.find([',', '*']).unwrap_or(body.len());
        Some(&body[..end])
    }
}
