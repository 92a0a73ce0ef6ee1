//! JSON codec for the push channel.
//!
//! Events travel as WebSocket text frames. This module provides encoding and
//! decoding utilities for the protocol messages.

use crate::messages::{ClientRequest, PushEvent};
use thiserror::Error;

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// JSON serialization failed.
    #[error("Failed to serialize message: {0}")]
    SerializeError(#[from] serde_json::Error),

    /// Received binary frame instead of text.
    #[error("Expected text frame, received binary")]
    BinaryFrame,
}

/// Encode a push event to a JSON string for WebSocket transmission.
pub fn encode_push_event(event: &PushEvent) -> Result<String, CodecError> {
    serde_json::to_string(event).map_err(CodecError::from)
}

/// Decode a push event (used by subscribers and tests).
pub fn decode_push_event(text: &str) -> Result<PushEvent, CodecError> {
    serde_json::from_str(text).map_err(CodecError::from)
}

/// Decode a subscriber request received over WebSocket.
pub fn decode_client_request(text: &str) -> Result<ClientRequest, CodecError> {
    serde_json::from_str(text).map_err(CodecError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::WebSentence;

    #[test]
    fn test_encode_bare_sentence() {
        let event = PushEvent::NmeaData("$GPGGA,1*00".to_string());
        let json = encode_push_event(&event).unwrap();

        assert_eq!(json, r#"{"event":"nmea_data","data":"$GPGGA,1*00"}"#);
    }

    #[test]
    fn test_encode_web_sentence() {
        let event = PushEvent::NmeaDataWeb(WebSentence {
            source: "TCP".to_string(),
            message: "!AIVDM,1*00".to_string(),
            timestamp: "10:00:00".to_string(),
        });
        let json = encode_push_event(&event).unwrap();

        assert!(json.contains("\"event\":\"nmea_data_web\""));
        assert!(json.contains("\"source\":\"TCP\""));
        assert!(json.contains("\"timestamp\":\"10:00:00\""));
        assert_eq!(decode_push_event(&json).unwrap(), event);
    }

    #[test]
    fn test_decode_unknown_request() {
        assert!(decode_client_request(r#"{"event":"subscribe"}"#).is_err());
        assert!(decode_client_request("not json").is_err());
    }
}
