//! # Media Stream Wire Envelope
//!
//! Typed codec for the telephony provider's media stream protocol. Every
//! transport message is a JSON object tagged by an `event` field; this module
//! parses the four events the relay consumes and serializes the one message
//! it produces (outbound media injection).
//!
//! Parsing is strict: an unknown event tag, a non-numeric media timestamp or
//! an undecodable payload is an error, and the ingest side treats any such
//! error as fatal for the connection rather than guessing at the stream
//! state.

use crate::audio::Track;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a transport message failed to parse.
#[derive(Debug)]
pub enum EnvelopeError {
    /// Not valid JSON, unknown event tag, or missing fields.
    Schema(String),
    /// The media timestamp was not a decimal millisecond count.
    Timestamp(String),
    /// The media payload was not valid base64.
    Payload(String),
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeError::Schema(msg) => write!(f, "Malformed event: {}", msg),
            EnvelopeError::Timestamp(msg) => write!(f, "Bad media timestamp: {}", msg),
            EnvelopeError::Payload(msg) => write!(f, "Bad media payload: {}", msg),
        }
    }
}

impl std::error::Error for EnvelopeError {}

// Raw wire shapes. The provider sends more fields than these (sequence
// numbers, account identifiers, format descriptors); serde skips whatever the
// relay does not consume.

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum WireEvent {
    Connected,
    Start { start: WireStart },
    Media { media: WireMedia },
    Stop,
}

#[derive(Debug, Deserialize)]
struct WireStart {
    #[serde(rename = "callSid")]
    call_sid: String,
    #[serde(rename = "streamSid")]
    stream_sid: String,
}

#[derive(Debug, Deserialize)]
struct WireMedia {
    track: Track,
    /// Milliseconds since stream start, sent as a decimal string.
    timestamp: String,
    /// Base64 of raw mulaw bytes.
    payload: String,
}

/// Identity announced by the start event.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamStart {
    pub call_sid: String,
    pub stream_sid: String,
}

/// One decoded media frame.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub track: Track,
    pub timestamp_ms: u64,
    pub payload: Vec<u8>,
}

/// A fully decoded transport message.
#[derive(Debug, Clone, PartialEq)]
pub enum TelephonyEvent {
    /// Handshake acknowledgement; carries nothing the relay uses.
    Connected,
    Start(StreamStart),
    Media(AudioFrame),
    Stop,
}

impl TelephonyEvent {
    /// Parse one transport text message.
    pub fn parse(raw: &str) -> Result<Self, EnvelopeError> {
        let wire: WireEvent =
            serde_json::from_str(raw).map_err(|e| EnvelopeError::Schema(e.to_string()))?;

        match wire {
            WireEvent::Connected => Ok(TelephonyEvent::Connected),
            WireEvent::Start { start } => Ok(TelephonyEvent::Start(StreamStart {
                call_sid: start.call_sid,
                stream_sid: start.stream_sid,
            })),
            WireEvent::Media { media } => {
                let timestamp_ms = media.timestamp.parse::<u64>().map_err(|e| {
                    EnvelopeError::Timestamp(format!("'{}': {}", media.timestamp, e))
                })?;
                let payload = BASE64
                    .decode(media.payload.as_bytes())
                    .map_err(|e| EnvelopeError::Payload(e.to_string()))?;
                Ok(TelephonyEvent::Media(AudioFrame {
                    track: media.track,
                    timestamp_ms,
                    payload,
                }))
            }
            WireEvent::Stop => Ok(TelephonyEvent::Stop),
        }
    }
}

/// Media message written back to the telephony stream to play synthesized
/// audio on the call.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMediaMessage {
    event: &'static str,
    #[serde(rename = "streamSid")]
    stream_sid: String,
    media: OutboundMediaPayload,
}

#[derive(Debug, Clone, Serialize)]
struct OutboundMediaPayload {
    payload: String,
}

impl OutboundMediaMessage {
    /// Wrap one already-encoded base64 chunk for a stream.
    pub fn new(stream_sid: &str, payload_b64: String) -> Self {
        Self {
            event: "media",
            stream_sid: stream_sid.to_string(),
            media: OutboundMediaPayload {
                payload: payload_b64,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONNECTED: &str = r#"{"event":"connected","protocol":"Call","version":"1.0.0"}"#;

    const START: &str = r#"{
        "event": "start",
        "sequenceNumber": "1",
        "start": {
            "accountSid": "AC00000000000000000000000000000000",
            "callSid": "CA5678",
            "streamSid": "MZ1234",
            "tracks": ["inbound", "outbound"],
            "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1}
        },
        "streamSid": "MZ1234"
    }"#;

    const STOP: &str = r#"{
        "event": "stop",
        "sequenceNumber": "42",
        "stop": {"accountSid": "AC00000000000000000000000000000000", "callSid": "CA5678"},
        "streamSid": "MZ1234"
    }"#;

    fn media_json(track: &str, timestamp: &str, payload: &str) -> String {
        format!(
            r#"{{"event":"media","sequenceNumber":"3","media":{{"track":"{}","chunk":"2","timestamp":"{}","payload":"{}"}},"streamSid":"MZ1234"}}"#,
            track, timestamp, payload
        )
    }

    #[test]
    fn test_parse_connected() {
        assert_eq!(
            TelephonyEvent::parse(CONNECTED).unwrap(),
            TelephonyEvent::Connected
        );
    }

    #[test]
    fn test_parse_start_extracts_identity() {
        let event = TelephonyEvent::parse(START).unwrap();
        assert_eq!(
            event,
            TelephonyEvent::Start(StreamStart {
                call_sid: "CA5678".to_string(),
                stream_sid: "MZ1234".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_media_decodes_payload_and_timestamp() {
        let payload = BASE64.encode([1u8, 2, 3, 4]);
        let event = TelephonyEvent::parse(&media_json("inbound", "5160", &payload)).unwrap();

        assert_eq!(
            event,
            TelephonyEvent::Media(AudioFrame {
                track: Track::Inbound,
                timestamp_ms: 5160,
                payload: vec![1, 2, 3, 4],
            })
        );
    }

    #[test]
    fn test_parse_stop() {
        assert_eq!(TelephonyEvent::parse(STOP).unwrap(), TelephonyEvent::Stop);
    }

    #[test]
    fn test_unknown_event_tag_is_schema_error() {
        let raw = r#"{"event":"mark","sequenceNumber":"7","streamSid":"MZ1234"}"#;
        assert!(matches!(
            TelephonyEvent::parse(raw),
            Err(EnvelopeError::Schema(_))
        ));
    }

    #[test]
    fn test_non_json_is_schema_error() {
        assert!(matches!(
            TelephonyEvent::parse("not json"),
            Err(EnvelopeError::Schema(_))
        ));
    }

    #[test]
    fn test_unknown_track_is_schema_error() {
        let payload = BASE64.encode([0u8; 4]);
        assert!(matches!(
            TelephonyEvent::parse(&media_json("both", "100", &payload)),
            Err(EnvelopeError::Schema(_))
        ));
    }

    #[test]
    fn test_non_numeric_timestamp_is_rejected() {
        let payload = BASE64.encode([0u8; 4]);
        assert!(matches!(
            TelephonyEvent::parse(&media_json("inbound", "soon", &payload)),
            Err(EnvelopeError::Timestamp(_))
        ));
    }

    #[test]
    fn test_invalid_base64_payload_is_rejected() {
        assert!(matches!(
            TelephonyEvent::parse(&media_json("inbound", "100", "@@not-base64@@")),
            Err(EnvelopeError::Payload(_))
        ));
    }

    #[test]
    fn test_outbound_media_message_wire_shape() {
        let message = OutboundMediaMessage::new("MZ1234", BASE64.encode([0xFFu8; 4]));
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&message).unwrap()).unwrap();

        assert_eq!(json["event"], "media");
        assert_eq!(json["streamSid"], "MZ1234");
        assert_eq!(json["media"]["payload"], BASE64.encode([0xFFu8; 4]));
    }
}
