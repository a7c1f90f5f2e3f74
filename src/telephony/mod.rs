//! # Telephony Media Stream
//!
//! The provider-facing side of the relay: the wire envelope for media stream
//! events and the WebSocket actor that feeds each call's audio pipeline.
//!
//! ## Key Components:
//! - **Envelope**: Strict typed codec for the JSON event protocol
//!   (`envelope.rs`)
//! - **Ingest**: Per-connection actor and pipeline driving parse, silence
//!   fill and window extraction (`ingest.rs`)

pub mod envelope;   // Wire event codec
pub mod ingest;     // Media stream WebSocket actor

pub use envelope::{AudioFrame, OutboundMediaMessage, StreamStart, TelephonyEvent};
pub use ingest::telephony_websocket;
