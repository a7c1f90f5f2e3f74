//! # Speech Service Integration
//!
//! Everything that talks to the speech provider: the streaming WebSocket
//! bridge that turns call audio into results, and the HTTP synthesis client
//! that turns text into call audio.

pub mod bridge;      // Streaming recognition over WebSocket
pub mod synthesis;   // Text-to-speech over HTTP

pub use bridge::{SpeechInput, UpstreamBridge};
pub use synthesis::SpeechSynthesizer;
