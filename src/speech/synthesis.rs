//! # Speech Synthesis Client
//!
//! HTTP client for the provider's text-to-speech endpoint, plus the chunking
//! that turns raw synthesized audio into frame-sized media messages for the
//! telephony stream.

use crate::config::SpeechConfig;
use crate::telephony::envelope::OutboundMediaMessage;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::json;
use std::fmt;
use tracing::debug;

#[derive(Debug)]
pub enum SynthesisError {
    /// The request never produced a response.
    Request(String),
    /// The service answered with a non-success status.
    Service { status: u16, message: String },
}

impl fmt::Display for SynthesisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SynthesisError::Request(msg) => write!(f, "Synthesis request failed: {}", msg),
            SynthesisError::Service { status, message } => {
                write!(f, "Synthesis service error ({}): {}", status, message)
            }
        }
    }
}

impl std::error::Error for SynthesisError {}

impl From<reqwest::Error> for SynthesisError {
    fn from(err: reqwest::Error) -> Self {
        SynthesisError::Request(err.to_string())
    }
}

/// Client for one speech deployment's synthesis endpoint.
///
/// Holds a pooled HTTP client, so it is cheap to clone into application
/// state and share across handlers.
#[derive(Debug, Clone)]
pub struct SpeechSynthesizer {
    client: reqwest::Client,
    speak_url: String,
    api_key: String,
    model: String,
    sample_rate: u32,
}

impl SpeechSynthesizer {
    /// Audio comes back in the same raw format the call runs on: headerless
    /// mulaw at the configured sample rate.
    pub fn new(speech: &SpeechConfig, sample_rate: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            speak_url: speech.speak_url.clone(),
            api_key: speech.api_key.clone(),
            model: speech.tts_model.clone(),
            sample_rate,
        }
    }

    /// Synthesize `text` into raw call audio.
    pub async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SynthesisError> {
        let sample_rate = self.sample_rate.to_string();
        let response = self
            .client
            .post(&self.speak_url)
            .query(&[
                ("model", self.model.as_str()),
                ("encoding", "mulaw"),
                ("sample_rate", sample_rate.as_str()),
                ("container", "none"),
            ])
            .header("Authorization", format!("Token {}", self.api_key))
            .json(&json!({ "text": text }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SynthesisError::Service {
                status: status.as_u16(),
                message,
            });
        }

        let audio = response.bytes().await?;
        debug!(bytes = audio.len(), "Synthesis completed");
        Ok(audio.to_vec())
    }
}

/// Chunk raw synthesized audio into frame-sized outbound media messages.
///
/// The last chunk carries the remainder and may be short; the telephony
/// provider accepts partial frames. `frame_bytes` must be non-zero.
pub fn encode_media_frames(
    stream_sid: &str,
    audio: &[u8],
    frame_bytes: usize,
) -> Vec<OutboundMediaMessage> {
    audio
        .chunks(frame_bytes)
        .map(|chunk| OutboundMediaMessage::new(stream_sid, BASE64.encode(chunk)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_splits_audio_into_frames() {
        let audio = vec![0x42u8; 160 * 3 + 40];
        let frames = encode_media_frames("MZ1", &audio, 160);
        assert_eq!(frames.len(), 4);
    }

    #[test]
    fn test_encoded_frames_reassemble_to_input() {
        let audio: Vec<u8> = (0u8..=255).cycle().take(1000).collect();
        let frames = encode_media_frames("MZ1", &audio, 160);

        let mut reassembled = Vec::new();
        for frame in &frames {
            let value: serde_json::Value =
                serde_json::from_str(&serde_json::to_string(frame).unwrap()).unwrap();
            assert_eq!(value["streamSid"], "MZ1");
            let chunk = BASE64
                .decode(value["media"]["payload"].as_str().unwrap())
                .unwrap();
            assert!(chunk.len() <= 160);
            reassembled.extend_from_slice(&chunk);
        }
        assert_eq!(reassembled, audio);
    }

    #[test]
    fn test_no_audio_means_no_frames() {
        assert!(encode_media_frames("MZ1", &[], 160).is_empty());
    }
}
