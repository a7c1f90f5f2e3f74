//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Built-in defaults
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER__HOST, APP_SPEECH__API_KEY, ...)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! `HOST`, `PORT` and `SPEECH_API_KEY` are also honored without the prefix,
//! since deployment platforms and secret stores commonly inject them bare.

use crate::audio::AudioFormat;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::env;
use std::time::Duration;

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub speech: SpeechConfig,
    pub audio: AudioFormat,
    pub limits: LimitsConfig,
}

/// HTTP server binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Speech service endpoints and credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    /// Streaming recognition WebSocket endpoint (ws:// or wss://).
    pub listen_url: String,
    /// Text-to-speech HTTP endpoint.
    pub speak_url: String,
    /// Deployment API key, sent as `Authorization: Token <key>`.
    pub api_key: String,
    /// Voice model used for synthesis.
    pub tts_model: String,
    /// How long to wait for buffered results after the flush frame.
    pub flush_grace_ms: u64,
}

impl SpeechConfig {
    pub fn flush_grace(&self) -> Duration {
        Duration::from_millis(self.flush_grace_ms)
    }
}

/// Load-shedding limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Telephony connections accepted at once; each one holds a speech
    /// service connection open.
    pub max_concurrent_calls: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(), // provider webhooks arrive from outside
                port: 8080,
            },
            speech: SpeechConfig {
                listen_url: "wss://api.deepgram.com/v1/listen".to_string(),
                speak_url: "https://api.deepgram.com/v1/speak".to_string(),
                api_key: String::new(), // injected via SPEECH_API_KEY
                tts_model: "aura-asteria-en".to_string(),
                flush_grace_ms: 3000,
            },
            audio: AudioFormat::default(),
            limits: LimitsConfig {
                max_concurrent_calls: 64,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, file and environment, in that
    /// order.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // Double underscore separates section from key, so APP_SPEECH__API_KEY
            // reaches speech.api_key without mangling multi-word keys.
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }
        if let Ok(api_key) = env::var("SPEECH_API_KEY") {
            settings = settings.set_override("speech.api_key", api_key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations the relay cannot run with.
    ///
    /// An empty API key passes validation; it only matters once a call
    /// arrives, and local setups may point at an unauthenticated service.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if !self.speech.listen_url.starts_with("ws://") && !self.speech.listen_url.starts_with("wss://") {
            return Err(anyhow::anyhow!(
                "speech.listen_url must be a ws:// or wss:// URL"
            ));
        }

        if !self.speech.speak_url.starts_with("http://") && !self.speech.speak_url.starts_with("https://") {
            return Err(anyhow::anyhow!(
                "speech.speak_url must be an http:// or https:// URL"
            ));
        }

        if self.audio.sample_rate == 0 || self.audio.sample_rate % 1000 != 0 {
            return Err(anyhow::anyhow!(
                "audio.sample_rate must be a non-zero multiple of 1000"
            ));
        }

        if self.audio.frame_ms == 0 {
            return Err(anyhow::anyhow!("audio.frame_ms must be greater than 0"));
        }

        if self.audio.window_frames == 0 {
            return Err(anyhow::anyhow!("audio.window_frames must be greater than 0"));
        }

        if self.limits.max_concurrent_calls == 0 {
            return Err(anyhow::anyhow!(
                "limits.max_concurrent_calls must be greater than 0"
            ));
        }

        Ok(())
    }

    /// View safe to expose over HTTP: everything except the API key.
    pub fn sanitized(&self) -> serde_json::Value {
        json!({
            "server": {
                "host": self.server.host,
                "port": self.server.port
            },
            "speech": {
                "listen_url": self.speech.listen_url,
                "speak_url": self.speech.speak_url,
                "tts_model": self.speech.tts_model,
                "flush_grace_ms": self.speech.flush_grace_ms,
                "api_key_configured": !self.speech.api_key.is_empty()
            },
            "audio": {
                "sample_rate": self.audio.sample_rate,
                "frame_ms": self.audio.frame_ms,
                "window_frames": self.audio.window_frames,
                "frame_bytes": self.audio.frame_bytes(),
                "window_bytes": self.audio.window_bytes()
            },
            "limits": {
                "max_concurrent_calls": self.limits.max_concurrent_calls
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.audio.sample_rate, 8000);
        assert_eq!(config.limits.max_concurrent_calls, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_window_math() {
        let config = AppConfig::default();
        assert_eq!(config.audio.bytes_per_ms(), 8);
        assert_eq!(config.audio.frame_bytes(), 160);
        assert_eq!(config.audio.window_bytes(), 3200);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.speech.listen_url = "https://api.deepgram.com/v1/listen".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.sample_rate = 44100; // not a whole multiple of 1000
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.window_frames = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.limits.max_concurrent_calls = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sanitized_view_hides_api_key() {
        let mut config = AppConfig::default();
        config.speech.api_key = "secret-key".to_string();

        let view = config.sanitized();
        assert_eq!(view["speech"]["api_key_configured"], true);
        assert!(view["speech"].get("api_key").is_none());
        assert_eq!(view["audio"]["window_bytes"], 3200);
    }
}
