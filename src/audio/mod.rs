//! # Call Audio Pipeline
//!
//! Per-call audio processing between the telephony media stream and the
//! speech service: gap compensation and two-track windowing.
//!
//! ## Key Components:
//! - **Silence Fill**: Per-track accumulator that patches timestamp gaps with
//!   silence so each track's byte timeline stays continuous (`silence.rs`)
//! - **Track Mixer**: Combines the two continuous track buffers into
//!   fixed-size interleaved windows for the speech service (`mixer.rs`)
//!
//! ## Audio Format:
//! - **Sample Rate**: 8kHz (8,000 Hz), one byte per sample
//! - **Encoding**: 8-bit mulaw (silence byte 0xFF)
//! - **Frames**: 20ms media frames, 160 bytes each at the default rate
//! - **Windows**: 20 frames per track, interleaved into two-channel output

pub mod mixer;      // Two-track window extraction
pub mod silence;    // Gap-filling per-track accumulator

pub use mixer::{MixedWindow, Track, TrackMixer, TRACKS};
pub use silence::{AudioFormat, SilenceFillBuffer, MULAW_SILENCE};
