//! # Two-Track Window Mixer
//!
//! Owns one [`SilenceFillBuffer`] per call direction and turns the pair of
//! continuous byte streams into fixed-size interleaved windows. The speech
//! service is opened in two-channel mode, so each output window alternates
//! caller and callee bytes sample by sample.

use crate::audio::silence::{AudioFormat, SilenceFillBuffer};

use serde::{Deserialize, Serialize};

/// Number of audio tracks on a call leg.
pub const TRACKS: usize = 2;

/// Direction of a media frame relative to the telephony provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Track {
    /// Audio from the caller into the platform.
    Inbound,
    /// Audio played towards the caller.
    Outbound,
}

/// One extracted window of interleaved two-channel audio.
///
/// `bytes` holds `window_bytes() * TRACKS` bytes: even offsets are inbound
/// samples, odd offsets outbound.
#[derive(Debug, Clone, PartialEq)]
pub struct MixedWindow {
    pub bytes: Vec<u8>,
}

/// Per-call mixer pairing the two track buffers.
///
/// Frames may arrive in any interleaving across tracks; windows only come out
/// once both sides have a full window's worth of bytes, which keeps the two
/// channels aligned on the same stretch of call time.
#[derive(Debug)]
pub struct TrackMixer {
    format: AudioFormat,
    inbound: SilenceFillBuffer,
    outbound: SilenceFillBuffer,
}

impl TrackMixer {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            inbound: SilenceFillBuffer::new(format.clone()),
            outbound: SilenceFillBuffer::new(format.clone()),
            format,
        }
    }

    /// Route one frame to its track buffer.
    ///
    /// Each track keeps its own timeline; a gap on one side never generates
    /// fill on the other.
    pub fn ingest(&mut self, track: Track, timestamp: u64, payload: &[u8]) {
        match track {
            Track::Inbound => self.inbound.ingest(timestamp, payload),
            Track::Outbound => self.outbound.ingest(timestamp, payload),
        }
    }

    /// Extract the next interleaved window, if both tracks can fill one.
    ///
    /// Consumes exactly one window of bytes from each track, so remainders
    /// stay queued for the next extraction. Call in a loop to drain a large
    /// frame's backlog.
    pub fn try_extract_window(&mut self) -> Option<MixedWindow> {
        let window = self.format.window_bytes();
        if self.inbound.buffered() < window || self.outbound.buffered() < window {
            return None;
        }

        let inbound = self.inbound.take_front(window);
        let outbound = self.outbound.take_front(window);

        let mut bytes = Vec::with_capacity(window * TRACKS);
        for (caller, callee) in inbound.iter().zip(outbound.iter()) {
            bytes.push(*caller);
            bytes.push(*callee);
        }

        Some(MixedWindow { bytes })
    }

    /// Bytes currently queued for one track.
    pub fn buffered(&self, track: Track) -> usize {
        match track {
            Track::Inbound => self.inbound.buffered(),
            Track::Outbound => self.outbound.buffered(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mixer() -> TrackMixer {
        TrackMixer::new(AudioFormat::default())
    }

    #[test]
    fn test_no_window_until_both_tracks_are_full() {
        let mut mixer = mixer();
        let window = AudioFormat::default().window_bytes();

        mixer.ingest(Track::Inbound, 0, &vec![0x01; window * 3]);
        assert!(mixer.try_extract_window().is_none());

        mixer.ingest(Track::Outbound, 0, &vec![0x02; window - 1]);
        assert!(mixer.try_extract_window().is_none());

        mixer.ingest(Track::Outbound, 20, &[0x02; 1]);
        assert!(mixer.try_extract_window().is_some());
    }

    #[test]
    fn test_window_interleaves_tracks_bytewise() {
        let mut mixer = mixer();
        let window = AudioFormat::default().window_bytes();

        mixer.ingest(Track::Inbound, 0, &vec![0xAA; window]);
        mixer.ingest(Track::Outbound, 0, &vec![0xBB; window]);

        let mixed = mixer.try_extract_window().unwrap();
        assert_eq!(mixed.bytes.len(), window * TRACKS);
        for pair in mixed.bytes.chunks(2) {
            assert_eq!(pair, &[0xAA, 0xBB]);
        }
    }

    #[test]
    fn test_extraction_consumes_exactly_one_window_per_track() {
        let mut mixer = mixer();
        let window = AudioFormat::default().window_bytes();

        mixer.ingest(Track::Inbound, 0, &vec![0x01; window + 100]);
        mixer.ingest(Track::Outbound, 0, &vec![0x02; window + 250]);

        assert!(mixer.try_extract_window().is_some());
        assert_eq!(mixer.buffered(Track::Inbound), 100);
        assert_eq!(mixer.buffered(Track::Outbound), 250);
        assert!(mixer.try_extract_window().is_none());
    }

    #[test]
    fn test_backlog_drains_window_by_window() {
        let mut mixer = mixer();
        let window = AudioFormat::default().window_bytes();

        mixer.ingest(Track::Inbound, 0, &vec![0x01; window * 3]);
        mixer.ingest(Track::Outbound, 0, &vec![0x02; window * 3]);

        let mut windows = 0;
        while mixer.try_extract_window().is_some() {
            windows += 1;
        }
        assert_eq!(windows, 3);
        assert_eq!(mixer.buffered(Track::Inbound), 0);
        assert_eq!(mixer.buffered(Track::Outbound), 0);
    }

    #[test]
    fn test_gap_on_one_track_fills_only_that_track() {
        let mut mixer = mixer();
        let frame = AudioFormat::default().frame_bytes();

        mixer.ingest(Track::Inbound, 0, &vec![0x01; frame]);
        mixer.ingest(Track::Outbound, 0, &vec![0x02; frame]);
        // Inbound drops one frame; outbound stays contiguous.
        mixer.ingest(Track::Inbound, 40, &vec![0x01; frame]);
        mixer.ingest(Track::Outbound, 20, &vec![0x02; frame]);

        assert_eq!(mixer.buffered(Track::Inbound), frame * 3);
        assert_eq!(mixer.buffered(Track::Outbound), frame * 2);
    }

    #[test]
    fn test_track_serde_wire_names() {
        assert_eq!(
            serde_json::from_str::<Track>("\"inbound\"").unwrap(),
            Track::Inbound
        );
        assert_eq!(
            serde_json::from_str::<Track>("\"outbound\"").unwrap(),
            Track::Outbound
        );
        assert!(serde_json::from_str::<Track>("\"both\"").is_err());
    }
}
