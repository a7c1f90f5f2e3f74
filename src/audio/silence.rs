//! # Silence-Filling Track Buffer
//!
//! Accumulates one track's mulaw bytes while keeping the byte timeline
//! continuous. Telephony media streams drop frames under packet loss, and the
//! speech service interprets its binary input as gapless audio, so every
//! missing stretch of time must be patched with silence before the bytes are
//! forwarded.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// The mulaw encoding of a silent sample.
pub const MULAW_SILENCE: u8 = 0xFF;

/// Audio stream parameters shared by the buffering and mixing stages.
///
/// One byte per sample (mulaw), so byte arithmetic follows directly from the
/// sample rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Samples per second. Must be a whole multiple of 1000.
    pub sample_rate: u32,
    /// Duration of one media frame in milliseconds.
    pub frame_ms: u64,
    /// Frames accumulated per track before a window is extracted.
    pub window_frames: usize,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 8000, // telephony narrowband
            frame_ms: 20,      // one media message per 20ms
            window_frames: 20, // 400ms of audio per window
        }
    }
}

impl AudioFormat {
    /// Bytes of audio per millisecond of call time.
    pub fn bytes_per_ms(&self) -> u64 {
        u64::from(self.sample_rate / 1000)
    }

    /// Size of one media frame in bytes.
    pub fn frame_bytes(&self) -> usize {
        (self.bytes_per_ms() * self.frame_ms) as usize
    }

    /// Size of one per-track window in bytes.
    pub fn window_bytes(&self) -> usize {
        self.frame_bytes() * self.window_frames
    }
}

/// Gap-compensating byte accumulator for a single track.
///
/// Frames carry the media timestamp (in milliseconds) of their first sample.
/// When a frame arrives later than the end of the previous one, the distance
/// is filled with silence bytes; when it arrives at or before that point (late
/// or duplicated delivery), nothing is filled and the bytes are appended
/// as-is.
#[derive(Debug)]
pub struct SilenceFillBuffer {
    format: AudioFormat,
    /// Timestamp of the most recent frame, meaningless until `started`.
    latest_timestamp: u64,
    started: bool,
    buffer: Vec<u8>,
}

impl SilenceFillBuffer {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            latest_timestamp: 0,
            started: false,
            buffer: Vec::new(),
        }
    }

    /// Append one frame, filling any timestamp gap with silence first.
    ///
    /// The first frame establishes the timeline baseline without generating
    /// fill, so a stream that begins mid-call does not get padded back to
    /// zero.
    pub fn ingest(&mut self, timestamp: u64, payload: &[u8]) {
        if !self.started {
            self.started = true;
            self.latest_timestamp = timestamp;
            self.buffer.extend_from_slice(payload);
            return;
        }

        let expected = self.latest_timestamp + self.format.frame_ms;
        let gap_ms = timestamp.saturating_sub(expected);
        if gap_ms > 0 {
            let fill = (gap_ms * self.format.bytes_per_ms()) as usize;
            self.buffer.resize(self.buffer.len() + fill, MULAW_SILENCE);
            debug!(gap_ms, fill_bytes = fill, "Filled media gap with silence");
        }

        // Late frames must not move the timeline backwards.
        self.latest_timestamp = self.latest_timestamp.max(timestamp);
        self.buffer.extend_from_slice(payload);
    }

    /// Bytes accumulated and not yet handed to the mixer.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Remove and return the oldest `count` bytes.
    ///
    /// Callers must check `buffered()` first; draining past the end panics.
    pub fn take_front(&mut self, count: usize) -> Vec<u8> {
        self.buffer.drain(..count).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(byte: u8) -> Vec<u8> {
        vec![byte; AudioFormat::default().frame_bytes()]
    }

    #[test]
    fn test_first_frame_sets_baseline_without_fill() {
        let mut buf = SilenceFillBuffer::new(AudioFormat::default());

        // A stream starting at a non-zero timestamp must not be padded back
        // to zero.
        buf.ingest(5000, &frame(0x01));
        assert_eq!(buf.buffered(), 160);

        // The next contiguous frame proves the baseline was taken from the
        // first one: no fill appears between them.
        buf.ingest(5020, &frame(0x02));
        assert_eq!(buf.buffered(), 320);
    }

    #[test]
    fn test_contiguous_frames_insert_no_silence() {
        let mut buf = SilenceFillBuffer::new(AudioFormat::default());

        buf.ingest(100, &frame(0x01));
        buf.ingest(120, &frame(0x02));
        buf.ingest(140, &frame(0x03));

        assert_eq!(buf.buffered(), 480);
        let bytes = buf.take_front(480);
        assert!(!bytes.contains(&MULAW_SILENCE));
    }

    #[test]
    fn test_dropped_frame_fills_exact_gap() {
        let mut buf = SilenceFillBuffer::new(AudioFormat::default());

        // Frames at t, t+20 and t+60: exactly one 20ms frame went missing.
        buf.ingest(100, &frame(0x01));
        buf.ingest(120, &frame(0x02));
        buf.ingest(160, &frame(0x03));

        assert_eq!(buf.buffered(), 160 * 4);
        let bytes = buf.take_front(160 * 4);
        assert!(bytes[..160].iter().all(|&b| b == 0x01));
        assert!(bytes[160..320].iter().all(|&b| b == 0x02));
        assert!(bytes[320..480].iter().all(|&b| b == MULAW_SILENCE));
        assert!(bytes[480..].iter().all(|&b| b == 0x03));
    }

    #[test]
    fn test_longer_outage_fills_proportionally() {
        let mut buf = SilenceFillBuffer::new(AudioFormat::default());

        buf.ingest(0, &frame(0x01));
        buf.ingest(200, &frame(0x02));

        // 180ms of missing audio at 8 bytes per millisecond.
        assert_eq!(buf.buffered(), 160 * 2 + 180 * 8);
    }

    #[test]
    fn test_late_frame_neither_fills_nor_rewinds() {
        let mut buf = SilenceFillBuffer::new(AudioFormat::default());

        buf.ingest(100, &frame(0x01));
        buf.ingest(160, &frame(0x02)); // 40ms gap, 320 fill bytes
        buf.ingest(120, &frame(0x03)); // late arrival, no fill
        assert_eq!(buf.buffered(), 160 * 3 + 320);

        // The next on-time frame continues from 160, not 120.
        buf.ingest(180, &frame(0x04));
        assert_eq!(buf.buffered(), 160 * 4 + 320);
    }

    #[test]
    fn test_take_front_drains_oldest_bytes() {
        let mut buf = SilenceFillBuffer::new(AudioFormat::default());

        buf.ingest(0, &frame(0x01));
        buf.ingest(20, &frame(0x02));

        let head = buf.take_front(160);
        assert!(head.iter().all(|&b| b == 0x01));
        assert_eq!(buf.buffered(), 160);
    }
}
