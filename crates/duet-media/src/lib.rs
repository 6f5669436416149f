//! Receive-side audio path for Duet.
//!
//! Encoded units go through the [`Depacketizer`], which repairs gaps with the
//! codec's FEC and concealment, into the [`JitterBuffer`], which hands out
//! fixed-size frames at the playback sink's cadence.

pub mod audio;
pub mod codec;
pub mod depacketizer;
pub mod diag;
pub mod jitter;

use duet_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use audio::{MemorySink, MemorySource, PcmSource, PlaybackSink, SinkWaker};
pub use codec::{AudioDecoder, AudioEncoder, PcmDecoder, PcmEncoder, ScriptedDecoder};
#[cfg(feature = "opus-support")]
pub use codec::opus::{OpusAudioDecoder, OpusAudioEncoder};
pub use depacketizer::{Depacketizer, DepacketizerConfig, EncodedUnit, RecoveryStats};
pub use diag::{
    CountingSink, DiagnosticEvent, DiagnosticSink, EventKind, LogSink, NullSink, RateLimiter,
};
pub use jitter::{JitterBuffer, JitterBufferConfig, JitterSnapshot, JitterStats};

/// Sample rates the Opus codec accepts.
pub const OPUS_SAMPLE_RATES: [u32; 5] = [8_000, 12_000, 16_000, 24_000, 48_000];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
        }
    }
}

impl AudioParams {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(Error::config("sample rate must be positive"));
        }
        if !(1..=2).contains(&self.channels) {
            return Err(Error::config(format!(
                "channel count must be 1 or 2, got {}",
                self.channels
            )));
        }
        Ok(())
    }

    pub fn channel_count(&self) -> usize {
        self.channels as usize
    }

    /// Interleaved samples in one frame of `duration`.
    pub fn frame_samples(&self, duration: Duration) -> usize {
        duet_common::frame_samples(self.sample_rate, self.channel_count(), duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params_are_48k_stereo() {
        let params = AudioParams::default();
        assert_eq!(params.frame_samples(Duration::from_millis(20)), 1920);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn rejects_bad_channel_counts() {
        assert!(AudioParams::new(48_000, 0).validate().is_err());
        assert!(AudioParams::new(48_000, 3).validate().is_err());
        assert!(AudioParams::new(0, 1).validate().is_err());
    }
}
