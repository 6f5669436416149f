//! Codec capabilities consumed by the audio path.

use duet_common::Result;

#[cfg(feature = "opus-support")]
pub mod opus;
mod pcm;
mod scripted;

pub use pcm::{PcmDecoder, PcmEncoder};
pub use scripted::{scripted_payload, ScriptedDecoder, CORRUPT_TAG, FEC_BASE, PLC_FILL};

/// Longest unit a decoder may return, in milliseconds.
pub const MAX_FRAME_MS: u32 = 120;
/// Largest encoded payload produced per unit.
pub const MAX_PACKET_BYTES: usize = 4_000;

/// Decoding side of a codec. All sample counts are interleaved unless noted.
pub trait AudioDecoder: Send {
    fn channels(&self) -> usize;

    /// Decodes one payload. Fails with `Error::Decode` on a malformed payload.
    fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>>;

    /// Rebuilds `sample_count` samples of the unit that preceded `payload`
    /// from the redundancy it carries.
    fn decode_fec(&mut self, payload: &[u8], sample_count: usize) -> Result<Vec<i16>>;

    /// Synthesizes `sample_count` samples continuing the last decoded audio.
    fn conceal(&mut self, sample_count: usize) -> Result<Vec<i16>>;

    /// Per-channel duration of the most recently decoded unit.
    fn last_unit_duration(&mut self) -> Option<usize>;
}

impl<D: AudioDecoder + ?Sized> AudioDecoder for Box<D> {
    fn channels(&self) -> usize {
        (**self).channels()
    }

    fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>> {
        (**self).decode(payload)
    }

    fn decode_fec(&mut self, payload: &[u8], sample_count: usize) -> Result<Vec<i16>> {
        (**self).decode_fec(payload, sample_count)
    }

    fn conceal(&mut self, sample_count: usize) -> Result<Vec<i16>> {
        (**self).conceal(sample_count)
    }

    fn last_unit_duration(&mut self) -> Option<usize> {
        (**self).last_unit_duration()
    }
}

pub trait AudioEncoder: Send {
    fn channels(&self) -> usize;

    /// Encodes one interleaved frame into a single payload.
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>>;
}
