//! Deterministic decoder double for exercising gap recovery without a codec.
//!
//! Payloads built by [`scripted_payload`] decode to `duration * channels`
//! copies of a fill value. A payload starting with [`CORRUPT_TAG`] fails to
//! decode. FEC output is a ramp starting at [`FEC_BASE`] so tests can tell
//! which part of a recovered segment survived truncation, and concealment
//! output is [`PLC_FILL`].

use duet_common::{Error, Result};

use super::AudioDecoder;

pub const CORRUPT_TAG: u8 = 0xFF;
pub const FEC_BASE: i16 = 10_000;
pub const PLC_FILL: i16 = -1;

/// Builds a payload decoding to `duration` per-channel samples of `value`.
pub fn scripted_payload(value: u8, duration: u16) -> Vec<u8> {
    let [hi, lo] = duration.to_be_bytes();
    vec![value, hi, lo]
}

#[derive(Debug, Clone)]
pub struct ScriptedDecoder {
    channels: usize,
    last_duration: Option<usize>,
    fail_fec: bool,
    hide_duration: bool,
    fail_conceal: bool,
    pub decode_calls: usize,
    pub fec_calls: usize,
    pub conceal_calls: usize,
    pub concealed_samples: usize,
}

impl ScriptedDecoder {
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            last_duration: None,
            fail_fec: false,
            hide_duration: false,
            fail_conceal: false,
            decode_calls: 0,
            fec_calls: 0,
            conceal_calls: 0,
            concealed_samples: 0,
        }
    }

    /// Every FEC request fails.
    pub fn with_fec_failure(mut self) -> Self {
        self.fail_fec = true;
        self
    }

    /// `last_unit_duration` always reports unavailable.
    pub fn without_duration(mut self) -> Self {
        self.hide_duration = true;
        self
    }

    /// Every concealment request fails.
    pub fn with_conceal_failure(mut self) -> Self {
        self.fail_conceal = true;
        self
    }
}

impl AudioDecoder for ScriptedDecoder {
    fn channels(&self) -> usize {
        self.channels
    }

    fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>> {
        self.decode_calls += 1;
        match payload {
            [CORRUPT_TAG, ..] => Err(Error::decode("scripted corrupt payload")),
            [value, hi, lo] => {
                let duration = u16::from_be_bytes([*hi, *lo]) as usize;
                self.last_duration = Some(duration);
                Ok(vec![*value as i16; duration * self.channels])
            }
            _ => Err(Error::decode(format!(
                "scripted payload must be 3 bytes, got {}",
                payload.len()
            ))),
        }
    }

    fn decode_fec(&mut self, payload: &[u8], sample_count: usize) -> Result<Vec<i16>> {
        self.fec_calls += 1;
        if self.fail_fec || payload.is_empty() {
            return Err(Error::decode("no redundancy"));
        }
        Ok((0..sample_count)
            .map(|i| FEC_BASE + (i % 10_000) as i16)
            .collect())
    }

    fn conceal(&mut self, sample_count: usize) -> Result<Vec<i16>> {
        self.conceal_calls += 1;
        if self.fail_conceal {
            return Err(Error::decode("concealment failed"));
        }
        self.concealed_samples += sample_count;
        Ok(vec![PLC_FILL; sample_count])
    }

    fn last_unit_duration(&mut self) -> Option<usize> {
        if self.hide_duration {
            None
        } else {
            self.last_duration
        }
    }
}
