//! Turns a lossy, reordered stream of encoded units back into continuous PCM.
//!
//! Every unit is placed on the sender's sample clock. A unit arriving after a
//! gap triggers recovery before it is decoded: the part of the gap within
//! the last unit's duration is rebuilt from the new unit's in-band FEC (or
//! concealed when FEC is off or fails), and anything older is concealed.
//! A unit overlapping audio already emitted is trimmed, and a unit wholly
//! behind the output position is discarded. A sender clock that moves more
//! than the maximum gap in either direction restarts the output clock at the
//! arriving unit. Nothing is committed until the unit has decoded.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use duet_common::{Error, Result};
use duet_proto::{ts_advance, ts_diff, AudioPacket};
use tracing::{debug, warn};

use crate::codec::AudioDecoder;
use crate::diag::{DiagnosticEvent, DiagnosticSink};
use crate::AudioParams;

/// Gaps longer than this are treated as a restart of the sender's clock.
pub const DEFAULT_MAX_GAP: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedUnit {
    pub payload: Bytes,
    pub timestamp: u32,
}

impl EncodedUnit {
    pub fn new(payload: impl Into<Bytes>, timestamp: u32) -> Self {
        Self {
            payload: payload.into(),
            timestamp,
        }
    }
}

impl From<AudioPacket> for EncodedUnit {
    fn from(packet: AudioPacket) -> Self {
        Self {
            payload: packet.payload,
            timestamp: packet.timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepacketizerConfig {
    pub params: AudioParams,
    pub fec_enabled: bool,
    pub max_gap: Duration,
}

impl DepacketizerConfig {
    pub fn new(params: AudioParams, fec_enabled: bool) -> Self {
        Self {
            params,
            fec_enabled,
            max_gap: DEFAULT_MAX_GAP,
        }
    }
}

/// Cumulative counters. Sample counts are interleaved.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStats {
    pub units: u64,
    pub gaps: u64,
    pub fec_samples: u64,
    pub concealed_samples: u64,
    pub trimmed_samples: u64,
    pub discarded_units: u64,
    pub resyncs: u64,
}

pub struct Depacketizer<D: AudioDecoder> {
    decoder: D,
    fec_enabled: bool,
    channels: usize,
    max_gap: usize,
    last_unit: Option<EncodedUnit>,
    last_timestamp: u32,
    stats: RecoveryStats,
    sink: Arc<dyn DiagnosticSink>,
}

impl<D: AudioDecoder> Depacketizer<D> {
    pub fn new(
        decoder: D,
        config: DepacketizerConfig,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Result<Self> {
        config.params.validate()?;
        let channels = config.params.channel_count();
        if decoder.channels() != channels {
            return Err(Error::config(format!(
                "decoder produces {} channels, stream has {}",
                decoder.channels(),
                channels
            )));
        }
        let max_gap = config.params.frame_samples(config.max_gap);
        if max_gap == 0 {
            return Err(Error::config("maximum gap must be positive"));
        }

        Ok(Self {
            decoder,
            fec_enabled: config.fec_enabled,
            channels,
            max_gap,
            last_unit: None,
            last_timestamp: 0,
            stats: RecoveryStats::default(),
            sink,
        })
    }

    /// Returns the samples this unit contributes to the output, in order.
    ///
    /// A malformed payload fails with `Error::Decode` and leaves the output
    /// position and counters unchanged.
    pub fn process(&mut self, unit: &EncodedUnit) -> Result<Vec<i16>> {
        let placement = self.place(unit);
        let recovery = match placement {
            Placement::Gap { missing } => self.recover_gap(unit, missing),
            _ => None,
        };
        let base = match placement {
            Placement::First | Placement::Resync { .. } => unit.timestamp,
            Placement::InSequence | Placement::Gap { .. } => self.last_timestamp,
        };
        let current = self.decode_current(unit, base)?;

        if let Placement::Resync { offset } = placement {
            warn!(
                offset,
                timestamp = unit.timestamp,
                "sender clock jumped, resynchronizing"
            );
            self.stats.resyncs += 1;
        }

        let samples = match recovery {
            Some(recovered) => {
                self.stats.gaps += 1;
                self.stats.fec_samples += recovered.fec as u64;
                self.stats.concealed_samples += recovered.concealed as u64;
                self.sink.record(DiagnosticEvent::Recovered {
                    fec: recovered.fec,
                    concealed: recovered.concealed,
                });
                let mut samples = recovered.samples;
                samples.extend_from_slice(&current);
                samples
            }
            None => current,
        };

        self.last_timestamp = ts_advance(base, samples.len() / self.channels);
        self.last_unit = Some(unit.clone());
        self.stats.units += 1;

        Ok(samples)
    }

    /// Sample-clock value immediately after the last emitted sample.
    pub fn next_timestamp(&self) -> Option<u32> {
        self.last_unit.as_ref().map(|_| self.last_timestamp)
    }

    pub fn last_unit(&self) -> Option<&EncodedUnit> {
        self.last_unit.as_ref()
    }

    pub fn stats(&self) -> RecoveryStats {
        self.stats
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    fn place(&self, unit: &EncodedUnit) -> Placement {
        if self.last_unit.is_none() {
            return Placement::First;
        }

        let offset = ts_diff(unit.timestamp, self.last_timestamp) as i64 * self.channels as i64;
        if offset.unsigned_abs() > self.max_gap as u64 {
            Placement::Resync { offset }
        } else if offset > 0 {
            Placement::Gap {
                missing: offset as usize,
            }
        } else {
            Placement::InSequence
        }
    }

    /// Rebuilds `missing` samples preceding `unit`. Nothing is counted here;
    /// the caller commits the result once the unit itself has decoded.
    fn recover_gap(&mut self, unit: &EncodedUnit, missing: usize) -> Option<Recovered> {
        let window = match self.decoder.last_unit_duration() {
            Some(duration) if duration > 0 => duration * self.channels,
            _ => {
                debug!(missing, "last unit duration unavailable, skipping recovery");
                return None;
            }
        };

        let mut concealed = 0;
        let mut samples = Vec::new();
        if missing > window {
            samples = self.conceal(missing - window);
            concealed += samples.len();
        }

        let mut right = self.recover_fec(&unit.payload, window);
        let mut fec = right.len();
        if right.is_empty() {
            right = self.conceal(missing.min(window));
            concealed += right.len();
        }

        if right.len() > missing {
            right.drain(..right.len() - missing);
            fec = fec.min(missing);
        }

        samples.extend_from_slice(&right);
        Some(Recovered {
            samples,
            fec,
            concealed,
        })
    }

    fn recover_fec(&mut self, payload: &[u8], window: usize) -> Vec<i16> {
        if !self.fec_enabled || payload.is_empty() {
            return Vec::new();
        }
        match self.decoder.decode_fec(payload, window) {
            Ok(pcm) => pcm,
            Err(e) => {
                debug!("FEC recovery failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Concealment never fails outward; a failed synthesis yields silence.
    fn conceal(&mut self, sample_count: usize) -> Vec<i16> {
        match self.decoder.conceal(sample_count) {
            Ok(mut pcm) => {
                pcm.resize(sample_count, 0);
                pcm
            }
            Err(e) => {
                debug!("concealment failed, inserting silence: {}", e);
                vec![0; sample_count]
            }
        }
    }

    /// Decodes `unit` and drops whatever part of it precedes `base`.
    fn decode_current(&mut self, unit: &EncodedUnit, base: u32) -> Result<Vec<i16>> {
        if unit.payload.is_empty() {
            return Ok(Vec::new());
        }

        let mut pcm = self.decoder.decode(&unit.payload)?;
        let diff = ts_diff(unit.timestamp, base) as i64;
        if diff >= 0 {
            return Ok(pcm);
        }

        let behind = diff.unsigned_abs() as usize;
        let duration = pcm.len() / self.channels;
        if behind >= duration {
            self.stats.discarded_units += 1;
            return Ok(Vec::new());
        }

        let overlap = behind * self.channels;
        pcm.drain(..overlap);
        self.stats.trimmed_samples += overlap as u64;
        Ok(pcm)
    }
}

/// Where a unit lands relative to the output clock.
#[derive(Debug, Clone, Copy)]
enum Placement {
    First,
    /// Contiguous with, overlapping, or behind the output position.
    InSequence,
    /// Ahead of the output position by `missing` interleaved samples.
    Gap { missing: usize },
    /// Further from the output position than the maximum gap, either way.
    Resync { offset: i64 },
}

struct Recovered {
    samples: Vec<i16>,
    fec: usize,
    concealed: usize,
}
