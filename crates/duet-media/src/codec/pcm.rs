use duet_common::{Error, Result};

use super::{AudioDecoder, AudioEncoder};

/// Uncompressed little-endian 16-bit PCM. Carries no redundancy.
#[derive(Debug, Clone)]
pub struct PcmEncoder {
    channels: usize,
}

impl PcmEncoder {
    pub fn new(channels: usize) -> Result<Self> {
        if channels == 0 {
            return Err(Error::config("PCM encoder needs at least one channel"));
        }
        Ok(Self { channels })
    }
}

impl AudioEncoder for PcmEncoder {
    fn channels(&self) -> usize {
        self.channels
    }

    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        if pcm.len() % self.channels != 0 {
            return Err(Error::internal(format!(
                "frame of {} samples is not a multiple of {} channels",
                pcm.len(),
                self.channels
            )));
        }
        Ok(pcm.iter().flat_map(|s| s.to_le_bytes()).collect())
    }
}

#[derive(Debug, Clone)]
pub struct PcmDecoder {
    channels: usize,
    last_duration: Option<usize>,
}

impl PcmDecoder {
    pub fn new(channels: usize) -> Result<Self> {
        if channels == 0 {
            return Err(Error::config("PCM decoder needs at least one channel"));
        }
        Ok(Self {
            channels,
            last_duration: None,
        })
    }
}

impl AudioDecoder for PcmDecoder {
    fn channels(&self) -> usize {
        self.channels
    }

    fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>> {
        let frame_bytes = 2 * self.channels;
        if payload.len() % frame_bytes != 0 {
            return Err(Error::decode(format!(
                "PCM payload of {} bytes is not a whole number of {}-byte frames",
                payload.len(),
                frame_bytes
            )));
        }
        let pcm: Vec<i16> = payload
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        self.last_duration = Some(pcm.len() / self.channels);
        Ok(pcm)
    }

    fn decode_fec(&mut self, _payload: &[u8], _sample_count: usize) -> Result<Vec<i16>> {
        Err(Error::decode("PCM payloads carry no redundancy"))
    }

    fn conceal(&mut self, sample_count: usize) -> Result<Vec<i16>> {
        Ok(vec![0; sample_count])
    }

    fn last_unit_duration(&mut self) -> Option<usize> {
        self.last_duration
    }
}
