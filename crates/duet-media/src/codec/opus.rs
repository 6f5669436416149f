use ::opus::{Application, Channels, Decoder, Encoder};
use duet_common::{Error, Result};
use tracing::debug;

use super::{AudioDecoder, AudioEncoder, MAX_FRAME_MS, MAX_PACKET_BYTES};
use crate::{AudioParams, OPUS_SAMPLE_RATES};

/// Concealment is generated in multiples of 2.5ms.
const PLC_STEP_DIVISOR: u32 = 400;

fn opus_channels(params: &AudioParams) -> Result<Channels> {
    params.validate()?;
    if !OPUS_SAMPLE_RATES.contains(&params.sample_rate) {
        return Err(Error::config(format!(
            "Opus does not support {} Hz",
            params.sample_rate
        )));
    }
    Ok(if params.channels == 1 {
        Channels::Mono
    } else {
        Channels::Stereo
    })
}

pub struct OpusAudioDecoder {
    decoder: Decoder,
    channels: usize,
    sample_rate: u32,
    decode_buf: Vec<i16>,
}

impl OpusAudioDecoder {
    pub fn new(params: AudioParams) -> Result<Self> {
        let decoder = Decoder::new(params.sample_rate, opus_channels(&params)?)
            .map_err(|e| Error::config(format!("Opus decoder init failed: {}", e)))?;
        let max_frame = (params.sample_rate * MAX_FRAME_MS / 1000) as usize;
        Ok(Self {
            decoder,
            channels: params.channel_count(),
            sample_rate: params.sample_rate,
            decode_buf: vec![0; max_frame * params.channel_count()],
        })
    }
}

impl AudioDecoder for OpusAudioDecoder {
    fn channels(&self) -> usize {
        self.channels
    }

    fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>> {
        let decoded = self
            .decoder
            .decode(payload, &mut self.decode_buf, false)
            .map_err(|e| Error::decode(format!("Opus decode failed: {}", e)))?;
        Ok(self.decode_buf[..decoded * self.channels].to_vec())
    }

    fn decode_fec(&mut self, payload: &[u8], sample_count: usize) -> Result<Vec<i16>> {
        if payload.is_empty() {
            return Err(Error::decode("no payload to recover from"));
        }
        let mut pcm = vec![0; sample_count];
        let decoded = self
            .decoder
            .decode(payload, &mut pcm, true)
            .map_err(|e| Error::decode(format!("Opus FEC decode failed: {}", e)))?;
        pcm.truncate(decoded * self.channels);
        Ok(pcm)
    }

    fn conceal(&mut self, sample_count: usize) -> Result<Vec<i16>> {
        let step = self.channels * (self.sample_rate / PLC_STEP_DIVISOR) as usize;
        let max_chunk = self.decode_buf.len() / step * step;
        let concealable = sample_count / step * step;

        // anything short of a whole step stays silent
        let mut pcm = vec![0; sample_count];
        let mut offset = 0;
        while offset < concealable {
            let len = (concealable - offset).min(max_chunk);
            self.decoder
                .decode(&[], &mut pcm[offset..offset + len], false)
                .map_err(|e| Error::decode(format!("Opus PLC failed: {}", e)))?;
            offset += len;
        }
        Ok(pcm)
    }

    fn last_unit_duration(&mut self) -> Option<usize> {
        match self.decoder.get_last_packet_duration() {
            Ok(duration) if duration > 0 => Some(duration as usize),
            Ok(_) => None,
            Err(e) => {
                debug!("Opus last packet duration unavailable: {}", e);
                None
            }
        }
    }
}

pub struct OpusAudioEncoder {
    encoder: Encoder,
    channels: usize,
    encode_buf: Vec<u8>,
}

impl OpusAudioEncoder {
    /// VoIP-mode encoder. With `fec` set, in-band FEC is tuned for
    /// `loss_percent` expected loss.
    pub fn new(params: AudioParams, fec: bool, loss_percent: u8) -> Result<Self> {
        let channels = opus_channels(&params)?;
        let mut encoder = Encoder::new(params.sample_rate, channels, Application::Voip)
            .map_err(|e| Error::config(format!("Opus encoder init failed: {}", e)))?;

        if fec {
            encoder
                .set_packet_loss_perc(loss_percent.min(100) as i32)
                .map_err(|e| Error::config(format!("can't set packet loss percent: {}", e)))?;
        }
        encoder
            .set_inband_fec(fec)
            .map_err(|e| Error::config(format!("can't set inband fec: {}", e)))?;

        Ok(Self {
            encoder,
            channels: params.channel_count(),
            encode_buf: vec![0; MAX_PACKET_BYTES],
        })
    }
}

impl AudioEncoder for OpusAudioEncoder {
    fn channels(&self) -> usize {
        self.channels
    }

    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        let len = self
            .encoder
            .encode(pcm, &mut self.encode_buf)
            .map_err(|e| Error::internal(format!("Opus encode failed: {}", e)))?;
        Ok(self.encode_buf[..len].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(frames: usize, channels: usize, offset: usize) -> Vec<i16> {
        (0..frames)
            .flat_map(|i| {
                let t = (offset + i) as f32 / 48_000.0;
                let v = ((t * 440.0 * std::f32::consts::TAU).sin() * 8_000.0) as i16;
                std::iter::repeat(v).take(channels)
            })
            .collect()
    }

    #[test]
    fn encode_decode_20ms_stereo() {
        let params = AudioParams::default();
        let mut encoder = OpusAudioEncoder::new(params, true, 25).unwrap();
        let mut decoder = OpusAudioDecoder::new(params).unwrap();

        let payload = encoder.encode(&tone(960, 2, 0)).unwrap();
        assert!(!payload.is_empty() && payload.len() <= MAX_PACKET_BYTES);

        let pcm = decoder.decode(&payload).unwrap();
        assert_eq!(pcm.len(), 1920);
        assert_eq!(decoder.last_unit_duration(), Some(960));
    }

    #[test]
    fn fec_recovers_requested_length() {
        let params = AudioParams::default();
        let mut encoder = OpusAudioEncoder::new(params, true, 25).unwrap();
        let mut decoder = OpusAudioDecoder::new(params).unwrap();

        let first = encoder.encode(&tone(960, 2, 0)).unwrap();
        let _lost = encoder.encode(&tone(960, 2, 960)).unwrap();
        let third = encoder.encode(&tone(960, 2, 1920)).unwrap();

        decoder.decode(&first).unwrap();
        let recovered = decoder.decode_fec(&third, 1920).unwrap();
        assert_eq!(recovered.len(), 1920);
    }

    #[test]
    fn conceal_fills_exact_length() {
        let params = AudioParams::default();
        let mut encoder = OpusAudioEncoder::new(params, false, 0).unwrap();
        let mut decoder = OpusAudioDecoder::new(params).unwrap();
        decoder.decode(&encoder.encode(&tone(960, 2, 0)).unwrap()).unwrap();

        assert_eq!(decoder.conceal(1920).unwrap().len(), 1920);
        // not a multiple of 2.5ms
        assert_eq!(decoder.conceal(1001).unwrap().len(), 1001);
        // longer than the largest single frame
        assert_eq!(decoder.conceal(2 * 48_000).unwrap().len(), 2 * 48_000);
    }

    #[test]
    fn garbage_payload_is_decode_error() {
        let mut decoder = OpusAudioDecoder::new(AudioParams::default()).unwrap();
        let err = decoder.decode(&[0xFF; 3]).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn rejects_unsupported_rate() {
        assert!(OpusAudioDecoder::new(AudioParams::new(44_100, 2)).is_err());
    }
}
