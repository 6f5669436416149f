//! Duet wire framing and timestamp arithmetic.
//!
//! This crate provides:
//! - Datagram framing for encoded audio units
//! - Wraparound-safe arithmetic over the 32-bit sample clock

#![forbid(unsafe_code)]

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const DUET_VERSION: u16 = 1;

pub const DUET_MAGIC: [u8; 2] = [0x44, 0x55]; // 'DU'

/// Audio datagram header (14 bytes)
/// [Magic (2B)][Version (2B)][Sequence (4B)][Timestamp (4B)][Csum (2B)]
pub const HEADER_SIZE: usize = 14;

const CSUM_POS: usize = HEADER_SIZE - 2;

/// Largest payload that still fits a single UDP datagram.
pub const MAX_PAYLOAD_BYTES: usize = 65_507 - HEADER_SIZE;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("packet too short: {0}")]
    TooShort(usize),
    #[error("invalid magic: {0:?}")]
    InvalidMagic([u8; 2]),
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u16),
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

/// One encoded unit as carried on the wire.
///
/// `timestamp` counts samples per channel at the codec clock rate and wraps
/// modulo 2^32. An empty payload is legal and carries no samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPacket {
    pub sequence: u32,
    pub timestamp: u32,
    pub payload: Bytes,
}

impl AudioPacket {
    pub fn encode(&self) -> Result<Bytes, ProtoError> {
        if self.payload.len() > MAX_PAYLOAD_BYTES {
            return Err(ProtoError::PayloadTooLarge(self.payload.len()));
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_slice(&DUET_MAGIC);
        buf.put_u16(DUET_VERSION);
        buf.put_u32(self.sequence);
        buf.put_u32(self.timestamp);

        let csum = checksum(&buf[..CSUM_POS], &self.payload);
        buf.put_u16(csum);
        buf.put_slice(&self.payload);

        Ok(buf.freeze())
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self, ProtoError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtoError::TooShort(bytes.len()));
        }

        if bytes[0..2] != DUET_MAGIC {
            return Err(ProtoError::InvalidMagic([bytes[0], bytes[1]]));
        }

        let expected = checksum(&bytes[..CSUM_POS], &bytes[HEADER_SIZE..]);

        bytes.advance(2);
        let version = bytes.get_u16();
        if version != DUET_VERSION {
            return Err(ProtoError::UnsupportedVersion(version));
        }
        let sequence = bytes.get_u32();
        let timestamp = bytes.get_u32();
        if bytes.get_u16() != expected {
            return Err(ProtoError::ChecksumMismatch);
        }

        Ok(Self {
            sequence,
            timestamp,
            payload: bytes,
        })
    }
}

fn checksum(header: &[u8], payload: &[u8]) -> u16 {
    let mut state = crc16::State::<crc16::KERMIT>::new();
    state.update(header);
    state.update(payload);
    state.get()
}

/// Signed distance `a - b` on the 32-bit sample clock.
///
/// Positive when `a` is ahead of `b`, correct across the 2^32 wrap as long
/// as the true distance is below 2^31.
pub fn ts_diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

/// Advances a sample-clock value by `samples`, modulo 2^32.
pub fn ts_advance(ts: u32, samples: usize) -> u32 {
    ts.wrapping_add(samples as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> AudioPacket {
        AudioPacket {
            sequence: 7,
            timestamp: 0xFFFF_FC40,
            payload: Bytes::from_static(&[0xFC, 0x01, 0x02, 0x03]),
        }
    }

    #[test]
    fn audio_packet_roundtrip() {
        let packet = sample_packet();
        let encoded = packet.encode().unwrap();
        assert_eq!(encoded.len(), HEADER_SIZE + 4);
        assert_eq!(AudioPacket::decode(encoded).unwrap(), packet);
    }

    #[test]
    fn audio_packet_empty_payload() {
        let packet = AudioPacket {
            sequence: 0,
            timestamp: 960,
            payload: Bytes::new(),
        };
        let decoded = AudioPacket::decode(packet.encode().unwrap()).unwrap();
        assert!(decoded.payload.is_empty());
        assert_eq!(decoded.timestamp, 960);
    }

    #[test]
    fn audio_packet_too_short() {
        let data = Bytes::from_static(&[0x44, 0x55, 0x00]);
        assert_eq!(AudioPacket::decode(data), Err(ProtoError::TooShort(3)));
    }

    #[test]
    fn audio_packet_invalid_magic() {
        let mut data = sample_packet().encode().unwrap().to_vec();
        data[0] = b'X';
        assert_eq!(
            AudioPacket::decode(Bytes::from(data)),
            Err(ProtoError::InvalidMagic([b'X', b'U']))
        );
    }

    #[test]
    fn audio_packet_unsupported_version() {
        let mut data = sample_packet().encode().unwrap().to_vec();
        data[2..4].copy_from_slice(&9u16.to_be_bytes());
        assert_eq!(
            AudioPacket::decode(Bytes::from(data)),
            Err(ProtoError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn audio_packet_corrupted_payload() {
        let mut data = sample_packet().encode().unwrap().to_vec();
        let last = data.len() - 1;
        data[last] ^= 0x40;
        assert_eq!(
            AudioPacket::decode(Bytes::from(data)),
            Err(ProtoError::ChecksumMismatch)
        );
    }

    #[test]
    fn audio_packet_payload_too_large() {
        let packet = AudioPacket {
            sequence: 1,
            timestamp: 0,
            payload: Bytes::from(vec![0u8; MAX_PAYLOAD_BYTES + 1]),
        };
        assert_eq!(
            packet.encode(),
            Err(ProtoError::PayloadTooLarge(MAX_PAYLOAD_BYTES + 1))
        );
    }

    #[test]
    fn ts_diff_across_wrap() {
        assert_eq!(ts_diff(10, u32::MAX - 9), 20);
        assert_eq!(ts_diff(u32::MAX - 9, 10), -20);
        assert_eq!(ts_diff(960, 0), 960);
        assert_eq!(ts_diff(0, 960), -960);
        assert_eq!(ts_diff(5, 5), 0);
    }

    #[test]
    fn ts_advance_wraps() {
        assert_eq!(ts_advance(u32::MAX - 479, 960), 480);
        assert_eq!(ts_advance(0, 960), 960);
    }
}
