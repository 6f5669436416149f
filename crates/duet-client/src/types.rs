use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use duet_common::env_bool;
use duet_media::{AudioParams, DepacketizerConfig, JitterBufferConfig, OPUS_SAMPLE_RATES};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 7400;

/// Frame durations an Opus encoder accepts, in whole milliseconds.
pub const SOURCE_FRAME_MS: [u64; 8] = [5, 10, 20, 40, 60, 80, 100, 120];

/// Everything needed to run one end of a session.
///
/// Loadable from JSON; absent fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub listen: SocketAddr,
    /// Where encoded audio is sent. When set, only datagrams from this
    /// address are accepted.
    pub peer: Option<SocketAddr>,
    /// WAV path or capture device name.
    pub source: Option<String>,
    /// WAV path or playback device name.
    pub sink: Option<String>,
    pub rate: u32,
    pub chans: u16,
    pub source_frame_ms: u64,
    pub sink_frame_ms: u64,
    pub jitter_buf_ms: u64,
    pub max_drift_ms: u64,
    pub device_buf_ms: u64,
    /// Expected loss handed to the encoder.
    pub loss_perc: u8,
    /// Receive-side random drops, for exercising recovery.
    pub simulate_loss_perc: u8,
    pub fec: bool,
    pub debug: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            peer: None,
            source: None,
            sink: None,
            rate: 48_000,
            chans: 2,
            source_frame_ms: 40,
            sink_frame_ms: 20,
            jitter_buf_ms: 60,
            max_drift_ms: 60,
            device_buf_ms: 20,
            loss_perc: 25,
            simulate_loss_perc: 0,
            fec: true,
            debug: false,
        }
    }
}

impl PipelineConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.is_none() && self.sink.is_none() {
            bail!("at least one of source and sink should be given");
        }
        if self.source.is_some() && self.peer.is_none() {
            bail!("a peer address is required to send audio");
        }
        if !OPUS_SAMPLE_RATES.contains(&self.rate) {
            bail!("rate should be one of {:?}", OPUS_SAMPLE_RATES);
        }
        if self.chans != 1 && self.chans != 2 {
            bail!("chans should be 1 or 2");
        }
        if self.loss_perc > 100 {
            bail!("loss-perc should be in [0; 100]");
        }
        if self.simulate_loss_perc > 100 {
            bail!("simulate-loss-perc should be in [0; 100]");
        }
        if !SOURCE_FRAME_MS.contains(&self.source_frame_ms) {
            bail!("source-frame should be one of {:?} ms", SOURCE_FRAME_MS);
        }
        if self.sink_frame_ms == 0 {
            bail!("sink-frame should be positive");
        }
        if self.device_buf_ms == 0 {
            bail!("device-buf should be positive");
        }

        if let Some(peer) = self.peer {
            if !is_local_ip(peer.ip()) && !env_bool("DUET_ALLOW_PUBLIC_PEER", false) {
                return Err(anyhow!(
                    "refusing to stream unencrypted audio to public address {} without DUET_ALLOW_PUBLIC_PEER=1",
                    peer
                ));
            }
        }
        Ok(())
    }

    pub fn params(&self) -> AudioParams {
        AudioParams::new(self.rate, self.chans)
    }

    pub fn source_frame(&self) -> Duration {
        Duration::from_millis(self.source_frame_ms)
    }

    pub fn sink_frame(&self) -> Duration {
        Duration::from_millis(self.sink_frame_ms)
    }

    pub fn device_buffer(&self) -> Duration {
        Duration::from_millis(self.device_buf_ms)
    }

    pub fn jitter_config(&self) -> JitterBufferConfig {
        JitterBufferConfig {
            params: self.params(),
            frame_duration: self.sink_frame(),
            target_latency: Duration::from_millis(self.jitter_buf_ms),
            max_drift: Duration::from_millis(self.max_drift_ms),
        }
    }

    /// FEC is only attempted when the codec in use carries it.
    pub fn depacketizer_config(&self, codec_has_fec: bool) -> DepacketizerConfig {
        DepacketizerConfig::new(self.params(), self.fec && codec_has_fec)
    }
}

fn is_local_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

/// Counters shared by every stage of a running pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub frames_sent: AtomicU64,
    pub units_received: AtomicU64,
    pub units_dropped: AtomicU64,
    pub datagrams_rejected: AtomicU64,
    pub frames_played: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStatsSnapshot {
    pub frames_sent: u64,
    pub units_received: u64,
    pub units_dropped: u64,
    pub datagrams_rejected: u64,
    pub frames_played: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            units_received: self.units_received.load(Ordering::Relaxed),
            units_dropped: self.units_dropped.load(Ordering::Relaxed),
            datagrams_rejected: self.datagrams_rejected.load(Ordering::Relaxed),
            frames_played: self.frames_played.load(Ordering::Relaxed),
        }
    }
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> PipelineConfig {
        PipelineConfig {
            peer: Some("127.0.0.1:7401".parse().unwrap()),
            source: Some("in.wav".into()),
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn defaults_validate_once_a_direction_is_set() {
        assert!(PipelineConfig::default().validate().is_err());
        assert!(sender().validate().is_ok());

        let receiver = PipelineConfig {
            sink: Some("default".into()),
            ..PipelineConfig::default()
        };
        assert!(receiver.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let cases = [
            PipelineConfig { rate: 44_100, ..sender() },
            PipelineConfig { chans: 3, ..sender() },
            PipelineConfig { loss_perc: 101, ..sender() },
            PipelineConfig { simulate_loss_perc: 150, ..sender() },
            PipelineConfig { source_frame_ms: 30, ..sender() },
            PipelineConfig { sink_frame_ms: 0, ..sender() },
            PipelineConfig { peer: None, ..sender() },
        ];
        for case in cases {
            assert!(case.validate().is_err(), "{:?} should be rejected", case);
        }
    }

    #[test]
    fn public_peer_needs_opt_in() {
        let config = PipelineConfig {
            peer: Some("203.0.113.7:7400".parse().unwrap()),
            ..sender()
        };
        if !env_bool("DUET_ALLOW_PUBLIC_PEER", false) {
            assert!(config.validate().is_err());
        }
        let lan = PipelineConfig {
            peer: Some("192.168.1.20:7400".parse().unwrap()),
            ..sender()
        };
        assert!(lan.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{ "sink": "out.wav", "chans": 1, "jitter_buf_ms": 100 }"#)
                .unwrap();
        assert_eq!(config.sink.as_deref(), Some("out.wav"));
        assert_eq!(config.chans, 1);
        assert_eq!(config.jitter_buf_ms, 100);
        assert_eq!(config.rate, 48_000);
        assert_eq!(config.listen.port(), DEFAULT_PORT);
        assert!(config.fec);
    }

    #[test]
    fn media_configs_follow_fields() {
        let config = PipelineConfig {
            jitter_buf_ms: 80,
            max_drift_ms: 40,
            ..sender()
        };
        let jitter = config.jitter_config();
        assert_eq!(jitter.target_latency, Duration::from_millis(80));
        assert_eq!(jitter.max_drift, Duration::from_millis(40));
        assert_eq!(jitter.frame_duration, Duration::from_millis(20));

        assert!(config.depacketizer_config(true).fec_enabled);
        assert!(!config.depacketizer_config(false).fec_enabled);
    }
}
