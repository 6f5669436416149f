//! UDP transport for encoded audio units.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use duet_media::{EncodedUnit, RateLimiter};
use duet_proto::{ts_advance, AudioPacket};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use socket2::SockRef;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::types::{bump, PipelineStats};

/// DSCP EF (46) in the upper six bits of the TOS byte.
const TOS_EF: u32 = 0xB8;
const MAX_DATAGRAM: usize = 65_536;

pub async fn bind_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    if let Err(e) = SockRef::from(&socket).set_tos_v4(TOS_EF) {
        debug!("failed to set DSCP/TOS: {}", e);
    }
    Ok(socket)
}

/// Frames encoded units and sends them to the peer.
pub struct UnitSender {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    channels: usize,
    sequence: u32,
    timestamp: u32,
}

impl UnitSender {
    /// Sequence and timestamp start at random values.
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr, channels: usize) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            socket,
            peer,
            channels: channels.max(1),
            sequence: rng.gen(),
            timestamp: rng.gen(),
        }
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Sends one unit encoding `samples` interleaved samples.
    pub async fn send(&mut self, payload: Vec<u8>, samples: usize) -> Result<()> {
        let packet = AudioPacket {
            sequence: self.sequence,
            timestamp: self.timestamp,
            payload: Bytes::from(payload),
        };
        let datagram = packet.encode()?;
        self.socket
            .send_to(&datagram, self.peer)
            .await
            .with_context(|| format!("failed to send to {}", self.peer))?;

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = ts_advance(self.timestamp, samples / self.channels);
        Ok(())
    }
}

/// Drops units at random with a fixed probability.
#[derive(Debug)]
pub struct LossSimulator {
    percent: u8,
    rng: StdRng,
}

impl LossSimulator {
    pub fn new(percent: u8) -> Self {
        Self {
            percent: percent.min(100),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(percent: u8, seed: u64) -> Self {
        Self {
            percent: percent.min(100),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn should_drop(&mut self) -> bool {
        self.percent > 0 && self.rng.gen_range(0..100u8) < self.percent
    }
}

/// Receives datagrams and yields the units worth depacketizing.
///
/// Datagrams from unexpected senders or with bad framing are counted and
/// skipped; the simulated loss applies after framing checks.
pub struct UnitReceiver {
    socket: Arc<UdpSocket>,
    peer: Option<SocketAddr>,
    loss: LossSimulator,
    stats: Arc<PipelineStats>,
    reject_log: RateLimiter,
    buf: Vec<u8>,
}

impl UnitReceiver {
    pub fn new(
        socket: Arc<UdpSocket>,
        peer: Option<SocketAddr>,
        loss: LossSimulator,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            socket,
            peer,
            loss,
            stats,
            reject_log: RateLimiter::new(1.0, 5),
            buf: vec![0; MAX_DATAGRAM],
        }
    }

    pub async fn recv(&mut self) -> Result<EncodedUnit> {
        loop {
            let (len, from) = self
                .socket
                .recv_from(&mut self.buf)
                .await
                .context("failed to receive datagram")?;

            if self.peer.is_some_and(|peer| peer != from) {
                bump(&self.stats.datagrams_rejected);
                if self.reject_log.allow() {
                    debug!("ignoring datagram from unexpected sender {}", from);
                }
                continue;
            }

            let packet = match AudioPacket::decode(Bytes::copy_from_slice(&self.buf[..len])) {
                Ok(packet) => packet,
                Err(e) => {
                    bump(&self.stats.datagrams_rejected);
                    if self.reject_log.allow() {
                        warn!("rejected datagram from {}: {}", from, e);
                    }
                    continue;
                }
            };
            bump(&self.stats.units_received);

            if self.loss.should_drop() {
                bump(&self.stats.units_dropped);
                continue;
            }
            return Ok(packet.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    async fn loopback() -> Arc<UdpSocket> {
        Arc::new(bind_socket("127.0.0.1:0".parse().unwrap()).await.unwrap())
    }

    #[test]
    fn loss_simulator_extremes() {
        let mut never = LossSimulator::new(0);
        let mut always = LossSimulator::new(100);
        for _ in 0..1_000 {
            assert!(!never.should_drop());
            assert!(always.should_drop());
        }
    }

    #[test]
    fn loss_simulator_rate_is_roughly_right() {
        let mut sim = LossSimulator::with_seed(25, 7);
        let dropped = (0..10_000).filter(|_| sim.should_drop()).count();
        assert!((2_000..3_000).contains(&dropped), "dropped {}", dropped);
    }

    #[tokio::test]
    async fn timestamps_advance_by_samples_per_channel() {
        let rx_socket = loopback().await;
        let tx_socket = loopback().await;
        let peer = rx_socket.local_addr().unwrap();
        let stats = Arc::new(PipelineStats::default());

        let mut sender = UnitSender::new(tx_socket.clone(), peer, 2);
        let mut receiver = UnitReceiver::new(
            rx_socket,
            Some(tx_socket.local_addr().unwrap()),
            LossSimulator::new(0),
            stats.clone(),
        );

        let start = sender.timestamp();
        sender.send(vec![1, 2, 3, 4], 1920).await.unwrap();
        sender.send(vec![5, 6], 960).await.unwrap();

        let first = receiver.recv().await.unwrap();
        let second = receiver.recv().await.unwrap();
        assert_eq!(first.timestamp, start);
        assert_eq!(&first.payload[..], &[1, 2, 3, 4]);
        assert_eq!(second.timestamp, start.wrapping_add(960));
        assert_eq!(sender.timestamp(), start.wrapping_add(960 + 480));
        assert_eq!(stats.units_received.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn foreign_and_malformed_datagrams_are_skipped() {
        let rx_socket = loopback().await;
        let tx_socket = loopback().await;
        let stranger = loopback().await;
        let addr = rx_socket.local_addr().unwrap();
        let stats = Arc::new(PipelineStats::default());

        let mut receiver = UnitReceiver::new(
            rx_socket,
            Some(tx_socket.local_addr().unwrap()),
            LossSimulator::new(0),
            stats.clone(),
        );
        let mut sender = UnitSender::new(stranger.clone(), addr, 1);
        sender.send(vec![9, 9], 1).await.unwrap();
        tx_socket.send_to(b"not audio", addr).await.unwrap();
        let mut sender = UnitSender::new(tx_socket, addr, 1);
        sender.send(vec![7, 7], 1).await.unwrap();

        let unit = receiver.recv().await.unwrap();
        assert_eq!(&unit.payload[..], &[7, 7]);
        assert_eq!(stats.datagrams_rejected.load(Ordering::Relaxed), 2);
    }
}
