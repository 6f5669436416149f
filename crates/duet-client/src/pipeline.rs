//! Wires sources, codecs, the network and sinks into a running session.
//!
//! Send path: capture thread -> bounded channel -> encode and send task.
//! Receive path: receive task -> depacketizer -> jitter buffer -> playback
//! thread driven by the sink's own cadence. The first stage to finish or
//! fail decides how the session ends; teardown then stops everything else.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use duet_media::audio::{open_sink, open_source};
use duet_media::{
    AudioDecoder, AudioEncoder, Depacketizer, DiagnosticSink, JitterBuffer, LogSink, PcmSource,
    PlaybackSink, SinkWaker,
};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle as TaskHandle;
use tracing::{debug, error, info};

use crate::transport::{bind_socket, LossSimulator, UnitReceiver, UnitSender};
use crate::types::{bump, PipelineConfig, PipelineStats};

/// Captured frames in flight between the capture thread and the sender.
const CAPTURE_CHANNEL_DEPTH: usize = 64;
/// How often a possibly blocked sink is woken during teardown.
const WAKE_INTERVAL: Duration = Duration::from_millis(50);

/// Shutdown flag observable from threads and tasks. Stopping twice is a no-op.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineExit {
    /// The source ran out and everything it produced was sent.
    SourceEof,
    /// Ctrl-C or SIGTERM.
    Interrupted,
    /// [`StopSignal::stop`] was called.
    Stopped,
}

enum StageEvent {
    SourceEof,
    Failed(anyhow::Error),
}

/// Opened audio endpoints and codecs. Either direction may be absent.
pub struct Endpoints {
    pub source: Option<Box<dyn PcmSource>>,
    pub encoder: Option<Box<dyn AudioEncoder>>,
    pub sink: Option<Box<dyn PlaybackSink>>,
    pub decoder: Option<Box<dyn AudioDecoder>>,
    /// Whether `decoder` can recover from in-band redundancy.
    pub decoder_has_fec: bool,
    pub diagnostics: Arc<dyn DiagnosticSink>,
}

impl Endpoints {
    /// Opens the configured source and sink with the best codec built in.
    pub fn open(config: &PipelineConfig) -> Result<Self> {
        let params = config.params();
        let mut endpoints = Self {
            source: None,
            encoder: None,
            sink: None,
            decoder: None,
            decoder_has_fec: false,
            diagnostics: Arc::new(LogSink::new(config.debug)),
        };

        if let Some(name) = &config.source {
            endpoints.source = Some(open_source(name, params, config.source_frame())?);
            endpoints.encoder = Some(new_encoder(config)?);
        }
        if let Some(name) = &config.sink {
            endpoints.sink = Some(open_sink(
                name,
                params,
                config.sink_frame(),
                config.device_buffer(),
            )?);
            let (decoder, has_fec) = new_decoder(config)?;
            endpoints.decoder = Some(decoder);
            endpoints.decoder_has_fec = has_fec;
        }
        Ok(endpoints)
    }
}

#[cfg(feature = "opus-support")]
fn new_encoder(config: &PipelineConfig) -> Result<Box<dyn AudioEncoder>> {
    Ok(Box::new(duet_media::OpusAudioEncoder::new(
        config.params(),
        config.fec,
        config.loss_perc,
    )?))
}

#[cfg(not(feature = "opus-support"))]
fn new_encoder(config: &PipelineConfig) -> Result<Box<dyn AudioEncoder>> {
    tracing::warn!("built without Opus support, sending raw PCM");
    Ok(Box::new(duet_media::PcmEncoder::new(config.params().channel_count())?))
}

#[cfg(feature = "opus-support")]
fn new_decoder(config: &PipelineConfig) -> Result<(Box<dyn AudioDecoder>, bool)> {
    Ok((
        Box::new(duet_media::OpusAudioDecoder::new(config.params())?),
        true,
    ))
}

#[cfg(not(feature = "opus-support"))]
fn new_decoder(config: &PipelineConfig) -> Result<(Box<dyn AudioDecoder>, bool)> {
    Ok((
        Box::new(duet_media::PcmDecoder::new(config.params().channel_count())?),
        false,
    ))
}

pub struct Pipeline {
    config: PipelineConfig,
    socket: Arc<UdpSocket>,
    stop: StopSignal,
    stats: Arc<PipelineStats>,
    handle_signals: bool,
}

impl Pipeline {
    pub async fn bind(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let socket = bind_socket(config.listen).await?;
        info!("listening on {}", socket.local_addr()?);
        Ok(Self {
            config,
            socket: Arc::new(socket),
            stop: StopSignal::new(),
            stats: Arc::new(PipelineStats::default()),
            handle_signals: true,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Whether Ctrl-C and SIGTERM end the session. On by default.
    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    pub async fn run(self, endpoints: Endpoints) -> Result<PipelineExit> {
        let Endpoints {
            source,
            encoder,
            sink,
            decoder,
            decoder_has_fec,
            diagnostics,
        } = endpoints;

        // All fallible setup happens before anything is spawned.
        let receive = match (sink, decoder) {
            (Some(sink), Some(decoder)) => {
                let jitter = Arc::new(JitterBuffer::new(
                    self.config.jitter_config(),
                    diagnostics.clone(),
                )?);
                let depacketizer = Depacketizer::new(
                    decoder,
                    self.config.depacketizer_config(decoder_has_fec),
                    diagnostics.clone(),
                )?;
                Some((sink, jitter, depacketizer))
            }
            _ => None,
        };
        let send = match (source, encoder) {
            (Some(source), Some(encoder)) => {
                let peer = self
                    .config
                    .peer
                    .ok_or_else(|| anyhow!("a peer address is required to send audio"))?;
                Some((source, encoder, peer))
            }
            _ => None,
        };

        let (events_tx, mut events_rx) = mpsc::channel::<StageEvent>(4);
        let mut tasks: Vec<TaskHandle<()>> = Vec::new();
        let mut playback: Option<(JoinHandle<()>, Arc<dyn SinkWaker>)> = None;
        let mut jitter_buffer: Option<Arc<JitterBuffer>> = None;

        if let Some((sink, jitter, depacketizer)) = receive {
            let receiver = UnitReceiver::new(
                self.socket.clone(),
                self.config.peer,
                LossSimulator::new(self.config.simulate_loss_perc),
                self.stats.clone(),
            );

            let events = events_tx.clone();
            let recv_jitter = jitter.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = receive_loop(receiver, depacketizer, recv_jitter).await {
                    let _ = events.try_send(StageEvent::Failed(e));
                }
            }));
            jitter_buffer = Some(jitter.clone());

            let waker = sink.waker();
            let events = events_tx.clone();
            let stats = self.stats.clone();
            let spawned = thread::Builder::new()
                .name("duet-playback".into())
                .spawn(move || {
                    if let Err(e) = playback_loop(jitter, sink, stats) {
                        let _ = events.try_send(StageEvent::Failed(e));
                    }
                });
            match spawned {
                Ok(handle) => playback = Some((handle, waker)),
                Err(e) => {
                    self.abort(&tasks, jitter_buffer.as_deref());
                    return Err(e).context("failed to spawn playback thread");
                }
            }
        }

        if let Some((source, encoder, peer)) = send {
            let sender = UnitSender::new(self.socket.clone(), peer, encoder.channels());
            let (batch_tx, batch_rx) = mpsc::channel(CAPTURE_CHANNEL_DEPTH);

            let stop = self.stop.clone();
            let spawned = thread::Builder::new()
                .name("duet-capture".into())
                .spawn(move || capture_loop(source, batch_tx, stop));
            if let Err(e) = spawned {
                self.abort(&tasks, jitter_buffer.as_deref());
                if let Some((_, waker)) = &playback {
                    waker.wake();
                }
                return Err(e).context("failed to spawn capture thread");
            }

            let stats = self.stats.clone();
            let events = events_tx.clone();
            tasks.push(tokio::spawn(async move {
                let event = match send_loop(batch_rx, encoder, sender, stats).await {
                    Ok(()) => StageEvent::SourceEof,
                    Err(e) => StageEvent::Failed(e),
                };
                let _ = events.try_send(event);
            }));
            info!("sending to {}", peer);
        }

        let outcome = tokio::select! {
            event = events_rx.recv() => match event {
                Some(StageEvent::SourceEof) => {
                    info!("source reached end of input");
                    Ok(PipelineExit::SourceEof)
                }
                Some(StageEvent::Failed(e)) => Err(e),
                None => Ok(PipelineExit::Stopped),
            },
            res = shutdown_signal(), if self.handle_signals => {
                res.map(|()| {
                    info!("interrupted");
                    PipelineExit::Interrupted
                })
            }
            _ = self.stop.stopped() => Ok(PipelineExit::Stopped),
        };

        self.abort(&tasks, jitter_buffer.as_deref());

        if let Some((handle, waker)) = playback {
            let mut ticker = tokio::time::interval(WAKE_INTERVAL);
            while !handle.is_finished() {
                waker.wake();
                ticker.tick().await;
            }
            if handle.join().is_err() {
                error!("playback thread panicked");
            }
        }

        let stats = self.stats.snapshot();
        info!(
            sent = stats.frames_sent,
            received = stats.units_received,
            dropped = stats.units_dropped,
            rejected = stats.datagrams_rejected,
            played = stats.frames_played,
            "pipeline stopped"
        );
        if let Some(jitter) = &jitter_buffer {
            if let Ok(jstats) = jitter.stats() {
                debug!(?jstats, "jitter buffer totals");
            }
        }

        outcome
    }

    fn abort(&self, tasks: &[TaskHandle<()>], jitter: Option<&JitterBuffer>) {
        self.stop.stop();
        if let Some(jitter) = jitter {
            jitter.stop();
        }
        for task in tasks {
            task.abort();
        }
    }
}

fn capture_loop(
    mut source: Box<dyn PcmSource>,
    batches: mpsc::Sender<Result<Vec<i16>>>,
    stop: StopSignal,
) {
    while !stop.is_stopped() {
        let batch = match source.next_frame() {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => break,
            Err(e) => Err(e.context("source failed")),
        };
        let failed = batch.is_err();
        if batches.blocking_send(batch).is_err() || failed {
            break;
        }
    }
    debug!("capture finished");
}

async fn send_loop(
    mut batches: mpsc::Receiver<Result<Vec<i16>>>,
    mut encoder: Box<dyn AudioEncoder>,
    mut sender: UnitSender,
    stats: Arc<PipelineStats>,
) -> Result<()> {
    while let Some(batch) = batches.recv().await {
        let pcm = batch?;
        let payload = encoder.encode(&pcm).context("can't encode frame")?;
        sender.send(payload, pcm.len()).await?;
        bump(&stats.frames_sent);
    }
    Ok(())
}

async fn receive_loop(
    mut receiver: UnitReceiver,
    mut depacketizer: Depacketizer<Box<dyn AudioDecoder>>,
    jitter: Arc<JitterBuffer>,
) -> Result<()> {
    loop {
        let unit = receiver.recv().await?;
        let pcm = depacketizer
            .process(&unit)
            .context("can't decode audio unit")?;
        if pcm.is_empty() {
            continue;
        }
        if let Err(e) = jitter.write(&pcm) {
            if e.is_fatal() {
                error!("jitter buffer corrupted on write: {}", e);
            }
            return Err(e.into());
        }
    }
}

fn playback_loop(
    jitter: Arc<JitterBuffer>,
    mut sink: Box<dyn PlaybackSink>,
    stats: Arc<PipelineStats>,
) -> Result<()> {
    loop {
        let frame = match jitter.read() {
            Ok(frame) => frame,
            Err(e) if e.is_closed() => break,
            Err(e) => {
                if e.is_fatal() {
                    error!("jitter buffer corrupted on read: {}", e);
                }
                return Err(e.into());
            }
        };
        sink.write(&frame).context("playback failed")?;
        bump(&stats.frames_played);
    }
    sink.finish()?;
    debug!("playback finished");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_signal_is_idempotent_and_shared() {
        let stop = StopSignal::new();
        let observer = stop.clone();
        assert!(!observer.is_stopped());

        stop.stop();
        stop.stop();
        assert!(observer.is_stopped());
        tokio::time::timeout(Duration::from_secs(1), observer.stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stopped_wakes_waiters() {
        let stop = StopSignal::new();
        let waiter = {
            let stop = stop.clone();
            tokio::spawn(async move { stop.stopped().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
