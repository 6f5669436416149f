use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BufferSize, FromSample, Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
    SupportedBufferSize,
};
use tracing::{error, info, warn};

use super::{PcmSource, PlaybackSink, SinkWaker};
use crate::AudioParams;

/// Captured chunks in flight between the device callback and the reader.
const CAPTURE_QUEUE_DEPTH: usize = 64;
/// Upper bound on a single wait so a missed notification can't hang a writer.
const WRITE_POLL: Duration = Duration::from_millis(50);

fn find_device(host: &cpal::Host, name: &str, output: bool) -> Result<cpal::Device> {
    if name == "default" {
        let device = if output {
            host.default_output_device()
        } else {
            host.default_input_device()
        };
        return device.ok_or_else(|| anyhow!("no default audio device available"));
    }

    let mut devices = if output {
        host.output_devices()?
    } else {
        host.input_devices()?
    };
    devices
        .find(|d| d.name().map(|n| n == name).unwrap_or(false))
        .ok_or_else(|| anyhow!("audio device '{}' not found", name))
}

fn select_config(
    device: &cpal::Device,
    params: &AudioParams,
    buffer_frames: u32,
    output: bool,
) -> Result<(StreamConfig, SampleFormat)> {
    let configs: Vec<_> = if output {
        device
            .supported_output_configs()
            .map_err(|e| anyhow!("audio configs error: {}", e))?
            .collect()
    } else {
        device
            .supported_input_configs()
            .map_err(|e| anyhow!("audio configs error: {}", e))?
            .collect()
    };

    for cfg in configs {
        if cfg.channels() != params.channels {
            continue;
        }
        let rate = params.sample_rate;
        if cfg.min_sample_rate().0 > rate || cfg.max_sample_rate().0 < rate {
            continue;
        }
        let buffer_size = cfg.buffer_size().clone();
        let sample_format = cfg.sample_format();
        let mut config = cfg.with_sample_rate(SampleRate(rate)).config();
        if let SupportedBufferSize::Range { min, max } = buffer_size {
            config.buffer_size = BufferSize::Fixed(buffer_frames.clamp(min, max));
        }
        return Ok((config, sample_format));
    }

    bail!(
        "device does not support {} Hz with {} channels",
        params.sample_rate,
        params.channels
    )
}

#[derive(Debug)]
struct Ring {
    samples: VecDeque<i16>,
    capacity: usize,
    woken: bool,
}

type SharedRing = Arc<(Mutex<Ring>, Condvar)>;

fn new_ring(capacity: usize) -> SharedRing {
    Arc::new((
        Mutex::new(Ring {
            samples: VecDeque::new(),
            capacity: capacity.max(1),
            woken: false,
        }),
        Condvar::new(),
    ))
}

/// Queues `frame` once it fits. Dropped if the ring gets woken first.
fn push_frame(shared: &SharedRing, frame: &[i16]) {
    let (lock, cvar) = &**shared;
    let mut ring = lock_ring(lock);
    while !ring.woken
        && !ring.samples.is_empty()
        && ring.samples.len() + frame.len() > ring.capacity
    {
        ring = match cvar.wait_timeout(ring, WRITE_POLL) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        };
    }
    if !ring.woken {
        ring.samples.extend(frame.iter().copied());
    }
}

/// Waits for the device to play out what is queued, unless woken.
fn wait_drained(shared: &SharedRing) {
    let (lock, cvar) = &**shared;
    let mut ring = lock_ring(lock);
    if ring.woken {
        return;
    }
    while !ring.woken && !ring.samples.is_empty() {
        ring = match cvar.wait_timeout(ring, WRITE_POLL) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        };
    }
}

fn lock_ring(ring: &Mutex<Ring>) -> MutexGuard<'_, Ring> {
    match ring.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct RingWaker {
    ring: SharedRing,
}

impl SinkWaker for RingWaker {
    fn wake(&self) {
        let (lock, cvar) = &*self.ring;
        let mut ring = lock_ring(lock);
        ring.samples.clear();
        ring.woken = true;
        cvar.notify_all();
    }
}

/// Plays frames on an output device. `write` blocks while the device
/// buffer is full.
pub struct DevicePlayback {
    _stream: Stream,
    ring: SharedRing,
}

unsafe impl Send for DevicePlayback {}

impl DevicePlayback {
    pub fn open(name: &str, params: AudioParams, device_buffer: Duration) -> Result<Self> {
        params.validate()?;
        let host = cpal::default_host();
        let device = find_device(&host, name, true)?;

        let buffer_frames = params.frame_samples(device_buffer) / params.channel_count();
        let (config, sample_format) =
            select_config(&device, &params, buffer_frames.max(1) as u32, true)?;

        let ring = new_ring(params.frame_samples(device_buffer));

        let stream = match sample_format {
            SampleFormat::F32 => build_output::<f32>(&device, &config, ring.clone())?,
            SampleFormat::I16 => build_output::<i16>(&device, &config, ring.clone())?,
            SampleFormat::U16 => build_output::<u16>(&device, &config, ring.clone())?,
            other => bail!("unsupported audio sample format {:?}", other),
        };
        stream.play()?;
        info!(
            "playing on '{}' ({} Hz, {} channels)",
            device.name().unwrap_or_else(|_| name.to_string()),
            config.sample_rate.0,
            config.channels
        );

        Ok(Self {
            _stream: stream,
            ring,
        })
    }
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    ring: SharedRing,
) -> Result<Stream>
where
    T: SizedSample + FromSample<i16>,
{
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let (lock, cvar) = &*ring;
            let mut guard = lock_ring(lock);
            for sample in data.iter_mut() {
                *sample = T::from_sample(guard.samples.pop_front().unwrap_or(0));
            }
            cvar.notify_all();
        },
        |err| error!("audio output stream error: {}", err),
        None,
    )?;
    Ok(stream)
}

impl PlaybackSink for DevicePlayback {
    fn write(&mut self, frame: &[i16]) -> Result<()> {
        push_frame(&self.ring, frame);
        Ok(())
    }

    fn waker(&self) -> Arc<dyn SinkWaker> {
        Arc::new(RingWaker {
            ring: self.ring.clone(),
        })
    }

    fn finish(&mut self) -> Result<()> {
        // let queued audio drain before the stream is dropped
        wait_drained(&self.ring);
        Ok(())
    }
}

/// Captures fixed-size frames from an input device.
pub struct CaptureSource {
    _stream: Stream,
    chunks: Receiver<Vec<i16>>,
    pending: VecDeque<i16>,
    frame_size: usize,
}

unsafe impl Send for CaptureSource {}

impl CaptureSource {
    pub fn open(name: &str, params: AudioParams, frame_duration: Duration) -> Result<Self> {
        params.validate()?;
        let frame_size = params.frame_samples(frame_duration);
        if frame_size == 0 {
            bail!("frame duration {:?} is too short", frame_duration);
        }

        let host = cpal::default_host();
        let device = find_device(&host, name, false)?;
        let frames_per_buffer = (frame_size / params.channel_count()) as u32;
        let (config, sample_format) = select_config(&device, &params, frames_per_buffer, false)?;

        let (tx, rx) = mpsc::sync_channel(CAPTURE_QUEUE_DEPTH);
        let stream = match sample_format {
            SampleFormat::F32 => build_input::<f32>(&device, &config, tx)?,
            SampleFormat::I16 => build_input::<i16>(&device, &config, tx)?,
            SampleFormat::U16 => build_input::<u16>(&device, &config, tx)?,
            other => bail!("unsupported audio sample format {:?}", other),
        };
        stream.play()?;
        info!(
            "capturing from '{}' ({} Hz, {} channels)",
            device.name().unwrap_or_else(|_| name.to_string()),
            config.sample_rate.0,
            config.channels
        );

        Ok(Self {
            _stream: stream,
            chunks: rx,
            pending: VecDeque::with_capacity(frame_size * 2),
            frame_size,
        })
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    tx: SyncSender<Vec<i16>>,
) -> Result<Stream>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _| {
            let chunk: Vec<i16> = data.iter().map(|&s| i16::from_sample(s)).collect();
            match tx.try_send(chunk) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(_)) => warn!("capture queue full, dropping input"),
            }
        },
        |err| error!("audio input stream error: {}", err),
        None,
    )?;
    Ok(stream)
}

impl PcmSource for CaptureSource {
    fn next_frame(&mut self) -> Result<Option<Vec<i16>>> {
        while self.pending.len() < self.frame_size {
            let chunk = self
                .chunks
                .recv()
                .map_err(|_| anyhow!("capture stream closed"))?;
            self.pending.extend(chunk);
        }
        Ok(Some(self.pending.drain(..self.frame_size).collect()))
    }
}
