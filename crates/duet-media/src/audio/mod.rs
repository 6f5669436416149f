//! PCM sources and playback sinks at the edges of the pipeline.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::AudioParams;

#[cfg(feature = "device-io")]
mod device;
mod memory;
mod pace;
mod wav;

#[cfg(feature = "device-io")]
pub use device::{CaptureSource, DevicePlayback};
pub use memory::{MemorySink, MemorySource, PlayedFrames};
pub use wav::{WavRecorder, WavSource};

/// Produces fixed-size interleaved frames. `Ok(None)` marks end of input.
pub trait PcmSource: Send {
    fn next_frame(&mut self) -> Result<Option<Vec<i16>>>;
}

/// Forces a blocked [`PlaybackSink::write`] to return.
pub trait SinkWaker: Send + Sync {
    fn wake(&self);
}

/// Consumes frames at its own cadence; `write` may block until there is room.
pub trait PlaybackSink: Send {
    fn write(&mut self, frame: &[i16]) -> Result<()>;

    /// Handle usable from other threads while `write` is blocked.
    fn waker(&self) -> Arc<dyn SinkWaker>;

    /// Flushes anything pending once playback is over.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWaker;

impl SinkWaker for NoopWaker {
    fn wake(&self) {}
}

/// Names ending in `.wav`, containing a path separator, or naming an
/// existing file are files; anything else is a device name.
pub fn is_file_name(name: &str) -> bool {
    name.ends_with(".wav") || name.contains('/') || Path::new(name).exists()
}

pub fn open_source(
    name: &str,
    params: AudioParams,
    frame_duration: Duration,
) -> Result<Box<dyn PcmSource>> {
    if is_file_name(name) {
        return Ok(Box::new(WavSource::open(name, params, frame_duration)?));
    }
    open_capture(name, params, frame_duration)
}

pub fn open_sink(
    name: &str,
    params: AudioParams,
    frame_duration: Duration,
    device_buffer: Duration,
) -> Result<Box<dyn PlaybackSink>> {
    if is_file_name(name) {
        return Ok(Box::new(WavRecorder::create(name, params, frame_duration)?));
    }
    open_playback(name, params, device_buffer)
}

#[cfg(feature = "device-io")]
fn open_capture(
    name: &str,
    params: AudioParams,
    frame_duration: Duration,
) -> Result<Box<dyn PcmSource>> {
    Ok(Box::new(CaptureSource::open(name, params, frame_duration)?))
}

#[cfg(not(feature = "device-io"))]
fn open_capture(
    name: &str,
    _params: AudioParams,
    _frame_duration: Duration,
) -> Result<Box<dyn PcmSource>> {
    anyhow::bail!("capture device '{}' requested but device I/O is not built in", name)
}

#[cfg(feature = "device-io")]
fn open_playback(
    name: &str,
    params: AudioParams,
    device_buffer: Duration,
) -> Result<Box<dyn PlaybackSink>> {
    Ok(Box::new(DevicePlayback::open(name, params, device_buffer)?))
}

#[cfg(not(feature = "device-io"))]
fn open_playback(
    name: &str,
    _params: AudioParams,
    _device_buffer: Duration,
) -> Result<Box<dyn PlaybackSink>> {
    anyhow::bail!("playback device '{}' requested but device I/O is not built in", name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_are_recognized() {
        assert!(is_file_name("take1.wav"));
        assert!(is_file_name("./recordings/in"));
        assert!(!is_file_name("default"));
        assert!(!is_file_name("alsa_output.pci-0000_00_1f.3.analog-stereo"));
    }
}
