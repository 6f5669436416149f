use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use hound::{SampleFormat, WavIntoSamples, WavSpec, WavWriter};
use tracing::{debug, info};

use super::pace::Pacer;
use super::{NoopWaker, PcmSource, PlaybackSink, SinkWaker};
use crate::AudioParams;

/// Reads 16-bit PCM from a WAV file, one frame per call, in real time.
pub struct WavSource {
    samples: WavIntoSamples<BufReader<File>, i16>,
    frame_size: usize,
    pacer: Option<Pacer>,
    done: bool,
}

impl WavSource {
    pub fn open(
        path: impl AsRef<Path>,
        params: AudioParams,
        frame_duration: Duration,
    ) -> Result<Self> {
        let path = path.as_ref();
        let reader = hound::WavReader::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let spec = reader.spec();

        if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != 16 {
            bail!(
                "{}: expected 16-bit integer samples, found {}-bit {:?}",
                path.display(),
                spec.bits_per_sample,
                spec.sample_format
            );
        }
        if spec.sample_rate != params.sample_rate {
            bail!(
                "{}: sample rate {} does not match configured {}",
                path.display(),
                spec.sample_rate,
                params.sample_rate
            );
        }
        if spec.channels != params.channels {
            bail!(
                "{}: {} channels, configured {}",
                path.display(),
                spec.channels,
                params.channels
            );
        }

        let frame_size = params.frame_samples(frame_duration);
        if frame_size == 0 {
            bail!("frame duration {:?} is too short", frame_duration);
        }
        info!(
            "reading {} ({} Hz, {} channels)",
            path.display(),
            spec.sample_rate,
            spec.channels
        );

        Ok(Self {
            samples: reader.into_samples::<i16>(),
            frame_size,
            pacer: Some(Pacer::new(frame_duration)),
            done: false,
        })
    }

    /// Delivers frames as fast as they are requested.
    pub fn unpaced(mut self) -> Self {
        self.pacer = None;
        self
    }
}

impl PcmSource for WavSource {
    fn next_frame(&mut self) -> Result<Option<Vec<i16>>> {
        if self.done {
            return Ok(None);
        }

        let mut frame = Vec::with_capacity(self.frame_size);
        while frame.len() < self.frame_size {
            match self.samples.next() {
                Some(sample) => frame.push(sample.context("failed to read WAV sample")?),
                None => {
                    self.done = true;
                    break;
                }
            }
        }
        if frame.is_empty() {
            debug!("end of WAV input");
            return Ok(None);
        }
        frame.resize(self.frame_size, 0);

        if let Some(pacer) = &mut self.pacer {
            pacer.wait();
        }
        Ok(Some(frame))
    }
}

/// Writes played frames to a 16-bit WAV file at real-time pace.
pub struct WavRecorder {
    writer: Option<WavWriter<BufWriter<File>>>,
    pacer: Option<Pacer>,
}

impl WavRecorder {
    pub fn create(
        path: impl AsRef<Path>,
        params: AudioParams,
        frame_duration: Duration,
    ) -> Result<Self> {
        let path = path.as_ref();
        params.validate()?;
        let spec = WavSpec {
            channels: params.channels,
            sample_rate: params.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(path, spec)
            .with_context(|| format!("failed to create {}", path.display()))?;
        info!("recording to {}", path.display());
        Ok(Self {
            writer: Some(writer),
            pacer: Some(Pacer::new(frame_duration)),
        })
    }

    pub fn unpaced(mut self) -> Self {
        self.pacer = None;
        self
    }
}

impl PlaybackSink for WavRecorder {
    fn write(&mut self, frame: &[i16]) -> Result<()> {
        if let Some(pacer) = &mut self.pacer {
            pacer.wait();
        }
        let Some(writer) = self.writer.as_mut() else {
            bail!("recorder already finished");
        };
        for &sample in frame {
            writer.write_sample(sample)?;
        }
        Ok(())
    }

    fn waker(&self) -> Arc<dyn SinkWaker> {
        Arc::new(NoopWaker)
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finalize().context("failed to finalize WAV file")?;
        }
        Ok(())
    }
}

impl Drop for WavRecorder {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            let _ = writer.finalize();
        }
    }
}
