//! Adaptive jitter buffer between the depacketizer and the playback sink.
//!
//! The writer appends decoded chunks of any size at network pace. The reader
//! takes exactly one frame per call at the sink's pace and never waits: a
//! short queue is padded with silence.
//!
//! Latency is tracked with two sample counters rather than the queue length,
//! so that an underrun (the reader advancing past data not yet written) is
//! remembered and the late samples are dropped when they finally arrive.
//! When the buffered amount leaves `[target - drift, target + drift]` the
//! counters are rebased and the buffer ramps back up to the target before
//! steady playback resumes.
//!
//! All state sits behind one mutex; every public call is serialized.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use duet_common::{Error, Result};

use crate::diag::{DiagnosticEvent, DiagnosticSink};
use crate::AudioParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterBufferConfig {
    pub params: AudioParams,
    /// Duration of each frame handed to the sink.
    pub frame_duration: Duration,
    /// Buffered duration aimed for at steady state.
    pub target_latency: Duration,
    /// Allowed deviation from the target before a reset.
    pub max_drift: Duration,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        Self {
            params: AudioParams::default(),
            frame_duration: Duration::from_millis(20),
            target_latency: Duration::from_millis(60),
            max_drift: Duration::from_millis(60),
        }
    }
}

/// Cumulative counters. Sample counts are interleaved.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JitterStats {
    pub frames: u64,
    pub silent_startup_frames: u64,
    pub underruns: u64,
    pub padded_samples: u64,
    pub dropped_samples: u64,
    pub trimmed_samples: u64,
    pub resets: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterSnapshot {
    pub read_pos: u64,
    pub write_pos: u64,
    pub queued: usize,
    pub starting: bool,
    pub closed: bool,
}

impl JitterSnapshot {
    pub fn buffered(&self) -> i64 {
        self.write_pos.wrapping_sub(self.read_pos) as i64
    }
}

#[derive(Debug)]
struct Inner {
    queue: VecDeque<i16>,
    read_pos: u64,
    write_pos: u64,
    starting: bool,
    closed: bool,
    stats: JitterStats,
}

impl Inner {
    fn buffered(&self) -> i64 {
        self.write_pos.wrapping_sub(self.read_pos) as i64
    }
}

pub struct JitterBuffer {
    frame_size: usize,
    target_size: usize,
    min_size: i64,
    max_size: i64,
    inner: Mutex<Inner>,
    sink: Arc<dyn DiagnosticSink>,
}

impl JitterBuffer {
    pub fn new(config: JitterBufferConfig, sink: Arc<dyn DiagnosticSink>) -> Result<Self> {
        config.params.validate()?;

        let frame_size = config.params.frame_samples(config.frame_duration);
        if frame_size == 0 {
            return Err(Error::config(format!(
                "frame duration {:?} yields an empty frame",
                config.frame_duration
            )));
        }
        let target_size = config.params.frame_samples(config.target_latency);
        let drift_size = config.params.frame_samples(config.max_drift);

        Ok(Self {
            frame_size,
            target_size,
            min_size: target_size as i64 - drift_size as i64,
            max_size: (target_size + drift_size) as i64,
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(target_size + 2 * frame_size),
                read_pos: 0,
                write_pos: 0,
                starting: true,
                closed: false,
                stats: JitterStats::default(),
            }),
            sink,
        })
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn target_size(&self) -> usize {
        self.target_size
    }

    /// Appends a decoded chunk. A no-op once stopped.
    ///
    /// Samples the reader has already passed are dropped from the front of
    /// the chunk, but still count toward the write position.
    pub fn write(&self, samples: &[i16]) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.closed {
            return Ok(());
        }

        let mut fresh = samples;
        let buffered = inner.buffered();
        if buffered < 0 {
            let stale = (buffered.unsigned_abs() as usize).min(samples.len());
            fresh = &samples[stale..];
            if stale > 0 {
                inner.stats.dropped_samples += stale as u64;
                self.sink.record(DiagnosticEvent::Dropped { samples: stale });
            }
        }

        inner.queue.extend(fresh.iter().copied());
        inner.write_pos += samples.len() as u64;

        self.validate(&mut inner)
    }

    /// Returns exactly one frame. Fails with `Error::Closed` once stopped.
    pub fn read(&self) -> Result<Vec<i16>> {
        let mut inner = self.lock()?;
        if inner.closed {
            return Err(Error::closed("jitter buffer is stopped"));
        }

        if !inner.starting {
            let buffered = inner.buffered();
            if buffered <= self.min_size || buffered >= self.max_size {
                self.reset(&mut inner, buffered);
                self.validate(&mut inner)?;
                inner.starting = true;
            }
        }

        if inner.starting {
            let buffered = inner.buffered();
            if buffered < self.target_size as i64 {
                inner.stats.silent_startup_frames += 1;
                return Ok(vec![0; self.frame_size]);
            }

            let ceiling = (self.target_size + self.frame_size) as i64;
            if buffered > ceiling {
                self.trim(&mut inner, (buffered - ceiling) as usize);
            }
        }

        self.validate(&mut inner)?;
        inner.starting = false;

        Ok(self.shift_frame(&mut inner))
    }

    /// Marks the buffer closed. Safe to call repeatedly and concurrently.
    pub fn stop(&self) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.closed = true;
    }

    pub fn is_stopped(&self) -> bool {
        match self.inner.lock() {
            Ok(guard) => guard.closed,
            Err(_) => true,
        }
    }

    /// Signed `write_pos - read_pos`.
    pub fn buffered(&self) -> Result<i64> {
        Ok(self.lock()?.buffered())
    }

    pub fn snapshot(&self) -> Result<JitterSnapshot> {
        let inner = self.lock()?;
        Ok(JitterSnapshot {
            read_pos: inner.read_pos,
            write_pos: inner.write_pos,
            queued: inner.queue.len(),
            starting: inner.starting,
            closed: inner.closed,
        })
    }

    pub fn stats(&self) -> Result<JitterStats> {
        Ok(self.lock()?.stats)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::corruption("jitter buffer lock poisoned"))
    }

    fn shift_frame(&self, inner: &mut Inner) -> Vec<i16> {
        self.sink.record(DiagnosticEvent::BufferLevel {
            buffered: inner.buffered(),
            target: self.target_size,
        });

        inner.read_pos += self.frame_size as u64;
        inner.stats.frames += 1;

        if inner.queue.len() >= self.frame_size {
            return inner.queue.drain(..self.frame_size).collect();
        }

        let mut frame: Vec<i16> = inner.queue.drain(..).collect();
        let padded = self.frame_size - frame.len();
        frame.resize(self.frame_size, 0);

        inner.stats.underruns += 1;
        inner.stats.padded_samples += padded as u64;
        self.sink.record(DiagnosticEvent::Underrun { padded });

        frame
    }

    fn reset(&self, inner: &mut Inner, buffered: i64) {
        inner.stats.resets += 1;
        self.sink.record(DiagnosticEvent::Reset { buffered });

        inner.read_pos = 0;
        inner.write_pos = inner.queue.len() as u64;
    }

    /// Drops the `count` oldest samples.
    fn trim(&self, inner: &mut Inner, count: usize) {
        let dropped = count.min(inner.queue.len());
        inner.queue.drain(..dropped);
        inner.read_pos += count as u64;
        inner.stats.trimmed_samples += dropped as u64;
    }

    /// Checks the queue against the position counters. A mismatch closes
    /// the buffer for good.
    fn validate(&self, inner: &mut Inner) -> Result<()> {
        let buffered = inner.buffered();
        let expected = if buffered >= 0 { buffered as usize } else { 0 };
        if inner.queue.len() == expected {
            return Ok(());
        }

        inner.closed = true;
        Err(Error::corruption(format!(
            "queue holds {} samples but positions say {} (read {}, write {})",
            inner.queue.len(),
            buffered,
            inner.read_pos,
            inner.write_pos
        )))
    }

    #[cfg(test)]
    fn corrupt(&self) {
        self.inner.lock().unwrap().queue.push_back(0);
    }
}
