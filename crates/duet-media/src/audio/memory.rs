use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use super::pace::Pacer;
use super::{NoopWaker, PcmSource, PlaybackSink, SinkWaker};

/// Frames held in memory, optionally released at real-time pace.
#[derive(Debug, Clone)]
pub struct MemorySource {
    frames: VecDeque<Vec<i16>>,
    pacer: Option<Pacer>,
}

impl MemorySource {
    pub fn new(frames: Vec<Vec<i16>>) -> Self {
        Self {
            frames: frames.into(),
            pacer: None,
        }
    }

    /// Splits `signal` into frames of `frame_size`, zero-padding the last.
    pub fn from_signal(signal: &[i16], frame_size: usize) -> Self {
        let frames = signal
            .chunks(frame_size.max(1))
            .map(|chunk| {
                let mut frame = chunk.to_vec();
                frame.resize(frame_size, 0);
                frame
            })
            .collect();
        Self::new(frames)
    }

    pub fn paced(mut self, interval: Duration) -> Self {
        self.pacer = Some(Pacer::new(interval));
        self
    }
}

impl PcmSource for MemorySource {
    fn next_frame(&mut self) -> Result<Option<Vec<i16>>> {
        if self.frames.is_empty() {
            return Ok(None);
        }
        if let Some(pacer) = &mut self.pacer {
            pacer.wait();
        }
        Ok(self.frames.pop_front())
    }
}

pub type PlayedFrames = Arc<Mutex<Vec<Vec<i16>>>>;

/// Records every frame written, optionally consuming at real-time pace.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    played: PlayedFrames,
    pacer: Option<Pacer>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paced(mut self, interval: Duration) -> Self {
        self.pacer = Some(Pacer::new(interval));
        self
    }

    pub fn played(&self) -> PlayedFrames {
        self.played.clone()
    }
}

impl PlaybackSink for MemorySink {
    fn write(&mut self, frame: &[i16]) -> Result<()> {
        if let Some(pacer) = &mut self.pacer {
            pacer.wait();
        }
        let mut played = match self.played.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        played.push(frame.to_vec());
        Ok(())
    }

    fn waker(&self) -> Arc<dyn SinkWaker> {
        Arc::new(NoopWaker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_is_split_and_padded() {
        let signal: Vec<i16> = (1..=10).collect();
        let mut source = MemorySource::from_signal(&signal, 4);
        assert_eq!(source.next_frame().unwrap(), Some(vec![1, 2, 3, 4]));
        assert_eq!(source.next_frame().unwrap(), Some(vec![5, 6, 7, 8]));
        assert_eq!(source.next_frame().unwrap(), Some(vec![9, 10, 0, 0]));
        assert_eq!(source.next_frame().unwrap(), None);
    }

    #[test]
    fn sink_keeps_written_frames() {
        let mut sink = MemorySink::new();
        let played = sink.played();
        sink.write(&[1, 2]).unwrap();
        sink.write(&[3, 4]).unwrap();
        assert_eq!(*played.lock().unwrap(), vec![vec![1, 2], vec![3, 4]]);
    }
}
