//! Diagnostic events for the receive path.
//!
//! Components report every operational event (recovery, drops, underruns,
//! resets) to a [`DiagnosticSink`]. Suppression of noisy output is the sink's
//! business: [`LogSink`] aggregates totals and emits a log line only when a
//! per-kind token bucket allows it, so the components' control flow never
//! depends on time. Tests use [`CountingSink`], which just counts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tracing::{debug, info, warn};

/// Log rate when verbose diagnostics are requested, in lines per second.
pub const DEBUG_LOG_RATE: f64 = 0.5;
/// Log rate otherwise: one line per kind every 100 seconds.
pub const QUIET_LOG_RATE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticEvent {
    /// A gap was filled; counts are interleaved samples.
    Recovered { fec: usize, concealed: usize },
    /// Samples older than the read position were discarded on write.
    Dropped { samples: usize },
    /// A read found fewer than a frame of samples and padded with silence.
    Underrun { padded: usize },
    /// Buffered size left the drift band and accounting was rebased.
    Reset { buffered: i64 },
    /// Periodic buffered-size report from a frame extraction.
    BufferLevel { buffered: i64, target: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Recovered,
    Dropped,
    Underrun,
    Reset,
    BufferLevel,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Recovered,
        EventKind::Dropped,
        EventKind::Underrun,
        EventKind::Reset,
        EventKind::BufferLevel,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl DiagnosticEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Recovered { .. } => EventKind::Recovered,
            Self::Dropped { .. } => EventKind::Dropped,
            Self::Underrun { .. } => EventKind::Underrun,
            Self::Reset { .. } => EventKind::Reset,
            Self::BufferLevel { .. } => EventKind::BufferLevel,
        }
    }

    /// Samples affected by the event, zero for level and reset reports.
    pub fn samples(&self) -> usize {
        match *self {
            Self::Recovered { fec, concealed } => fec + concealed,
            Self::Dropped { samples } => samples,
            Self::Underrun { padded } => padded,
            Self::Reset { .. } | Self::BufferLevel { .. } => 0,
        }
    }
}

pub trait DiagnosticSink: Send + Sync {
    fn record(&self, event: DiagnosticEvent);
}

/// Token bucket with an injectable clock.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    tokens: f64,
    last: Option<Instant>,
}

impl RateLimiter {
    /// `rate` tokens per second, holding at most `burst` tokens. Starts full.
    pub fn new(rate: f64, burst: u32) -> Self {
        let burst = burst.max(1) as f64;
        Self {
            rate,
            burst,
            tokens: burst,
            last: None,
        }
    }

    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last {
            let elapsed = now.saturating_duration_since(last).as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        }
        self.last = Some(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
struct KindState {
    limiter: RateLimiter,
    /// Events since the last emitted line.
    pending: u64,
    /// Events since creation.
    total: u64,
    fec: u64,
    samples: u64,
}

/// Sink that turns events into rate-limited `tracing` output.
#[derive(Debug)]
pub struct LogSink {
    kinds: Mutex<Vec<KindState>>,
}

impl LogSink {
    pub fn new(verbose: bool) -> Self {
        let rate = if verbose { DEBUG_LOG_RATE } else { QUIET_LOG_RATE };
        Self::with_rate(rate)
    }

    pub fn with_rate(rate: f64) -> Self {
        let kinds = EventKind::ALL
            .iter()
            .map(|_| KindState {
                limiter: RateLimiter::new(rate, 1),
                pending: 0,
                total: 0,
                fec: 0,
                samples: 0,
            })
            .collect();
        Self {
            kinds: Mutex::new(kinds),
        }
    }

    fn record_at(&self, event: DiagnosticEvent, now: Instant) {
        let mut kinds = match self.kinds.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let state = &mut kinds[event.kind().index()];

        state.pending += 1;
        state.total += 1;
        match event {
            DiagnosticEvent::Recovered { fec, concealed } => {
                state.fec += fec as u64;
                state.samples += concealed as u64;
            }
            other => state.samples += other.samples() as u64,
        }

        if !state.limiter.allow_at(now) {
            return;
        }

        match event {
            DiagnosticEvent::Recovered { .. } => info!(
                fec = state.fec,
                plc = state.samples,
                gaps = state.pending,
                "recovered lost samples"
            ),
            DiagnosticEvent::Dropped { .. } => {
                warn!(samples = state.samples, "dropped outdated samples")
            }
            DiagnosticEvent::Underrun { .. } => warn!(
                padded = state.samples,
                underruns = state.pending,
                "inserted silence for delayed samples"
            ),
            DiagnosticEvent::Reset { buffered } => warn!(
                resets = state.total,
                buffered,
                "jitter buffer reset"
            ),
            DiagnosticEvent::BufferLevel { buffered, target } => {
                debug!(buffered, target, "jitter buffer level")
            }
        }

        state.pending = 0;
        state.fec = 0;
        state.samples = 0;
    }
}

impl DiagnosticSink for LogSink {
    fn record(&self, event: DiagnosticEvent) {
        self.record_at(event, Instant::now());
    }
}

/// Counts events and affected samples per kind.
#[derive(Debug, Default)]
pub struct CountingSink {
    events: [AtomicU64; 5],
    samples: [AtomicU64; 5],
}

impl CountingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, kind: EventKind) -> u64 {
        self.events[kind.index()].load(Ordering::Relaxed)
    }

    pub fn samples(&self, kind: EventKind) -> u64 {
        self.samples[kind.index()].load(Ordering::Relaxed)
    }
}

impl DiagnosticSink for CountingSink {
    fn record(&self, event: DiagnosticEvent) {
        let idx = event.kind().index();
        self.events[idx].fetch_add(1, Ordering::Relaxed);
        self.samples[idx].fetch_add(event.samples() as u64, Ordering::Relaxed);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn record(&self, _event: DiagnosticEvent) {}
}
