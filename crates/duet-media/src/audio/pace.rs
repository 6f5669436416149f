use std::time::{Duration, Instant};

/// Sleeps so that successive ticks land one interval apart.
#[derive(Debug, Clone)]
pub(crate) struct Pacer {
    interval: Duration,
    start: Option<Instant>,
    ticks: u32,
}

impl Pacer {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            start: None,
            ticks: 0,
        }
    }

    pub(crate) fn wait(&mut self) {
        let start = *self.start.get_or_insert_with(Instant::now);
        let target_time = start + self.interval * self.ticks;
        if let Some(wait) = target_time.checked_duration_since(Instant::now()) {
            std::thread::sleep(wait);
        }
        self.ticks = self.ticks.wrapping_add(1);
    }
}
