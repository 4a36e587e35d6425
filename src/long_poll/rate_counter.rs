use std::time::{Duration, Instant};

use super::ring_buffer::RingBuffer;

/// Rates below this many events per second are treated as idle.
pub(crate) const IDLE_RATE: f64 = 0.01;

/// Sliding window of event timestamps.
///
/// The rate is measured from the oldest retained event up to `now`, so a
/// counter that stops receiving events decays towards zero instead of
/// freezing at its last value.
#[derive(Debug)]
pub struct RateCounter {
    window: RingBuffer<Instant>,
}

impl RateCounter {
    pub fn new(window: usize) -> Self {
        Self {
            window: RingBuffer::with_capacity(window.max(2)),
        }
    }

    pub fn record(&mut self, at: Instant) {
        self.window.push_evicting(at);
    }

    /// Events per second observed in the window as of `now`.
    ///
    /// Needs at least two samples; one sample carries no interval.
    pub fn rate(&self, now: Instant) -> f64 {
        if self.window.len() < 2 {
            return 0.0;
        }
        let Some(oldest) = self.window.front() else {
            return 0.0;
        };
        let span = now.saturating_duration_since(*oldest).max(Duration::from_millis(1));
        (self.window.len() - 1) as f64 / span.as_secs_f64()
    }
}

pub(crate) fn is_idle(rate: f64) -> bool {
    rate < IDLE_RATE
}
