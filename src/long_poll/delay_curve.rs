//! Mapping between a normalized pacing factor and a poll delay.
//!
//! The curve is `d(x) = a + b * e^(-steep * x)` with the constants solved so
//! that `d(0) = max` and `d(1) = min`. Small factors therefore mean slow
//! polling and the delay falls off quickly as the factor approaches one.

use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PollDelayCurve {
    min_ms: f64,
    max_ms: f64,
    steep: f64,
    a: f64,
    b: f64,
}

impl PollDelayCurve {
    /// Builds a curve between `min` and `max`.
    ///
    /// A non-positive or non-finite `steep` falls back to `1.0`, and `max` is
    /// raised to `min` when the bounds are inverted.
    pub fn new(min: Duration, max: Duration, steep: f64) -> Self {
        let min_ms = min.as_secs_f64() * 1000.0;
        let max_ms = (max.as_secs_f64() * 1000.0).max(min_ms);
        let steep = if steep.is_finite() && steep > 0.0 {
            steep
        } else {
            1.0
        };

        let b = (max_ms - min_ms) / (1.0 - (-steep).exp());
        let a = max_ms - b;

        Self {
            min_ms,
            max_ms,
            steep,
            a,
            b,
        }
    }

    pub fn min_ms(&self) -> f64 {
        self.min_ms
    }

    pub fn max_ms(&self) -> f64 {
        self.max_ms
    }

    /// Delay in milliseconds for `factor`, clamped to `[0, 1]` on input and
    /// `[min, max]` on output.
    pub fn calc(&self, factor: f64) -> f64 {
        let x = clamp_unit(factor);
        let delay = self.a + self.b * (-self.steep * x).exp();
        delay.clamp(self.min_ms, self.max_ms)
    }

    /// Closed-form inverse of [`calc`](Self::calc): the factor whose delay is
    /// `delay_ms`. Delays outside the curve's range map to the nearest end.
    pub fn invert(&self, delay_ms: f64) -> f64 {
        if self.b <= 0.0 || !delay_ms.is_finite() {
            // Degenerate curve (min == max) or an infinite delay: slow end.
            return 0.0;
        }
        let d = delay_ms.clamp(self.min_ms, self.max_ms);
        let ratio = (d - self.a) / self.b;
        clamp_unit(-ratio.ln() / self.steep)
    }

    pub fn delay(&self, factor: f64) -> Duration {
        Duration::from_millis(self.calc(factor).round() as u64)
    }
}

fn clamp_unit(x: f64) -> f64 {
    if x.is_nan() { 0.0 } else { x.clamp(0.0, 1.0) }
}
