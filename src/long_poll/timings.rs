use std::time::{Duration, Instant};

use super::{
    delay_curve::PollDelayCurve,
    rate_counter::{RateCounter, is_idle},
};

/// Weight kept from the previous factor on each update.
const SMOOTHING_KEEP: f64 = 0.2;
/// Distance at which the smoothed factor snaps onto its target.
const SNAP_DISTANCE: f64 = 0.01;
/// Relative tolerance for treating inbound and outbound rates as matched.
const SYNC_TOLERANCE: f64 = 0.1;

/// Pacing factor for an idle conversation: the slow end of the curve.
///
/// The curve maps 0 to the maximum delay and 1 to the minimum, so idle
/// sessions target 0 to poll as slowly as allowed.
pub(crate) const IDLE_FACTOR: f64 = 0.0;

/// Per-session traffic bookkeeping feeding the poll delay controller.
#[derive(Debug)]
pub struct SessionTimings {
    inbound: RateCounter,
    outbound: RateCounter,
    inbound_payload: RateCounter,
    outbound_payload: RateCounter,
    factor: f64,
    curve: PollDelayCurve,
}

/// Snapshot of the rates the controller saw when picking a target.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ObservedRates {
    pub inbound: f64,
    pub outbound: f64,
    pub inbound_payload: f64,
    pub outbound_payload: f64,
}

impl SessionTimings {
    pub fn new(curve: PollDelayCurve, window: usize) -> Self {
        Self {
            inbound: RateCounter::new(window),
            outbound: RateCounter::new(window),
            inbound_payload: RateCounter::new(window),
            outbound_payload: RateCounter::new(window),
            factor: IDLE_FACTOR,
            curve,
        }
    }

    pub fn record_inbound(&mut self, at: Instant, has_payload: bool) {
        self.inbound.record(at);
        if has_payload {
            self.inbound_payload.record(at);
        }
    }

    pub fn record_outbound(&mut self, at: Instant, has_payload: bool) {
        self.outbound.record(at);
        if has_payload {
            self.outbound_payload.record(at);
        }
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    pub fn curve(&self) -> &PollDelayCurve {
        &self.curve
    }

    pub fn rates(&self, now: Instant) -> ObservedRates {
        ObservedRates {
            inbound: self.inbound.rate(now),
            outbound: self.outbound.rate(now),
            inbound_payload: self.inbound_payload.rate(now),
            outbound_payload: self.outbound_payload.rate(now),
        }
    }

    /// Target factor for the rates observed at `now`.
    pub fn target(&self, now: Instant) -> f64 {
        target_factor(&self.curve, self.rates(now))
    }

    /// Moves the smoothed factor towards the current target and returns the
    /// delay hint for the next poll. A pending outbound message always asks
    /// for the minimum delay but still advances the controller.
    pub fn next_delay(&mut self, now: Instant, outbound_pending: bool) -> Duration {
        let target = self.target(now);
        self.factor = smooth(self.factor, target);

        if outbound_pending {
            return self.curve.delay(1.0);
        }
        self.curve.delay(self.factor)
    }
}

/// Picks the factor matching the observed traffic.
///
/// A conversation where either direction is idle paces at the slow end. When
/// inbound and outbound run at the same rate the client is doing one request
/// per response, and the interesting cadence is how often real payloads come
/// out; otherwise it is how often anything comes out.
pub fn target_factor(curve: &PollDelayCurve, rates: ObservedRates) -> f64 {
    if is_idle(rates.outbound) || is_idle(rates.inbound) {
        return IDLE_FACTOR;
    }

    let larger = rates.outbound.max(rates.inbound);
    let synchronous = (rates.outbound - rates.inbound).abs() <= SYNC_TOLERANCE * larger;

    let rate = if synchronous && !is_idle(rates.outbound_payload) {
        rates.outbound_payload
    } else {
        rates.outbound
    };

    curve.invert(1000.0 / rate)
}

pub fn smooth(previous: f64, target: f64) -> f64 {
    let next = SMOOTHING_KEEP * previous + (1.0 - SMOOTHING_KEEP) * target;
    if (next - target).abs() < SNAP_DISTANCE {
        target
    } else {
        next
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn curve() -> PollDelayCurve {
        PollDelayCurve::new(Duration::from_millis(100), Duration::from_millis(5000), 3.0)
    }

    fn rates(inbound: f64, outbound: f64, inbound_payload: f64, outbound_payload: f64) -> ObservedRates {
        ObservedRates {
            inbound,
            outbound,
            inbound_payload,
            outbound_payload,
        }
    }

    #[test]
    fn idle_direction_paces_slowly() {
        let c = curve();
        assert_eq!(target_factor(&c, rates(0.0, 5.0, 0.0, 5.0)), IDLE_FACTOR);
        assert_eq!(target_factor(&c, rates(5.0, 0.0, 5.0, 0.0)), IDLE_FACTOR);
        assert!((c.calc(IDLE_FACTOR) - c.max_ms()).abs() < 1e-6);
    }

    #[test]
    fn synchronous_stream_follows_payload_rate() {
        let c = curve();
        // one poll per second each way, one payload every two seconds
        let factor = target_factor(&c, rates(1.0, 1.05, 0.0, 0.5));
        assert!((c.calc(factor) - 2000.0).abs() < 1e-6);
    }

    #[test]
    fn asynchronous_stream_follows_outbound_rate() {
        let c = curve();
        let factor = target_factor(&c, rates(1.0, 4.0, 0.0, 0.5));
        assert!((c.calc(factor) - 250.0).abs() < 1e-6);
    }

    #[test]
    fn synchronous_without_payload_uses_outbound() {
        let c = curve();
        let factor = target_factor(&c, rates(2.0, 2.0, 0.0, 0.0));
        assert!((c.calc(factor) - 500.0).abs() < 1e-6);
    }

    #[test]
    fn smoothing_snaps_near_target() {
        assert_eq!(smooth(0.5, 0.505), 0.505);
        let next = smooth(0.0, 1.0);
        assert!((next - 0.8).abs() < 1e-12);
    }

    #[test]
    fn pending_outbound_forces_minimum() {
        let start = Instant::now();
        let mut timings = SessionTimings::new(curve(), 8);
        assert_eq!(timings.next_delay(start, true), Duration::from_millis(100));
        assert_eq!(timings.next_delay(start, false), Duration::from_millis(5000));
    }

    #[test]
    fn busy_session_speeds_up() {
        let start = Instant::now();
        let mut timings = SessionTimings::new(curve(), 8);
        let mut delay = Duration::ZERO;
        for i in 0..8u64 {
            let at = start + Duration::from_millis(200 * i);
            timings.record_inbound(at, true);
            timings.record_outbound(at, true);
            delay = timings.next_delay(at, false);
        }
        assert!(delay < Duration::from_millis(400), "delay was {delay:?}");
        assert!(delay >= Duration::from_millis(100));
    }

    proptest! {
        #[test]
        fn smoothing_converges_without_overshoot(start in 0.0f64..=1.0, target in 0.0f64..=1.0) {
            let mut factor = start;
            let mut distance = (factor - target).abs();
            for _ in 0..16 {
                let next = smooth(factor, target);
                let next_distance = (next - target).abs();
                prop_assert!(next_distance <= distance);
                // never crosses to the other side of the target
                prop_assert!((next - target) * (factor - target) >= 0.0);
                factor = next;
                distance = next_distance;
            }
            prop_assert_eq!(factor, target);
        }

        #[test]
        fn delay_hint_stays_in_bounds(
            inbound in 0.0f64..50.0,
            outbound in 0.0f64..50.0,
            payload_share in 0.0f64..=1.0,
            steps in 1usize..20,
        ) {
            let c = curve();
            let observed = rates(inbound, outbound, inbound * payload_share, outbound * payload_share);
            let target = target_factor(&c, observed);
            prop_assert!((0.0..=1.0).contains(&target));

            let mut factor = IDLE_FACTOR;
            for _ in 0..steps {
                factor = smooth(factor, target);
                let d = c.calc(factor);
                prop_assert!(d >= c.min_ms() && d <= c.max_ms());
            }
        }
    }
}
