//! Ingress/egress rate estimation.
//!
//! The queue counts publishes and fetches between estimator updates; each
//! update turns the counters into smoothed per-second rates by averaging
//! the current window with the previous one. The controller multiplies
//! the combined rate by the duration target to obtain the RAM-message
//! target, and divides the resident count by it to estimate how long the
//! queue would take to drain.

use std::sync::Arc;

use crate::clock::Clock;

#[derive(Clone)]
pub struct RateEstimator {
    clock: Arc<dyn Clock>,
    last_update_us: u64,
    in_count: u64,
    out_count: u64,
    prev_in_count: u64,
    prev_out_count: u64,
    avg_ingress: f64,
    avg_egress: f64,
}

impl RateEstimator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_micros();
        Self {
            clock,
            last_update_us: now,
            in_count: 0,
            out_count: 0,
            prev_in_count: 0,
            prev_out_count: 0,
            avg_ingress: 0.0,
            avg_egress: 0.0,
        }
    }

    pub fn note_publish(&mut self) {
        self.in_count += 1;
    }

    pub fn note_fetch(&mut self) {
        self.out_count += 1;
    }

    pub fn avg_ingress(&self) -> f64 {
        self.avg_ingress
    }

    pub fn avg_egress(&self) -> f64 {
        self.avg_egress
    }

    /// Recompute both smoothed rates from the counters gathered since the
    /// previous update. Each rate is the messages of the last two windows
    /// over the last window's duration, which a division by two in the
    /// drain estimate compensates for.
    pub fn update(&mut self) {
        let now = self.clock.now_micros();
        let elapsed = now.saturating_sub(self.last_update_us);
        if elapsed == 0 {
            return;
        }
        self.avg_ingress = 1e6 * (self.in_count + self.prev_in_count) as f64 / elapsed as f64;
        self.avg_egress = 1e6 * (self.out_count + self.prev_out_count) as f64 / elapsed as f64;
        self.prev_in_count = self.in_count;
        self.prev_out_count = self.out_count;
        self.in_count = 0;
        self.out_count = 0;
        self.last_update_us = now;
    }

    /// Estimated seconds to drain the given resident counts, `None` when
    /// both rates are zero (the queue is not moving).
    pub fn drain_estimate(&self, ram_msg_count: u64, ram_msg_count_prev: u64) -> Option<f64> {
        let combined = self.avg_ingress + self.avg_egress;
        if combined == 0.0 {
            return None;
        }
        Some((ram_msg_count + ram_msg_count_prev) as f64 / (2.0 * combined))
    }

    /// RAM-message target for a duration target of `duration` seconds.
    /// `None` in, `None` out: no paging pressure.
    pub fn target_ram_msg_count(&self, duration: Option<f64>) -> Option<u64> {
        duration.map(|secs| {
            let target = secs * (self.avg_ingress + self.avg_egress);
            if target >= u64::MAX as f64 {
                u64::MAX
            } else {
                target as u64
            }
        })
    }

    /// Forget rate history, e.g. ahead of hibernation.
    pub fn reset(&mut self) {
        self.last_update_us = self.clock.now_micros();
        self.in_count = 0;
        self.out_count = 0;
        self.prev_in_count = 0;
        self.prev_out_count = 0;
        self.avg_ingress = 0.0;
        self.avg_egress = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::RateEstimator;
    use crate::clock::ManualClock;

    fn estimator(clock: &ManualClock) -> RateEstimator {
        RateEstimator::new(Arc::new(clock.clone()))
    }

    #[test]
    fn rates_follow_the_counters() {
        let clock = ManualClock::new(0);
        let mut rates = estimator(&clock);

        for _ in 0..100 {
            rates.note_publish();
        }
        for _ in 0..50 {
            rates.note_fetch();
        }
        clock.advance(1_000_000);
        rates.update();

        assert_eq!(rates.avg_ingress(), 100.0);
        assert_eq!(rates.avg_egress(), 50.0);

        // Second, idle window: the previous counts still contribute.
        clock.advance(1_000_000);
        rates.update();
        assert_eq!(rates.avg_ingress(), 100.0);
        assert_eq!(rates.avg_egress(), 50.0);

        // Third window with no history left: rates decay to zero.
        clock.advance(1_000_000);
        rates.update();
        assert_eq!(rates.avg_ingress(), 0.0);
    }

    #[test]
    fn drain_estimate_is_infinite_when_idle() {
        let clock = ManualClock::new(0);
        let rates = estimator(&clock);
        assert_eq!(rates.drain_estimate(10, 10), None);
    }

    #[test]
    fn drain_estimate_divides_by_twice_the_rate() {
        let clock = ManualClock::new(0);
        let mut rates = estimator(&clock);
        for _ in 0..100 {
            rates.note_fetch();
        }
        clock.advance(1_000_000);
        rates.update();
        // 100 resident at 100 msg/s egress: two-window smoothing makes
        // this (100 + 100) / (2 * 100).
        assert_eq!(rates.drain_estimate(100, 100), Some(1.0));
    }

    #[test]
    fn target_scales_with_duration() {
        let clock = ManualClock::new(0);
        let mut rates = estimator(&clock);
        for _ in 0..200 {
            rates.note_publish();
        }
        clock.advance(1_000_000);
        rates.update();

        assert_eq!(rates.target_ram_msg_count(None), None);
        assert_eq!(rates.target_ram_msg_count(Some(2.0)), Some(400));
        assert_eq!(rates.target_ram_msg_count(Some(0.0)), Some(0));
    }

    #[test]
    fn zero_elapsed_updates_are_ignored() {
        let clock = ManualClock::new(5);
        let mut rates = estimator(&clock);
        rates.note_publish();
        rates.update();
        assert_eq!(rates.avg_ingress(), 0.0);
    }
}
