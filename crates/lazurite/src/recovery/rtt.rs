use crate::protocol::{MAX_ACK_DELAY, TIMER_GRANULARITY};
use std::time::{Duration, Instant};

/// Initial RTT estimate used before the first sample.
const INITIAL_RTT: Duration = Duration::from_millis(300);

/// Window size of the min-RTT filter.
const MIN_RTT_WND: Duration = Duration::from_secs(60);

/// RTT estimator: an implementation of RFC 6298 with some modifications.
#[derive(Debug)]
pub(crate) struct RttFilter {
    min_rtt: Duration,
    min_rtt_renew: Option<Instant>,
    smoothed_rtt: Duration,
    mdev: Duration,
    latest_rtt: Duration,
}

impl RttFilter {
    pub fn new() -> Self {
        Self {
            min_rtt: Duration::ZERO,
            min_rtt_renew: None,
            smoothed_rtt: Duration::ZERO,
            mdev: Duration::ZERO,
            latest_rtt: Duration::ZERO,
        }
    }

    /// Feeds one sample. `delay` is the peer-reported time it sat on the
    /// ACK; it is discounted only when doing so cannot push the sample
    /// below the minimum observed RTT.
    pub fn update(&mut self, mut rtt: Duration, delay: Duration, now: Instant) {
        const ALPHA: f64 = 0.125;
        const BETA: f64 = 0.25;

        if self.min_rtt > rtt || !self.min_rtt_renew.is_some_and(|t| t > now) {
            self.min_rtt = rtt;
            self.min_rtt_renew = Some(now + MIN_RTT_WND);
        }
        if self.smoothed_rtt > Duration::ZERO {
            // The delay is peer-chosen; a claim larger than the sample
            // itself never discounts below zero.
            if let Some(discounted) = rtt.checked_sub(delay) {
                if discounted >= self.min_rtt {
                    rtt = discounted;
                }
            }
            let deviation = (self.smoothed_rtt.as_nanos() as f64 - rtt.as_nanos() as f64).abs();
            self.mdev = round_to_even_duration(lerp(self.mdev.as_nanos() as f64, deviation, BETA));
            self.smoothed_rtt = round_to_even_duration(lerp(
                self.smoothed_rtt.as_nanos() as f64,
                rtt.as_nanos() as f64,
                ALPHA,
            ));
        } else {
            self.smoothed_rtt = rtt;
            self.mdev = rtt / 2;
        }
        self.latest_rtt = rtt;
    }

    /// How long a packet must be outstanding before time-based loss
    /// detection declares it gone.
    pub fn loss_duration_threshold(&self) -> Duration {
        let mut rtt = self.smoothed_rtt.max(self.latest_rtt);
        if rtt == Duration::ZERO {
            rtt = INITIAL_RTT;
        }
        round_to_even_duration(1.125 * rtt.as_nanos() as f64).max(TIMER_GRANULARITY)
    }

    /// Probe timeout.
    pub fn pto(&self) -> Duration {
        let (smoothed_rtt, mdev) = if self.smoothed_rtt == Duration::ZERO {
            (INITIAL_RTT, INITIAL_RTT / 2)
        } else {
            (self.smoothed_rtt, self.mdev)
        };
        smoothed_rtt + (4 * mdev).max(TIMER_GRANULARITY) + MAX_ACK_DELAY
    }
}

fn lerp(x: f64, y: f64, a: f64) -> f64 {
    x + a * (y - x)
}

fn round_to_even_duration(x: f64) -> Duration {
    Duration::from_nanos(x.round_ties_even() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn delay_discounting() {
        let t0 = Instant::now();
        let mut rf = RttFilter::new();

        // First sample: taken as-is, mdev seeded at half.
        rf.update(ms(300), ms(100), t0);
        assert_eq!(rf.min_rtt, ms(300));
        assert_eq!(rf.smoothed_rtt, ms(300));
        assert_eq!(rf.mdev, ms(150));
        assert_eq!(rf.latest_rtt, ms(300));

        // 350ms with 50ms of receiver delay: 300 >= min_rtt, so the delay
        // is subtracted and the smoothed estimate does not move.
        rf.update(ms(350), ms(50), t0 + Duration::from_secs(1));
        assert_eq!(rf.min_rtt, ms(300));
        assert_eq!(rf.smoothed_rtt, ms(300));
        assert_eq!(rf.latest_rtt, ms(300));

        // 200ms with 300ms of claimed delay: discounting would go below
        // min_rtt, so the delay is ignored.
        rf.update(ms(200), ms(300), t0 + Duration::from_secs(2));
        assert_eq!(rf.min_rtt, ms(200));
        assert_eq!(rf.smoothed_rtt, Duration::from_micros(287_500));
        assert_eq!(rf.latest_rtt, ms(200));
    }

    #[test]
    fn delay_exceeding_sample_is_ignored() {
        let t0 = Instant::now();
        let mut rf = RttFilter::new();

        rf.update(ms(100), ms(0), t0);
        // A zero sample drags min_rtt to zero for the rest of the window.
        rf.update(Duration::ZERO, Duration::ZERO, t0 + Duration::from_secs(1));
        assert_eq!(rf.min_rtt, Duration::ZERO);

        // A peer-reported delay larger than the sample is ignored even
        // with min_rtt at zero; the sample stands undiscounted.
        rf.update(ms(10), ms(40), t0 + Duration::from_secs(2));
        assert_eq!(rf.latest_rtt, ms(10));
        assert_eq!(rf.min_rtt, Duration::ZERO);
    }

    #[test]
    fn min_rtt_window_renewal() {
        let t0 = Instant::now();
        let mut rf = RttFilter::new();

        rf.update(ms(200), ms(0), t0);
        assert_eq!(rf.min_rtt, ms(200));
        rf.update(ms(10), ms(0), t0 + Duration::from_secs(1));
        assert_eq!(rf.min_rtt, ms(10));
        rf.update(ms(50), ms(0), t0 + Duration::from_secs(2));
        assert_eq!(rf.min_rtt, ms(10));

        // Past the renewal window the min is dropped even though the new
        // sample is higher.
        rf.update(ms(100), ms(0), t0 + Duration::from_secs(3601));
        assert_eq!(rf.min_rtt, ms(100));
        rf.update(ms(7), ms(2), t0 + Duration::from_secs(3602));
        assert_eq!(rf.min_rtt, ms(7));
    }

    #[test]
    fn loss_threshold_and_pto_defaults() {
        let rf = RttFilter::new();
        assert_eq!(rf.loss_duration_threshold(), Duration::from_micros(337_500));
        assert_eq!(rf.pto(), INITIAL_RTT + 4 * (INITIAL_RTT / 2) + MAX_ACK_DELAY);
    }

    #[test]
    fn loss_threshold_tracks_largest_estimate() {
        let t0 = Instant::now();
        let mut rf = RttFilter::new();
        rf.update(ms(100), ms(0), t0);
        assert_eq!(rf.loss_duration_threshold(), Duration::from_micros(112_500));
        assert_eq!(rf.pto(), ms(100) + (4 * ms(50)).max(TIMER_GRANULARITY) + MAX_ACK_DELAY);

        // A latest sample above the smoothed estimate dominates.
        rf.update(ms(400), ms(0), t0 + Duration::from_secs(1));
        assert_eq!(rf.loss_duration_threshold(), Duration::from_micros(450_000));
    }
}
