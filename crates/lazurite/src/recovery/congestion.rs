use crate::protocol::MAX_PACKET_SIZE;
use std::time::{Duration, Instant};

pub(crate) const INITIAL_CWND: usize = 2 * MAX_PACKET_SIZE;

/// Additive-increase multiplicative-decrease congestion controller with
/// window validation.
///
/// The window grows by the size of every acked packet and collapses to the
/// initial window on loss, at most once per congestion episode. Validation
/// shrinks capacity the sender keeps failing to use, one PTO epoch at a
/// time.
#[derive(Debug)]
pub(crate) struct CongestionController {
    cwnd: usize,
    /// Start of the current congestion episode. Packets sent before it
    /// neither grow nor collapse the window.
    congested: Instant,
    validated: Instant,
}

impl CongestionController {
    pub fn new(now: Instant) -> Self {
        Self { cwnd: INITIAL_CWND, congested: now, validated: now }
    }

    pub fn ack(&mut self, size: usize, sent: Instant, _now: Instant) {
        if sent >= self.congested {
            self.cwnd += size;
        }
    }

    pub fn loss(&mut self, sent: Instant, now: Instant) {
        if sent >= self.congested {
            self.cwnd = INITIAL_CWND;
            self.congested = now;
        }
    }

    fn validated_cwnd(&self, in_flight_bytes: usize, pto: Duration, now: Instant) -> usize {
        let mut cwnd = self.cwnd;
        let mut t = self.validated + pto;
        while in_flight_bytes + MAX_PACKET_SIZE < cwnd / 2 && t < now {
            cwnd /= 2;
            t += pto;
        }
        cwnd.max(INITIAL_CWND)
    }

    pub fn cwnd_limited(&self, in_flight_bytes: usize, pto: Duration, now: Instant) -> bool {
        in_flight_bytes + MAX_PACKET_SIZE > self.validated_cwnd(in_flight_bytes, pto, now)
    }

    pub fn validate(&mut self, in_flight_bytes: usize, pto: Duration, now: Instant) {
        self.cwnd = self.validated_cwnd(in_flight_bytes, pto, now);
        self.validated = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PTO: Duration = Duration::from_millis(500);

    #[test]
    fn acks_grow_the_window() {
        let t0 = Instant::now();
        let mut cc = CongestionController::new(t0);
        assert!(!cc.cwnd_limited(0, PTO, t0));

        cc.ack(1000, t0, t0 + PTO);
        assert_eq!(cc.cwnd, INITIAL_CWND + 1000);
    }

    #[test]
    fn one_collapse_per_episode() {
        let t0 = Instant::now();
        let mut cc = CongestionController::new(t0);
        for _ in 0..8 {
            cc.ack(MAX_PACKET_SIZE, t0 + PTO, t0 + PTO);
        }
        let grown = cc.cwnd;
        assert!(grown > INITIAL_CWND);

        cc.loss(t0 + PTO, t0 + 2 * PTO);
        assert_eq!(cc.cwnd, INITIAL_CWND);

        // Losses of packets sent before the episode started change
        // nothing, and neither do their acks.
        cc.loss(t0 + PTO, t0 + 3 * PTO);
        cc.ack(MAX_PACKET_SIZE, t0 + PTO, t0 + 3 * PTO);
        assert_eq!(cc.cwnd, INITIAL_CWND);

        // A packet sent into the new episode grows the window again.
        cc.ack(MAX_PACKET_SIZE, t0 + 3 * PTO, t0 + 3 * PTO);
        assert_eq!(cc.cwnd, INITIAL_CWND + MAX_PACKET_SIZE);
    }

    #[test]
    fn unused_capacity_decays_per_pto_epoch() {
        let t0 = Instant::now();
        let mut cc = CongestionController::new(t0);
        cc.cwnd = 16 * INITIAL_CWND;

        // Nothing in flight: each elapsed PTO epoch halves the window.
        assert_eq!(cc.validated_cwnd(0, PTO, t0 + PTO), 16 * INITIAL_CWND);
        assert_eq!(cc.validated_cwnd(0, PTO, t0 + 2 * PTO), 8 * INITIAL_CWND);
        assert_eq!(cc.validated_cwnd(0, PTO, t0 + 5 * PTO), INITIAL_CWND);
        // Floored at the initial window no matter how long.
        assert_eq!(cc.validated_cwnd(0, PTO, t0 + 100 * PTO), INITIAL_CWND);

        // A full pipe stops the decay.
        assert_eq!(cc.validated_cwnd(15 * INITIAL_CWND, PTO, t0 + 5 * PTO), 16 * INITIAL_CWND);

        cc.validate(0, PTO, t0 + 2 * PTO);
        assert_eq!(cc.cwnd, 8 * INITIAL_CWND);
    }

    #[test]
    fn cwnd_limited_is_monotone_in_flight() {
        let t0 = Instant::now();
        let cc = CongestionController::new(t0);
        let mut prev = false;
        for in_flight in (0..4 * MAX_PACKET_SIZE).step_by(64) {
            let limited = cc.cwnd_limited(in_flight, PTO, t0);
            assert!(!prev || limited, "regressed at {in_flight}");
            prev = limited;
        }
        assert!(prev);
    }
}
