//! Bandwidth-delay product estimation.
//!
//! A ping is sent while data is arriving; the bytes received between sending
//! it and its ack approximate what the path holds in flight. When that sample
//! fills most of the current estimate and bandwidth went up, the estimate
//! grows so the advertised windows can follow.

use std::time::{Duration, Instant};
use tracing::debug;

const MIN_PING_INTERVAL: Duration = Duration::from_millis(100);
const MAX_PING_INTERVAL: Duration = Duration::from_secs(10);

/// Consecutive samples without growth before backing off the ping rate.
const STABLE_SAMPLES_BEFORE_BACKOFF: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PingState {
    Unscheduled,
    Scheduled,
    Started(Instant),
}

#[derive(Debug)]
pub struct BdpEstimator {
    estimate: i64,
    accumulator: i64,
    bandwidth: f64,
    ping_state: PingState,
    inter_ping_delay: Duration,
    next_ping: Instant,
    stable_samples: u32,
}

impl BdpEstimator {
    pub fn new(initial_estimate: i64, now: Instant) -> Self {
        Self {
            estimate: initial_estimate.max(1),
            accumulator: 0,
            bandwidth: 0.0,
            ping_state: PingState::Unscheduled,
            inter_ping_delay: MIN_PING_INTERVAL,
            next_ping: now,
            stable_samples: 0,
        }
    }

    pub fn estimate(&self) -> i64 {
        self.estimate
    }

    pub fn add_incoming_bytes(&mut self, n: u32) {
        self.accumulator += n as i64;
    }

    /// Whether a new probe should go out now.
    pub fn need_ping(&self, now: Instant) -> bool {
        self.ping_state == PingState::Unscheduled && self.accumulator > 0 && now >= self.next_ping
    }

    /// A probe has been queued. Counting restarts from here.
    pub fn schedule_ping(&mut self) {
        self.ping_state = PingState::Scheduled;
        self.accumulator = 0;
    }

    /// The probe was written.
    pub fn start_ping(&mut self, now: Instant) {
        if self.ping_state == PingState::Scheduled {
            self.ping_state = PingState::Started(now);
        }
    }

    /// The probe was acknowledged. Returns the new estimate if it grew.
    pub fn complete_ping(&mut self, now: Instant) -> Option<i64> {
        let PingState::Started(start) = self.ping_state else {
            self.ping_state = PingState::Unscheduled;
            return None;
        };
        let elapsed = now.saturating_duration_since(start).as_secs_f64();
        let bandwidth = if elapsed > 0.0 {
            self.accumulator as f64 / elapsed
        } else {
            0.0
        };

        let mut grew = None;
        if self.accumulator > 2 * self.estimate / 3 && bandwidth > self.bandwidth {
            self.estimate = self.accumulator.max(self.estimate * 2);
            self.bandwidth = bandwidth;
            self.inter_ping_delay = MIN_PING_INTERVAL;
            self.stable_samples = 0;
            debug!(estimate = self.estimate, bandwidth, "bdp estimate grew");
            grew = Some(self.estimate);
        } else {
            self.stable_samples += 1;
            if self.stable_samples >= STABLE_SAMPLES_BEFORE_BACKOFF {
                self.inter_ping_delay = (self.inter_ping_delay * 2).min(MAX_PING_INTERVAL);
                self.stable_samples = 0;
            }
        }

        self.ping_state = PingState::Unscheduled;
        self.accumulator = 0;
        self.next_ping = now + self.inter_ping_delay;
        grew
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grows_when_pipe_is_full() {
        let t0 = Instant::now();
        let mut bdp = BdpEstimator::new(65535, t0);
        assert!(!bdp.need_ping(t0));

        bdp.add_incoming_bytes(1000);
        assert!(bdp.need_ping(t0));
        bdp.schedule_ping();
        bdp.start_ping(t0);
        assert!(!bdp.need_ping(t0));

        bdp.add_incoming_bytes(100_000);
        let grown = bdp.complete_ping(t0 + Duration::from_millis(10));
        assert_eq!(grown, Some(131_070));
        assert_eq!(bdp.estimate(), 131_070);
    }

    #[test]
    fn test_small_sample_does_not_grow() {
        let t0 = Instant::now();
        let mut bdp = BdpEstimator::new(65535, t0);
        bdp.add_incoming_bytes(10);
        bdp.schedule_ping();
        bdp.start_ping(t0);
        bdp.add_incoming_bytes(1000);
        assert_eq!(bdp.complete_ping(t0 + Duration::from_millis(10)), None);
        assert_eq!(bdp.estimate(), 65535);
    }

    #[test]
    fn test_rate_limited_between_pings() {
        let t0 = Instant::now();
        let mut bdp = BdpEstimator::new(65535, t0);
        bdp.add_incoming_bytes(10);
        bdp.schedule_ping();
        bdp.start_ping(t0);
        bdp.complete_ping(t0);
        bdp.add_incoming_bytes(10);
        assert!(!bdp.need_ping(t0 + Duration::from_millis(50)));
        assert!(bdp.need_ping(t0 + MIN_PING_INTERVAL));
    }

    #[test]
    fn test_ack_without_start_resets() {
        let t0 = Instant::now();
        let mut bdp = BdpEstimator::new(65535, t0);
        bdp.add_incoming_bytes(10);
        bdp.schedule_ping();
        assert_eq!(bdp.complete_ping(t0), None);
        bdp.add_incoming_bytes(10);
        assert!(bdp.need_ping(t0));
    }
}
