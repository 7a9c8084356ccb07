//! Keepalive pings, the watchdog that closes a connection whose peer stopped
//! answering, and the timer that releases pings held back by the policy.
//!
//! The scheduler cannot cancel a task, so each timer carries the epoch it
//! was armed in and does nothing if the epoch has moved on when it fires.

use crate::error::Error;
use crate::ping::PingPurpose;
use crate::transport::{TransportState, enqueue};
use grpc::Code;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Largest keepalive time reached by backing off.
const MAX_KEEPALIVE_TIME: Duration = Duration::from_millis(i32::MAX as u64 / 2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveState {
    Disabled,
    /// The keepalive timer is armed.
    Waiting,
    /// A keepalive ping is out and the watchdog is armed.
    Pinging,
    Dying,
}

#[derive(Debug)]
pub(crate) struct Keepalive {
    pub state: KeepaliveState,
    pub time: Option<Duration>,
    pub timer_epoch: u64,
    pub watchdog_epoch: u64,
    pub retry_armed: bool,
}

impl Keepalive {
    pub fn new(time: Option<Duration>) -> Self {
        Self {
            state: if time.is_some() {
                KeepaliveState::Waiting
            } else {
                KeepaliveState::Disabled
            },
            time,
            timer_epoch: 0,
            watchdog_epoch: 0,
            retry_armed: false,
        }
    }

    pub fn on_close(&mut self) {
        if self.state != KeepaliveState::Disabled {
            self.state = KeepaliveState::Dying;
        }
    }
}

impl TransportState {
    fn arm_timer(&mut self, at: Instant, f: impl FnOnce(&mut TransportState) + Send + 'static) {
        let weak = self.this.clone();
        let scheduler = self.scheduler.clone();
        self.defer(move || scheduler.run_at(at, Box::new(move || enqueue(&weak, f))));
    }

    /// Arm the first keepalive timer.
    pub fn start_keepalive(&mut self) {
        if self.keepalive.state == KeepaliveState::Waiting {
            self.arm_keepalive_timer();
        }
    }

    fn arm_keepalive_timer(&mut self) {
        let Some(time) = self.keepalive.time else {
            return;
        };
        self.keepalive.timer_epoch += 1;
        let epoch = self.keepalive.timer_epoch;
        self.arm_timer(Instant::now() + time, move |t| t.keepalive_timer_fired(epoch));
    }

    /// Push the next keepalive ping back: another ping just went out.
    pub fn restart_keepalive_timer(&mut self) {
        if self.keepalive.state == KeepaliveState::Waiting {
            self.arm_keepalive_timer();
        }
    }

    pub(crate) fn keepalive_timer_fired(&mut self, epoch: u64) {
        if epoch != self.keepalive.timer_epoch || self.keepalive.state != KeepaliveState::Waiting {
            return;
        }
        if self.closed.is_some() {
            self.keepalive.state = KeepaliveState::Dying;
            return;
        }
        if self.config.keepalive_permit_without_calls || !self.stream_table.is_empty() {
            debug!(peer = %self.peer, "sending keepalive ping");
            self.keepalive.state = KeepaliveState::Pinging;
            self.pings.queue(PingPurpose::Keepalive);
            self.initiate_write(false, "keepalive_ping");
        } else {
            self.arm_keepalive_timer();
        }
    }

    /// The keepalive ping is in the batch being written.
    pub fn keepalive_ping_started(&mut self) {
        let Some(timeout) = self.config.keepalive_timeout else {
            return;
        };
        self.keepalive.watchdog_epoch += 1;
        let epoch = self.keepalive.watchdog_epoch;
        self.arm_timer(Instant::now() + timeout, move |t| t.keepalive_watchdog_fired(epoch));
    }

    pub fn keepalive_ping_acked(&mut self) {
        if self.keepalive.state != KeepaliveState::Pinging {
            return;
        }
        debug!(peer = %self.peer, "keepalive ping acknowledged");
        self.keepalive.state = KeepaliveState::Waiting;
        self.keepalive.watchdog_epoch += 1;
        self.arm_keepalive_timer();
    }

    pub(crate) fn keepalive_watchdog_fired(&mut self, epoch: u64) {
        if epoch != self.keepalive.watchdog_epoch || self.keepalive.state != KeepaliveState::Pinging {
            return;
        }
        error!(peer = %self.peer, "keepalive ping unanswered, closing transport");
        self.keepalive.state = KeepaliveState::Dying;
        self.drop_connection(Error::new("keepalive watchdog timeout").with_code(Code::Internal));
    }

    /// The server said we ping too much: double the keepalive time, and
    /// stop once it has grown past the maximum.
    pub fn back_off_keepalive(&mut self) {
        let Some(time) = self.keepalive.time else {
            return;
        };
        let doubled = time.saturating_mul(2);
        self.keepalive.time = (doubled <= MAX_KEEPALIVE_TIME).then_some(doubled);
        error!(
            peer = %self.peer,
            keepalive = ?self.keepalive.time,
            "peer sent too_many_pings, backing off keepalive"
        );
    }

    /// Try again to send pings the policy held until `at`.
    pub fn arm_ping_retry(&mut self, at: Instant) {
        if self.keepalive.retry_armed {
            return;
        }
        self.keepalive.retry_armed = true;
        self.arm_timer(at, |t| {
            t.keepalive.retry_armed = false;
            if t.closed.is_none() && t.pings.has_queued() {
                t.initiate_write(false, "retry_send_ping");
            }
        });
    }
}
