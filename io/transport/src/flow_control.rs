//! Window arithmetic for connection and stream flow control.
//!
//! Windows are kept as `i64` so intermediate sums cannot overflow, and are
//! always stored within `0..=MAX_WINDOW`.

use crate::bdp::BdpEstimator;
use crate::error::Error;
use http2::{DEFAULT_INITIAL_WINDOW_SIZE, ErrorCode, MAX_WINDOW_SIZE};
use std::time::Instant;
use tracing::trace;

pub const MAX_WINDOW: i64 = MAX_WINDOW_SIZE as i64;

/// Receive window the connection aims to keep open (1 MiB).
pub const CONNECTION_WINDOW_TARGET: i64 = 1 << 20;

pub fn clamp_window(value: i64) -> i64 {
    value.clamp(0, MAX_WINDOW)
}

/// Add a WINDOW_UPDATE increment. A result past `MAX_WINDOW` is illegal and
/// leaves the window unchanged.
pub fn credit(window: &mut i64, increment: u32) -> Result<(), Error> {
    let next = *window + increment as i64;
    if next > MAX_WINDOW {
        return Err(
            Error::new(format!("window update of {} overflows window {}", increment, window))
                .with_http2_error(ErrorCode::FlowControlError),
        );
    }
    *window = clamp_window(next);
    Ok(())
}

/// Remove sent or received bytes from a window.
pub fn debit(window: &mut i64, amount: u32) {
    *window = clamp_window(*window - amount as i64);
}

/// Apply a change of INITIAL_WINDOW_SIZE. Returns true when the window went
/// from closed to open.
pub fn adjust(window: &mut i64, delta: i64) -> bool {
    let was_closed = *window <= 0;
    *window = clamp_window(*window + delta);
    was_closed && *window > 0
}

/// Increment that restores `window` to `target`, once it has dropped below
/// three quarters of it.
pub fn update_due(window: i64, target: i64) -> Option<u32> {
    if window < target - target / 4 {
        Some((target - window).clamp(0, MAX_WINDOW) as u32)
    } else {
        None
    }
}

/// Connection-scoped windows plus the BDP estimator that sizes stream windows.
#[derive(Debug)]
pub struct TransportFlowControl {
    /// Bytes the peer lets us send on the connection.
    pub outgoing: i64,
    /// Bytes we let the peer send on the connection.
    pub incoming: i64,
    target: i64,
    bdp: Option<BdpEstimator>,
    lookahead: i64,
}

impl TransportFlowControl {
    pub fn new(lookahead: u32, bdp_probe: bool, now: Instant) -> Self {
        let lookahead = lookahead as i64;
        Self {
            outgoing: DEFAULT_INITIAL_WINDOW_SIZE as i64,
            incoming: DEFAULT_INITIAL_WINDOW_SIZE as i64,
            target: CONNECTION_WINDOW_TARGET.max(lookahead),
            bdp: bdp_probe.then(|| BdpEstimator::new(lookahead, now)),
            lookahead,
        }
    }

    pub fn bdp_enabled(&self) -> bool {
        self.bdp.is_some()
    }

    /// Account for a received DATA frame. More than the connection window is
    /// a connection FLOW_CONTROL_ERROR.
    pub fn recv_data(&mut self, len: u32) -> Result<(), Error> {
        if len as i64 > self.incoming {
            return Err(Error::new(format!(
                "frame of {} bytes exceeds connection window of {}",
                len, self.incoming
            ))
            .with_http2_error(ErrorCode::FlowControlError));
        }
        debit(&mut self.incoming, len);
        if let Some(bdp) = &mut self.bdp {
            bdp.add_incoming_bytes(len);
        }
        Ok(())
    }

    /// WINDOW_UPDATE owed on the connection, already credited.
    pub fn take_connection_update(&mut self) -> Option<u32> {
        let increment = update_due(self.incoming, self.target)?;
        self.incoming = clamp_window(self.incoming + increment as i64);
        trace!(increment, "connection window update");
        Some(increment)
    }

    pub fn bdp_need_ping(&self, now: Instant) -> bool {
        self.bdp.as_ref().is_some_and(|b| b.need_ping(now))
    }

    pub fn bdp_schedule_ping(&mut self) {
        if let Some(bdp) = &mut self.bdp {
            bdp.schedule_ping();
        }
    }

    pub fn bdp_start_ping(&mut self, now: Instant) {
        if let Some(bdp) = &mut self.bdp {
            bdp.start_ping(now);
        }
    }

    /// Finish a probe. Returns the new stream window target when the
    /// estimate grew.
    pub fn bdp_complete_ping(&mut self, now: Instant) -> Option<u32> {
        let estimate = self.bdp.as_mut()?.complete_ping(now)?;
        let target = (2 * estimate).clamp(self.lookahead, MAX_WINDOW);
        self.target = self.target.max(target);
        Some(target as u32)
    }
}
