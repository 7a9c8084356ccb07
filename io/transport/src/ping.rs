//! Outstanding PINGs keyed by their opaque payload, and the policy that
//! limits how often pings go out and come in while no data is flowing.

use crate::barrier::Callback;
use crate::error::Error;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Minimum gap between peer pings while no call is open.
const IDLE_RECV_PING_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);

/// Why a ping was sent.
pub enum PingPurpose {
    /// Requested through the transport API.
    User(Callback<Result<(), Error>>),
    /// Probe for the BDP estimator.
    Bdp,
    Keepalive,
}

impl std::fmt::Debug for PingPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PingPurpose::User(_) => f.write_str("User"),
            PingPurpose::Bdp => f.write_str("Bdp"),
            PingPurpose::Keepalive => f.write_str("Keepalive"),
        }
    }
}

/// Limits on pings sent and received without data in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingPolicy {
    /// Pings we may send before data must go out. Zero is unlimited.
    pub max_pings_without_data: u32,
    pub min_sent_interval: Duration,
    /// Early peer pings a server tolerates before GOAWAY. Zero is unlimited.
    pub max_ping_strikes: u32,
    pub min_recv_interval: Duration,
}

impl Default for PingPolicy {
    fn default() -> Self {
        Self {
            max_pings_without_data: 0,
            min_sent_interval: Duration::from_secs(300),
            max_ping_strikes: 2,
            min_recv_interval: Duration::from_secs(300),
        }
    }
}

/// Pings moved in flight by [`Pings::start_queued`].
#[derive(Debug, Default)]
pub struct Started {
    pub payloads: Vec<[u8; 8]>,
    pub bdp: bool,
    pub keepalive: bool,
    /// Queued pings are held until then.
    pub retry_at: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct Pings {
    next_id: u64,
    queued: Vec<PingPurpose>,
    inflight: HashMap<u64, PingPurpose>,
    /// Payloads of peer pings still to be echoed.
    acks_owed: Vec<[u8; 8]>,

    policy: PingPolicy,
    pings_before_data: u32,
    last_sent: Option<Instant>,
    last_recv: Option<Instant>,
    strikes: u32,
}

impl Pings {
    pub fn new(policy: PingPolicy) -> Self {
        Self {
            policy,
            pings_before_data: policy.max_pings_without_data,
            ..Self::default()
        }
    }

    pub fn queue(&mut self, purpose: PingPurpose) {
        self.queued.push(purpose);
    }

    pub fn owe_ack(&mut self, data: [u8; 8]) {
        self.acks_owed.push(data);
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.queued.is_empty() || !self.acks_owed.is_empty()
    }

    pub fn has_queued(&self) -> bool {
        !self.queued.is_empty()
    }

    pub fn take_acks(&mut self) -> Vec<[u8; 8]> {
        std::mem::take(&mut self.acks_owed)
    }

    /// Assign ids to queued pings and move them in flight, unless the
    /// policy holds them back. Pings queued together go out together and
    /// count once against the policy.
    pub fn start_queued(&mut self, now: Instant) -> Started {
        let mut started = Started::default();
        if self.queued.is_empty() {
            return started;
        }
        if self.policy.max_pings_without_data != 0 && self.pings_before_data == 0 {
            debug!(queued = self.queued.len(), "ping held until data is sent");
            return started;
        }
        if let Some(last) = self.last_sent {
            let next_allowed = last + self.policy.min_sent_interval;
            if now < next_allowed {
                debug!(wait = ?(next_allowed - now), "ping held by minimum interval");
                started.retry_at = Some(next_allowed);
                return started;
            }
        }
        self.last_sent = Some(now);
        self.pings_before_data = self.pings_before_data.saturating_sub(1);

        for purpose in self.queued.drain(..) {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            started.bdp |= matches!(purpose, PingPurpose::Bdp);
            started.keepalive |= matches!(purpose, PingPurpose::Keepalive);
            self.inflight.insert(id, purpose);
            started.payloads.push(id.to_be_bytes());
        }
        started
    }

    /// Match an ACK. Unknown payloads are logged and ignored.
    pub fn ack(&mut self, data: [u8; 8]) -> Option<PingPurpose> {
        let id = u64::from_be_bytes(data);
        let purpose = self.inflight.remove(&id);
        if purpose.is_none() {
            debug!(id, "ack for unknown ping");
        }
        purpose
    }

    /// HEADERS or DATA went out: the send budget refills and the peer's
    /// strikes are forgiven.
    pub fn note_data_sent(&mut self) {
        self.pings_before_data = self.policy.max_pings_without_data;
        self.last_recv = None;
        self.strikes = 0;
    }

    /// HEADERS or DATA arrived: the next ping may go out at once.
    pub fn note_data_received(&mut self) {
        self.last_sent = None;
    }

    /// Record a peer ping. Returns true once the peer has run out of
    /// strikes.
    pub fn on_ping_received(&mut self, now: Instant, calls_open: bool, permit_without_calls: bool) -> bool {
        let interval = if calls_open || permit_without_calls {
            self.policy.min_recv_interval
        } else {
            IDLE_RECV_PING_INTERVAL
        };
        let early = self.last_recv.is_some_and(|last| now < last + interval);
        self.last_recv = Some(now);
        if !early {
            return false;
        }
        self.strikes += 1;
        debug!(strikes = self.strikes, max = self.policy.max_ping_strikes, "ping strike");
        self.policy.max_ping_strikes != 0 && self.strikes > self.policy.max_ping_strikes
    }

    /// Every ping not yet acknowledged, for failing on close.
    pub fn drain(&mut self) -> Vec<PingPurpose> {
        self.queued
            .drain(..)
            .chain(self.inflight.drain().map(|(_, p)| p))
            .collect()
    }
}
