//! Connectivity state and its watchers.

use crate::barrier::Callback;
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectivityState::Idle => "IDLE",
            ConnectivityState::Connecting => "CONNECTING",
            ConnectivityState::Ready => "READY",
            ConnectivityState::TransientFailure => "TRANSIENT_FAILURE",
            ConnectivityState::Shutdown => "SHUTDOWN",
        };
        f.write_str(s)
    }
}

/// Callback told about the next state change.
pub type Watcher = Callback<ConnectivityState>;

/// A watcher ready to be told about a state.
pub(crate) type Notification = (Watcher, ConnectivityState);

/// Current state plus one-shot watchers.
pub(crate) struct ConnectivityTracker {
    state: ConnectivityState,
    watchers: Vec<Watcher>,
}

impl ConnectivityTracker {
    pub fn new(state: ConnectivityState) -> Self {
        Self {
            state,
            watchers: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    /// Watch for a state other than `last_seen`. If the state already
    /// differs, the watcher is returned for immediate notification.
    pub fn notify_on_state_change(
        &mut self,
        last_seen: ConnectivityState,
        watcher: Watcher,
    ) -> Option<Notification> {
        if self.state != last_seen || self.state == ConnectivityState::Shutdown {
            return Some((watcher, self.state));
        }
        self.watchers.push(watcher);
        None
    }

    /// Move to `state`. SHUTDOWN is terminal. Returns the watchers to notify.
    pub fn set(&mut self, state: ConnectivityState, reason: &str) -> Vec<Notification> {
        if self.state == state || self.state == ConnectivityState::Shutdown {
            return Vec::new();
        }
        debug!(from = %self.state, to = %state, reason, "connectivity state change");
        self.state = state;
        self.watchers.drain(..).map(|w| (w, state)).collect()
    }
}
