//! The four views of HTTP/2 settings.
//!
//! `local` is what this side wants, `sent` what has been put on the wire,
//! `acked` what the peer has acknowledged and `peer` what the peer
//! announced. Only the settings gRPC uses are tracked.

use crate::error::Error;
use http2::{ErrorCode, MAX_WINDOW_SIZE, Setting, SettingId};
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    HeaderTableSize = 0,
    EnablePush = 1,
    MaxConcurrentStreams = 2,
    InitialWindowSize = 3,
    MaxHeaderListSize = 4,
}

impl SettingKind {
    pub const ALL: [SettingKind; 5] = [
        SettingKind::HeaderTableSize,
        SettingKind::EnablePush,
        SettingKind::MaxConcurrentStreams,
        SettingKind::InitialWindowSize,
        SettingKind::MaxHeaderListSize,
    ];

    pub fn from_id(id: SettingId) -> Option<Self> {
        Some(match id {
            SettingId::HeaderTableSize => SettingKind::HeaderTableSize,
            SettingId::EnablePush => SettingKind::EnablePush,
            SettingId::MaxConcurrentStreams => SettingKind::MaxConcurrentStreams,
            SettingId::InitialWindowSize => SettingKind::InitialWindowSize,
            SettingId::MaxHeaderListSize => SettingKind::MaxHeaderListSize,
            SettingId::MaxFrameSize | SettingId::Unknown(_) => return None,
        })
    }

    pub fn id(self) -> SettingId {
        match self {
            SettingKind::HeaderTableSize => SettingId::HeaderTableSize,
            SettingKind::EnablePush => SettingId::EnablePush,
            SettingKind::MaxConcurrentStreams => SettingId::MaxConcurrentStreams,
            SettingKind::InitialWindowSize => SettingId::InitialWindowSize,
            SettingKind::MaxHeaderListSize => SettingId::MaxHeaderListSize,
        }
    }

    fn params(self) -> &'static Params {
        &PARAMS[self as usize]
    }
}

struct Params {
    name: &'static str,
    default: u32,
    min: u32,
    max: u32,
    on_invalid: OnInvalid,
}

/// What to do with a peer value outside `min..=max`.
enum OnInvalid {
    Clamp,
    Reject(ErrorCode),
}

/// Protocol defaults and bounds, indexed by [`SettingKind`].
static PARAMS: [Params; 5] = [
    Params {
        name: "HEADER_TABLE_SIZE",
        default: 4096,
        min: 0,
        max: u32::MAX,
        on_invalid: OnInvalid::Reject(ErrorCode::ProtocolError),
    },
    Params {
        name: "ENABLE_PUSH",
        default: 1,
        min: 0,
        max: 1,
        on_invalid: OnInvalid::Reject(ErrorCode::ProtocolError),
    },
    Params {
        name: "MAX_CONCURRENT_STREAMS",
        default: u32::MAX,
        min: 0,
        max: u32::MAX,
        on_invalid: OnInvalid::Reject(ErrorCode::ProtocolError),
    },
    Params {
        name: "INITIAL_WINDOW_SIZE",
        default: 65535,
        min: 0,
        max: MAX_WINDOW_SIZE,
        on_invalid: OnInvalid::Reject(ErrorCode::FlowControlError),
    },
    Params {
        name: "MAX_HEADER_LIST_SIZE",
        default: 16_777_216,
        min: 0,
        max: 16_777_216,
        on_invalid: OnInvalid::Clamp,
    },
];

type SettingSet = [u32; 5];

fn defaults() -> SettingSet {
    let mut set = [0; 5];
    for kind in SettingKind::ALL {
        set[kind as usize] = kind.params().default;
    }
    set
}

/// A peer setting that changed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Change {
    pub kind: SettingKind,
    pub old: u32,
    pub new: u32,
}

#[derive(Debug)]
pub struct Settings {
    local: SettingSet,
    sent: SettingSet,
    acked: SettingSet,
    peer: SettingSet,
    dirty: bool,
    /// SETTINGS frames sent and not yet acknowledged.
    unacked: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self::new()
    }
}

impl Settings {
    /// All four sets at protocol defaults. The first SETTINGS frame is always
    /// owed, even when it carries no changes.
    pub fn new() -> Self {
        Self {
            local: defaults(),
            sent: defaults(),
            acked: defaults(),
            peer: defaults(),
            dirty: true,
            unacked: 0,
        }
    }

    pub fn local(&self, kind: SettingKind) -> u32 {
        self.local[kind as usize]
    }

    pub fn sent(&self, kind: SettingKind) -> u32 {
        self.sent[kind as usize]
    }

    pub fn acked(&self, kind: SettingKind) -> u32 {
        self.acked[kind as usize]
    }

    pub fn peer(&self, kind: SettingKind) -> u32 {
        self.peer[kind as usize]
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Change a local setting, clamped to its legal range. Only a real change
    /// makes the set dirty.
    pub fn push(&mut self, kind: SettingKind, value: u32) {
        let params = kind.params();
        let clamped = value.clamp(params.min, params.max);
        if clamped != value {
            warn!(
                setting = params.name,
                requested = value,
                used = clamped,
                "setting out of range, clamping"
            );
        }
        if self.local[kind as usize] != clamped {
            self.local[kind as usize] = clamped;
            self.dirty = true;
        }
    }

    /// Settings that differ between `local` and `sent`, marking them sent.
    pub fn take_diff(&mut self) -> Vec<Setting> {
        let mut out = Vec::new();
        for kind in SettingKind::ALL {
            let i = kind as usize;
            if self.local[i] != self.sent[i] {
                out.push(Setting {
                    id: kind.id(),
                    value: self.local[i],
                });
                self.sent[i] = self.local[i];
            }
        }
        self.dirty = false;
        self.unacked += 1;
        out
    }

    /// The peer acknowledged our oldest outstanding SETTINGS. Returns false
    /// for an ACK nothing was waiting for.
    pub fn ack(&mut self) -> bool {
        if self.unacked == 0 {
            warn!("SETTINGS ack without outstanding SETTINGS");
            return false;
        }
        self.unacked -= 1;
        self.acked = self.sent;
        true
    }

    /// Merge a SETTINGS frame from the peer. Unknown or untracked ids are
    /// ignored; out-of-range values are connection errors.
    pub fn apply_peer(&mut self, settings: &[Setting]) -> Result<Vec<Change>, Error> {
        let mut changes = Vec::new();
        for setting in settings {
            let Some(kind) = SettingKind::from_id(setting.id) else {
                trace!(id = setting.id.to_u16(), "ignoring setting");
                continue;
            };
            let params = kind.params();
            let mut value = setting.value;
            if value < params.min || value > params.max {
                match params.on_invalid {
                    OnInvalid::Clamp => value = value.clamp(params.min, params.max),
                    OnInvalid::Reject(code) => {
                        return Err(Error::new(format!(
                            "invalid value {} for {}",
                            value, params.name
                        ))
                        .with_http2_error(code));
                    }
                }
            }
            let old = self.peer[kind as usize];
            if old != value {
                self.peer[kind as usize] = value;
                changes.push(Change { kind, old, new: value });
            }
            trace!(setting = params.name, value, "peer setting");
        }
        Ok(changes)
    }
}
