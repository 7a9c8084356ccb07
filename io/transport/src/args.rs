//! Channel arguments and the resolved transport configuration.

use crate::ping::PingPolicy;
use http2::{DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE, MAX_WINDOW_SIZE};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub const INITIAL_SEQUENCE_NUMBER: &str = "grpc.http2.initial_sequence_number";
pub const HPACK_TABLE_SIZE_ENCODER: &str = "grpc.http2.hpack_table_size.encoder";
pub const HPACK_TABLE_SIZE_DECODER: &str = "grpc.http2.hpack_table_size.decoder";
pub const MAX_CONCURRENT_STREAMS: &str = "grpc.max_concurrent_streams";
pub const INITIAL_WINDOW_SIZE: &str = "grpc.http2.initial_window_size";
pub const LOOKAHEAD_BYTES: &str = "grpc.http2.lookahead_bytes";
pub const MAX_METADATA_SIZE: &str = "grpc.http2.max_metadata_size";
pub const BDP_PROBE: &str = "grpc.http2.bdp_probe";
pub const KEEPALIVE_TIME_MS: &str = "grpc.keepalive_time_ms";
pub const KEEPALIVE_TIMEOUT_MS: &str = "grpc.keepalive_timeout_ms";
pub const KEEPALIVE_PERMIT_WITHOUT_CALLS: &str = "grpc.keepalive_permit_without_calls";
pub const MAX_PINGS_WITHOUT_DATA: &str = "grpc.http2.max_pings_without_data";
pub const MAX_PING_STRIKES: &str = "grpc.http2.max_ping_strikes";
pub const MIN_TIME_BETWEEN_PINGS_MS: &str = "grpc.http2.min_time_between_pings_ms";
pub const MIN_PING_INTERVAL_WITHOUT_DATA_MS: &str = "grpc.http2.min_ping_interval_without_data_ms";

/// Millisecond value that stands for "never".
pub const INFINITE_MS: i64 = i32::MAX as i64;

/// Default advertised MAX_HEADER_LIST_SIZE.
pub const DEFAULT_MAX_METADATA_SIZE: u32 = 16 * 1024;

/// Opaque value passed through channel args.
pub trait ArgPointer: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    fn compare(&self, other: &dyn ArgPointer) -> Ordering;
}

#[derive(Debug, Clone)]
pub enum ArgValue {
    Str(String),
    Int(i64),
    Pointer(Arc<dyn ArgPointer>),
}

impl ArgValue {
    fn type_name(&self) -> &'static str {
        match self {
            ArgValue::Str(_) => "string",
            ArgValue::Int(_) => "integer",
            ArgValue::Pointer(_) => "pointer",
        }
    }
}

impl From<i64> for ArgValue {
    fn from(v: i64) -> Self {
        ArgValue::Int(v)
    }
}

impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        ArgValue::Str(v.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(v: String) -> Self {
        ArgValue::Str(v)
    }
}

/// Ordered key/value settings. Setting a key again replaces its value.
#[derive(Debug, Clone, Default)]
pub struct ChannelArgs {
    args: Vec<(String, ArgValue)>,
}

impl ChannelArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.args.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.args.push((key, value)),
        }
        self
    }

    pub fn set_pointer(self, key: impl Into<String>, value: Arc<dyn ArgPointer>) -> Self {
        self.set(key, ArgValue::Pointer(value))
    }

    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.args.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            ArgValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            ArgValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_pointer(&self, key: &str) -> Option<&Arc<dyn ArgPointer>> {
        match self.get(key)? {
            ArgValue::Pointer(v) => Some(v),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArgValue)> {
        self.args.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Integer arg within `min..=max`; anything else is logged and ignored.
    fn int_in(&self, key: &str, min: i64, max: i64) -> Option<i64> {
        let value = self.get(key)?;
        match value {
            ArgValue::Int(v) if (min..=max).contains(v) => Some(*v),
            ArgValue::Int(v) => {
                warn!(key, value = v, min, max, "channel arg out of range, ignoring");
                None
            }
            other => {
                warn!(key, kind = other.type_name(), "channel arg should be an integer, ignoring");
                None
            }
        }
    }
}

/// Which side of the connection this transport is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn is_client(self) -> bool {
        self == Role::Client
    }
}

/// Typed transport settings resolved from [`ChannelArgs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// First stream id this side assigns. Odd for clients, even for servers.
    pub initial_stream_id: u32,
    /// Upper bound on the HPACK encoder's dynamic table.
    pub encoder_table_size: u32,
    /// HEADER_TABLE_SIZE advertised to the peer.
    pub decoder_table_size: u32,
    /// MAX_CONCURRENT_STREAMS advertised to the peer; `None` leaves it unlimited.
    pub max_concurrent_streams: Option<u32>,
    /// INITIAL_WINDOW_SIZE advertised to the peer.
    pub initial_window_size: u32,
    /// Smallest stream window the BDP estimator will size to.
    pub lookahead_bytes: u32,
    /// MAX_HEADER_LIST_SIZE advertised to the peer.
    pub max_metadata_size: u32,
    pub bdp_probe: bool,
    /// Idle time before a keepalive ping; `None` disables keepalive.
    pub keepalive_time: Option<Duration>,
    /// How long a keepalive ping may go unanswered; `None` waits forever.
    pub keepalive_timeout: Option<Duration>,
    pub keepalive_permit_without_calls: bool,
    pub ping_policy: PingPolicy,
}

/// `ms` as a duration, with [`INFINITE_MS`] meaning none.
fn finite_ms(ms: i64) -> Option<Duration> {
    (ms < INFINITE_MS).then(|| Duration::from_millis(ms as u64))
}

impl TransportConfig {
    pub fn defaults(role: Role) -> Self {
        Self {
            initial_stream_id: if role.is_client() { 1 } else { 2 },
            encoder_table_size: DEFAULT_HEADER_TABLE_SIZE,
            decoder_table_size: DEFAULT_HEADER_TABLE_SIZE,
            max_concurrent_streams: None,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            lookahead_bytes: DEFAULT_INITIAL_WINDOW_SIZE,
            max_metadata_size: DEFAULT_MAX_METADATA_SIZE,
            bdp_probe: true,
            keepalive_time: if role.is_client() {
                None
            } else {
                Some(Duration::from_secs(2 * 60 * 60))
            },
            keepalive_timeout: Some(Duration::from_secs(20)),
            keepalive_permit_without_calls: false,
            ping_policy: PingPolicy::default(),
        }
    }

    pub fn from_args(args: &ChannelArgs, role: Role) -> Self {
        let mut config = Self::defaults(role);
        let u32_max = u32::MAX as i64;
        let window_max = MAX_WINDOW_SIZE as i64;

        if let Some(v) = args.int_in(INITIAL_SEQUENCE_NUMBER, 1, window_max) {
            let wants_odd = role.is_client();
            if (v & 1 == 1) == wants_odd {
                config.initial_stream_id = v as u32;
            } else {
                warn!(
                    value = v,
                    ?role,
                    "initial sequence number has the wrong parity for this side, ignoring"
                );
            }
        }
        if let Some(v) = args.int_in(HPACK_TABLE_SIZE_ENCODER, 0, u32_max) {
            config.encoder_table_size = v as u32;
        }
        if let Some(v) = args.int_in(HPACK_TABLE_SIZE_DECODER, 0, u32_max) {
            config.decoder_table_size = v as u32;
        }
        if let Some(v) = args.int_in(MAX_CONCURRENT_STREAMS, 0, u32_max) {
            config.max_concurrent_streams = Some(v as u32);
        }
        if let Some(v) = args.int_in(INITIAL_WINDOW_SIZE, 0, window_max) {
            config.initial_window_size = v as u32;
        }
        if let Some(v) = args.int_in(LOOKAHEAD_BYTES, 0, window_max) {
            config.lookahead_bytes = v as u32;
        }
        if let Some(v) = args.int_in(MAX_METADATA_SIZE, 0, u32_max) {
            config.max_metadata_size = v as u32;
        }
        if let Some(v) = args.int_in(BDP_PROBE, 0, 1) {
            config.bdp_probe = v == 1;
        }
        if let Some(v) = args.int_in(KEEPALIVE_TIME_MS, 1, INFINITE_MS) {
            config.keepalive_time = finite_ms(v);
        }
        if let Some(v) = args.int_in(KEEPALIVE_TIMEOUT_MS, 0, INFINITE_MS) {
            config.keepalive_timeout = finite_ms(v);
        }
        if let Some(v) = args.int_in(KEEPALIVE_PERMIT_WITHOUT_CALLS, 0, 1) {
            config.keepalive_permit_without_calls = v == 1;
        }
        let policy = &mut config.ping_policy;
        if let Some(v) = args.int_in(MAX_PINGS_WITHOUT_DATA, 0, INFINITE_MS) {
            policy.max_pings_without_data = v as u32;
        }
        if let Some(v) = args.int_in(MAX_PING_STRIKES, 0, INFINITE_MS) {
            policy.max_ping_strikes = v as u32;
        }
        if let Some(v) = args.int_in(MIN_TIME_BETWEEN_PINGS_MS, 0, INFINITE_MS) {
            policy.min_sent_interval = Duration::from_millis(v as u64);
        }
        if let Some(v) = args.int_in(MIN_PING_INTERVAL_WITHOUT_DATA_MS, 0, INFINITE_MS) {
            policy.min_recv_interval = Duration::from_millis(v as u64);
        }
        config
    }
}
