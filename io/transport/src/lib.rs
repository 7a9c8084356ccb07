//! transport - the HTTP/2 transport under gRPC calls.
//!
//! One [`Transport`] multiplexes many streams over an [`Endpoint`]. All
//! connection state is owned by a combiner: operations from any thread are
//! queued and applied one at a time, and the resulting wire output is
//! batched into a single endpoint write.
//!
//! - `api`: [`Transport`], [`StreamHandle`], [`StreamOp`], [`TransportOp`]
//! - `parser` / `writer`: the inbound and outbound frame paths
//! - `flow_control`, `bdp`, `settings`, `ping`: connection bookkeeping
//! - `keepalive`: idle pings and the watchdog that closes dead connections
//! - `args` / `config`: channel arguments and their TOML form

mod api;
pub mod args;
mod barrier;
mod bdp;
mod combiner;
mod config;
mod connectivity;
mod endpoint;
mod error;
mod fallback;
pub mod flow_control;
mod keepalive;
pub mod logging;
mod parser;
mod ping;
mod settings;
mod stream;
#[cfg(test)]
mod testing;
mod transport;
mod writer;

pub use api::{AcceptStream, ServerData, StreamHandle, StreamOp, Transport, TransportOp};
pub use args::{ArgPointer, ArgValue, ChannelArgs, Role, TransportConfig};
pub use barrier::{Callback, ClosureBarrier};
pub use bdp::BdpEstimator;
pub use combiner::{Action, Actor, Combiner, Deferred};
pub use config::{Config, ConfigError, Http2Config, LogFormat, LoggingConfig};
pub use logging::LoggingError;
pub use connectivity::{ConnectivityState, Watcher};
pub use endpoint::{Endpoint, InlineScheduler, Scheduler, Task};
pub use error::Error;
pub use fallback::{http1_error, parse_status_line};
pub use ping::PingPolicy;
pub use settings::{Change, SettingKind, Settings};
pub use stream::{RecvInitialMetadata, RecvMessage, RecvTrailingMetadata, synthesize_trailers};
pub use transport::{MAX_STREAM_ID, WriteState};
