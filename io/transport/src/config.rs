//! TOML configuration.
//!
//! ```toml
//! [http2]
//! initial_window_size = 1048576
//! max_concurrent_streams = 100
//! bdp_probe = false
//! keepalive_time_ms = 30000
//! keepalive_permit_without_calls = true
//!
//! [logging]
//! level = "debug"
//! format = "compact"
//! ```

use crate::args::{self, ChannelArgs};
use crate::logging::{self, LoggingError};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Transport settings, turned into channel args.
    #[serde(default)]
    pub http2: Http2Config,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    pub fn channel_args(&self) -> ChannelArgs {
        self.http2.channel_args()
    }

    /// Install the global subscriber from the `[logging]` table.
    pub fn init_logging(&self) -> Result<(), LoggingError> {
        logging::init(&self.logging)
    }
}

/// Transport settings. Absent fields keep the transport defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Http2Config {
    pub initial_sequence_number: Option<i64>,
    pub hpack_table_size_encoder: Option<i64>,
    pub hpack_table_size_decoder: Option<i64>,
    pub max_concurrent_streams: Option<i64>,
    pub initial_window_size: Option<i64>,
    pub lookahead_bytes: Option<i64>,
    pub max_metadata_size: Option<i64>,
    pub bdp_probe: Option<bool>,
    pub keepalive_time_ms: Option<i64>,
    pub keepalive_timeout_ms: Option<i64>,
    pub keepalive_permit_without_calls: Option<bool>,
    pub max_pings_without_data: Option<i64>,
    pub max_ping_strikes: Option<i64>,
    pub min_time_between_pings_ms: Option<i64>,
    pub min_ping_interval_without_data_ms: Option<i64>,
}

impl Http2Config {
    pub fn channel_args(&self) -> ChannelArgs {
        let ints = [
            (args::INITIAL_SEQUENCE_NUMBER, self.initial_sequence_number),
            (args::HPACK_TABLE_SIZE_ENCODER, self.hpack_table_size_encoder),
            (args::HPACK_TABLE_SIZE_DECODER, self.hpack_table_size_decoder),
            (args::MAX_CONCURRENT_STREAMS, self.max_concurrent_streams),
            (args::INITIAL_WINDOW_SIZE, self.initial_window_size),
            (args::LOOKAHEAD_BYTES, self.lookahead_bytes),
            (args::MAX_METADATA_SIZE, self.max_metadata_size),
            (args::BDP_PROBE, self.bdp_probe.map(i64::from)),
            (args::KEEPALIVE_TIME_MS, self.keepalive_time_ms),
            (args::KEEPALIVE_TIMEOUT_MS, self.keepalive_timeout_ms),
            (
                args::KEEPALIVE_PERMIT_WITHOUT_CALLS,
                self.keepalive_permit_without_calls.map(i64::from),
            ),
            (args::MAX_PINGS_WITHOUT_DATA, self.max_pings_without_data),
            (args::MAX_PING_STRIKES, self.max_ping_strikes),
            (args::MIN_TIME_BETWEEN_PINGS_MS, self.min_time_between_pings_ms),
            (
                args::MIN_PING_INTERVAL_WITHOUT_DATA_MS,
                self.min_ping_interval_without_data_ms,
            ),
        ];
        ints.into_iter()
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .fold(ChannelArgs::new(), |acc, (key, v)| acc.set(key, v))
    }
}

impl ChannelArgs {
    /// Channel args from the `[http2]` table of a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Config::from_toml_str(content).map(|c| c.channel_args())
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Config::load(path).map(|c| c.channel_args())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: LogFormat::default(),
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::{Role, TransportConfig};

    #[test]
    fn test_empty_config() {
        let config = Config::from_toml_str("").unwrap();
        assert!(config.channel_args().is_empty());
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_http2_section() {
        let config = Config::from_toml_str(
            r#"
            [http2]
            initial_window_size = 1048576
            max_concurrent_streams = 100
            bdp_probe = false

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        let args = config.channel_args();
        assert_eq!(args.get_int(args::INITIAL_WINDOW_SIZE), Some(1_048_576));
        assert_eq!(args.get_int(args::BDP_PROBE), Some(0));

        let resolved = TransportConfig::from_args(&args, Role::Server);
        assert_eq!(resolved.max_concurrent_streams, Some(100));
        assert!(!resolved.bdp_probe);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_keepalive_fields() {
        let config = Config::from_toml_str(
            r#"
            [http2]
            keepalive_time_ms = 30000
            keepalive_permit_without_calls = true
            max_ping_strikes = 0
            "#,
        )
        .unwrap();
        let resolved = TransportConfig::from_args(&config.channel_args(), Role::Client);
        assert_eq!(resolved.keepalive_time, Some(std::time::Duration::from_secs(30)));
        assert!(resolved.keepalive_permit_without_calls);
        assert_eq!(resolved.ping_policy.max_ping_strikes, 0);
    }

    #[test]
    fn test_logging_section() {
        let config = Config::from_toml_str("[logging]\nformat = \"json\"\n").unwrap();
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(Config::from_toml_str("[logging]\nformat = \"xml\"\n").is_err());

        let config = Config::from_toml_str("[logging]\nlevel = \"transport=loud\"\n").unwrap();
        if std::env::var("RUST_LOG").is_err() {
            assert!(matches!(config.init_logging(), Err(LoggingError::Filter { .. })));
        }
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = ChannelArgs::from_toml_str("[http2]\nmax_frame_size = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load(Path::new("/nonexistent/transport.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
