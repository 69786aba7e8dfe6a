//! Configuration using Figment
//!
//! Settings are loaded from:
//! 1. `config/kepco.toml` (or a file passed to [`Settings::load_from`])
//! 2. Environment variables prefixed with `KEPCO_`, sections split on `__`
//!
//! Every field has a default, so an empty or missing file yields a working
//! configuration. Durations are human-readable (`"35ms"`, `"3s"`).
//!
//! # Example
//! ```no_run
//! use kepco_list::config::Settings;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load()?;
//! settings.validate()?;
//! let channel = settings.channel_config();
//! println!("command gap: {:?}", channel.command_gap);
//! # Ok(())
//! # }
//! ```

use crate::channel::ChannelConfig;
use crate::discovery::{DiscoveryConfig, ProbePort};
use crate::error::AppResult;
use crate::limits::{
    LIST_CMD_BYTE_LIMIT, LIST_VALUES_PER_CMD, MAX_CHUNK_POINTS, MAX_LIST_VALUES_PER_CMD,
    MAX_RETRIES, MIN_COMMAND_GAP, RUN_MARGIN, VERIFY_RETRIES,
};
use crate::logging::{parse_log_level, OutputFormat};
use crate::session::SessionConfig;
use crate::upload::{ErrorCheck, ListMode, UploadConfig};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default settings file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/kepco.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationSettings,
    /// Channel pacing, timeouts and retries
    pub connection: ConnectionSettings,
    /// Upload protocol parameters
    pub upload: UploadSettings,
    /// Subnet scan parameters
    pub discovery: DiscoverySettings,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log line format
    pub log_format: OutputFormat,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: "kepco-list".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::Compact,
        }
    }
}

/// Command channel settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// TCP connect bound
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Per-query response bound
    #[serde(with = "humantime_serde")]
    pub query_timeout: Duration,
    /// Echo collection window (line mode)
    #[serde(with = "humantime_serde")]
    pub echo_timeout: Duration,
    /// Minimum gap between writes
    #[serde(with = "humantime_serde")]
    pub command_gap: Duration,
    /// Re-sends of a timed-out query
    pub query_retries: u32,
    /// Telnet negotiation drain window after connect
    #[serde(with = "humantime_serde")]
    pub negotiation_drain: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        let c = ChannelConfig::default();
        Self {
            connect_timeout: c.connect_timeout,
            query_timeout: c.query_timeout,
            echo_timeout: c.echo_timeout,
            command_gap: c.command_gap,
            query_retries: c.query_retries,
            negotiation_drain: c.negotiation_drain,
        }
    }
}

/// Upload settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    /// `volt` or `curr`
    pub mode: ListMode,
    /// Re-sends of a chunk that failed verification
    pub verify_retries: u32,
    /// `per_chunk` or `after_all`
    pub error_check: ErrorCheck,
    /// Values per LIST data command
    pub values_per_command: usize,
    /// Byte budget per LIST data command
    pub command_byte_limit: usize,
    /// Points per chunk
    pub chunk_size: usize,
    /// Slack added to each chunk's playback in multi-chunk runs
    #[serde(with = "humantime_serde")]
    pub run_margin: Duration,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            mode: ListMode::Voltage,
            verify_retries: VERIFY_RETRIES,
            error_check: ErrorCheck::PerChunk,
            values_per_command: LIST_VALUES_PER_CMD,
            command_byte_limit: LIST_CMD_BYTE_LIMIT,
            chunk_size: MAX_CHUNK_POINTS,
            run_margin: RUN_MARGIN,
        }
    }
}

/// Discovery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// Ports probed on each host, in order
    pub ports: Vec<ProbePort>,
    /// Bound for one port probe
    #[serde(with = "humantime_serde")]
    pub per_host_timeout: Duration,
    /// Wall-clock ceiling for a scan
    #[serde(with = "humantime_serde")]
    pub scan_budget: Duration,
    /// Hosts probed at once
    pub max_concurrency: usize,
    /// Accepted `*IDN?` substrings
    pub identity_markers: Vec<String>,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        let d = DiscoveryConfig::default();
        Self {
            ports: d.ports,
            per_host_timeout: d.per_host_timeout,
            scan_budget: d.scan_budget,
            max_concurrency: d.max_concurrency,
            identity_markers: d.identity_markers,
        }
    }
}

impl Settings {
    /// Load from `config/kepco.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `KEPCO_`.
    /// Example: `KEPCO_CONNECTION__COMMAND_GAP=50ms`
    ///
    /// # Errors
    /// Malformed file or unparseable values.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment apply.
    ///
    /// # Errors
    /// Malformed file or unparseable values.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("KEPCO_").split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// # Errors
    /// A description of the first offending value.
    pub fn validate(&self) -> Result<(), String> {
        parse_log_level(&self.application.log_level)?;

        let conn = &self.connection;
        if conn.command_gap < MIN_COMMAND_GAP {
            return Err(format!(
                "connection.command_gap {:?} is below the device minimum of {:?}",
                conn.command_gap, MIN_COMMAND_GAP
            ));
        }
        if conn.query_retries > MAX_RETRIES {
            return Err(format!(
                "connection.query_retries {} exceeds {}",
                conn.query_retries, MAX_RETRIES
            ));
        }
        if conn.query_timeout.is_zero() || conn.connect_timeout.is_zero() {
            return Err("connection timeouts must be non-zero".to_string());
        }

        let up = &self.upload;
        if up.verify_retries > MAX_RETRIES {
            return Err(format!(
                "upload.verify_retries {} exceeds {}",
                up.verify_retries, MAX_RETRIES
            ));
        }
        if !(1..=MAX_LIST_VALUES_PER_CMD).contains(&up.values_per_command) {
            return Err(format!(
                "upload.values_per_command {} must be 1-{}",
                up.values_per_command, MAX_LIST_VALUES_PER_CMD
            ));
        }
        if !(1..=MAX_CHUNK_POINTS).contains(&up.chunk_size) {
            return Err(format!(
                "upload.chunk_size {} must be 1-{}",
                up.chunk_size, MAX_CHUNK_POINTS
            ));
        }

        let disc = &self.discovery;
        if disc.max_concurrency == 0 {
            return Err("discovery.max_concurrency must be at least 1".to_string());
        }
        if disc.ports.is_empty() {
            return Err("discovery.ports must list at least one port".to_string());
        }

        Ok(())
    }

    /// Runtime channel configuration
    #[must_use]
    pub fn channel_config(&self) -> ChannelConfig {
        let c = &self.connection;
        ChannelConfig {
            connect_timeout: c.connect_timeout,
            query_timeout: c.query_timeout,
            echo_timeout: c.echo_timeout,
            command_gap: c.command_gap,
            query_retries: c.query_retries,
            negotiation_drain: c.negotiation_drain,
        }
    }

    /// Runtime upload configuration
    #[must_use]
    pub fn upload_config(&self) -> UploadConfig {
        let u = &self.upload;
        UploadConfig {
            mode: u.mode,
            verify_retries: u.verify_retries,
            error_check: u.error_check,
            values_per_command: u.values_per_command,
            command_byte_limit: u.command_byte_limit,
            chunk_size: u.chunk_size,
        }
    }

    /// Runtime discovery configuration
    #[must_use]
    pub fn discovery_config(&self) -> DiscoveryConfig {
        let d = &self.discovery;
        DiscoveryConfig {
            ports: d.ports.clone(),
            per_host_timeout: d.per_host_timeout,
            scan_budget: d.scan_budget,
            max_concurrency: d.max_concurrency,
            identity_markers: d.identity_markers.clone(),
        }
    }

    /// Runtime session configuration
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            channel: self.channel_config(),
            upload: self.upload_config(),
            run_margin: self.upload.run_margin,
        }
    }
}
