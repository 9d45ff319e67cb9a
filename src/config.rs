//! Consumer configuration.
//!
//! All tunables recognised by the core, loadable from a TOML file. Every
//! field has a default so a partial file (or none at all) yields a working
//! configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Size of the partition space; streams are indexed by vbid below this.
    pub max_vbuckets: u16,

    /// Ask the producer to send noop heartbeats.
    pub dcp_enable_noop: bool,

    /// Interval between producer noops, in seconds. Silence for twice this
    /// long disconnects the connection.
    pub dcp_noop_interval_secs: u64,

    /// Ask the producer to compress values.
    pub dcp_value_compression_enabled: bool,

    /// Receive-buffer size announced to the producer; the flow-control
    /// window.
    pub flow_control_buf_bytes: u32,

    /// A buffer acknowledgement is emitted once freed bytes reach
    /// `flow_control_buf_bytes / flow_control_ack_ratio`.
    pub flow_control_ack_ratio: u32,

    /// Buffered messages drained per stream per processor pass.
    pub processor_batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_vbuckets: 1024,
            dcp_enable_noop: true,
            dcp_noop_interval_secs: 180,
            dcp_value_compression_enabled: false,
            flow_control_buf_bytes: 10 * 1024 * 1024,
            flow_control_ack_ratio: 5,
            processor_batch_size: 10,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_vbuckets == 0 {
            return Err(ConfigError::Invalid("max_vbuckets must be non-zero"));
        }
        if self.flow_control_buf_bytes == 0 {
            return Err(ConfigError::Invalid("flow_control_buf_bytes must be non-zero"));
        }
        if self.flow_control_ack_ratio == 0 {
            return Err(ConfigError::Invalid("flow_control_ack_ratio must be non-zero"));
        }
        if self.processor_batch_size == 0 {
            return Err(ConfigError::Invalid("processor_batch_size must be non-zero"));
        }
        if self.dcp_enable_noop && self.dcp_noop_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "dcp_noop_interval_secs must be non-zero when noop is enabled",
            ));
        }
        Ok(())
    }

    pub fn noop_interval(&self) -> Duration {
        Duration::from_secs(self.dcp_noop_interval_secs)
    }
}
