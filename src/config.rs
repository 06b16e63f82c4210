//! # Configuration Management
//!
//! This module handles loading the server configuration from a TOML file and
//! checking that the combination of options makes sense before any client is
//! served. Command-line flags are layered on top by the binary.
//!
//! ## Example file
//!
//! ```toml
//! data_path = "/tmp/mocap.fifo"
//! buffer_size = 4096
//! read_next = true
//! min_rate = 1.0
//! max_rate = 120.0
//! default_rate = 60.0
//! channel_config = "rig.cfg"
//! server_name = "/tmp/mocap-server.sock"
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name reported to clients and used to derive default paths.
pub const PROGRAM_NAME: &str = "mocap-server";

/// Environment variable consulted when no channel config path is set.
pub const CHANNEL_CONFIG_ENV: &str = "MOCAP_SERVER_CFG";

/// Data path meaning "read records from standard input".
pub const STDIN_PATH: &str = "-";

/// Invalid option combinations, all fatal at startup.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid options for read from standard input: cannot rewind or reopen stdin")]
    StdinReposition,

    #[error("inetd mode uses standard input for the client, pick a data file with -f")]
    InetdStdin,

    #[error("buffer size must be at least 1, got {0}")]
    BufferSize(usize),

    #[error("minimum rate {min} exceeds maximum rate {max}")]
    RateRange { min: f64, max: f64 },
}

/// How the data source is repositioned before each read cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reposition {
    /// Keep reading where the last cycle stopped
    Forward,
    /// Seek back to the start of the source
    Rewind,
    /// Close and reopen the source
    Reopen,
}

/// The complete record-reading policy derived from the configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadPolicy {
    pub reposition: Reposition,
    /// Take the next complete record per cycle instead of draining to the latest
    pub read_next: bool,
}

/// Server configuration loaded from `mocap-server.toml`.
///
/// Every field has a default, so a partial file only overrides what it names.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Record source path, `-` for standard input
    pub data_path: String,
    /// Maximum record length in bytes, newline included
    pub buffer_size: usize,
    /// Read the next record instead of the latest one
    pub read_next: bool,
    /// Rewind the source before every read cycle
    pub rewind: bool,
    /// Reopen the source before every read cycle
    pub reopen: bool,
    /// Lowest recording rate granted, in Hz
    pub min_rate: f64,
    /// Highest recording rate granted, in Hz; `<= 0` disables recording
    pub max_rate: f64,
    /// Rate advertised to clients as the default
    pub default_rate: f64,
    /// Channel configuration file; empty means "use the environment"
    pub channel_config: String,
    /// Unix socket path, or a TCP socket address
    pub server_name: String,
    /// Serve a single client already connected on stdin/stdout
    pub inetd: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            data_path: STDIN_PATH.to_string(),
            buffer_size: 4096,
            read_next: false,
            rewind: false,
            reopen: false,
            min_rate: 1.0,
            max_rate: 300.0,
            default_rate: 60.0,
            channel_config: format!("{PROGRAM_NAME}.cfg"),
            server_name: PROGRAM_NAME.to_string(),
            inetd: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from the specified path.
    /// Falls back to the defaults if the file doesn't exist or is invalid.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<ServerConfig>(&contents) {
                Ok(config) => {
                    log::info!("Loaded configuration from {}", path.display());
                    config
                }
                Err(e) => {
                    log::warn!("Invalid config file format in {}: {}", path.display(), e);
                    log::warn!("Using default configuration");
                    Self::default()
                }
            },
            Err(_) => {
                log::info!(
                    "No config file at {}, using default configuration",
                    path.display()
                );
                Self::default()
            }
        }
    }

    pub fn reads_stdin(&self) -> bool {
        self.data_path == STDIN_PATH
    }

    /// Reject option combinations the server cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reads_stdin() && (self.rewind || self.reopen) {
            return Err(ConfigError::StdinReposition);
        }
        if self.reads_stdin() && self.inetd {
            return Err(ConfigError::InetdStdin);
        }
        if self.buffer_size < 1 {
            return Err(ConfigError::BufferSize(self.buffer_size));
        }
        if self.max_rate > 0.0 && self.min_rate > self.max_rate {
            return Err(ConfigError::RateRange {
                min: self.min_rate,
                max: self.max_rate,
            });
        }
        Ok(())
    }

    /// Reopen wins over rewind when both are set.
    pub fn read_policy(&self) -> ReadPolicy {
        let reposition = if self.reopen {
            Reposition::Reopen
        } else if self.rewind {
            Reposition::Rewind
        } else {
            Reposition::Forward
        };
        ReadPolicy {
            reposition,
            read_next: self.read_next,
        }
    }

    /// Recording is only offered when the maximum rate is positive.
    pub fn can_stream(&self) -> bool {
        self.max_rate > 0.0
    }

    /// Resolve the channel configuration path: configured value, then
    /// `MOCAP_SERVER_CFG`, then `mocap-server.cfg`.
    pub fn channel_config_path(&self) -> PathBuf {
        if !self.channel_config.is_empty() {
            return PathBuf::from(&self.channel_config);
        }
        match std::env::var(CHANNEL_CONFIG_ENV) {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => PathBuf::from(format!("{PROGRAM_NAME}.cfg")),
        }
    }
}
