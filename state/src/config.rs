// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for working with machine state configuration

use dropshot::ConfigLogging;
use serde::Deserialize;
use serde::Serialize;
use slog::Logger;
use std::path::{Path, PathBuf};

/// Largest number of voting peers the replica set can hold
pub const MAX_PEERS: usize = 7;

/// Configuration for machine state maintenance
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Configuration for the debug log
    pub log: ConfigLogging,
    #[serde(default)]
    pub quorum: QuorumConfig,
}

/// Limits on the set of voting state servers
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct QuorumConfig {
    /// Replica-peer ceiling: the largest number of voting state servers
    /// `ensure_availability` will accept
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
}

fn default_max_peers() -> usize {
    MAX_PEERS
}

impl Default for QuorumConfig {
    fn default() -> Self {
        QuorumConfig { max_peers: MAX_PEERS }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}: {err}")]
    Io {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse config from {path}: {err}")]
    Parse {
        path: PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("Invalid config in {path}: {message}")]
    Invalid { path: PathBuf, message: String },
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        let config: Config = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;
        config.quorum.validate().map_err(|message| ConfigError::Invalid {
            path: path.into(),
            message,
        })?;
        Ok(config)
    }

    /// Builds the root logger described by the `[log]` section.
    pub fn to_logger(&self, name: &str) -> Result<Logger, std::io::Error> {
        self.log.to_logger(name)
    }
}

impl QuorumConfig {
    /// Checks that `max_peers` is a usable quorum ceiling.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_peers == 0 || self.max_peers % 2 == 0 {
            return Err(format!(
                "quorum.max_peers must be odd and at least 1 (found {})",
                self.max_peers
            ));
        }
        Ok(())
    }
}
