//! Settings file support for the `-f` option.
//!
//! Connection parameters that should not live on the command line
//! (passwords, timeouts) come from a small TOML file. The positional
//! `<server[:port]>` argument always overrides the file's `server`.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed parsing settings: {0}")]
    Parse(#[from] toml::de::Error),
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_command_timeout_ms() -> u64 {
    30_000
}

/// Tool settings, all optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// `host` or `host:port`; overridden by the positional argument.
    pub server: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: None,
            password: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl Settings {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}
