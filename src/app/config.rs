//! Configuration for the relay

use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::DEFAULT_TERM;
use crate::error::{Error, Result};
use crate::relay::{Strategy, DEFAULT_BUFFER_SIZE, MIN_BUFFER_SIZE};

/// JSON file to load before applying the variables below
pub const CONFIG_ENV: &str = "PTY_RELAY_CONFIG";
pub const STRATEGY_ENV: &str = "PTY_RELAY_STRATEGY";
pub const BUFFER_SIZE_ENV: &str = "PTY_RELAY_BUFFER_SIZE";
pub const DRAIN_ENV: &str = "PTY_RELAY_DRAIN_MS";
pub const TERM_ENV: &str = "PTY_RELAY_TERM";

/// Relay configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Relay strategy
    pub strategy: Strategy,
    /// Per-direction buffer size in bytes
    pub buffer_size: usize,
    /// How long to keep forwarding output after the child exits
    pub drain_timeout_ms: u64,
    /// `TERM` value given to the child
    pub term: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Auto,
            buffer_size: DEFAULT_BUFFER_SIZE,
            drain_timeout_ms: 100,
            term: DEFAULT_TERM.to_string(),
        }
    }
}

impl RelayConfig {
    /// Load from the file named by `PTY_RELAY_CONFIG` and the process environment
    pub fn load() -> Result<Self> {
        let file = match env::var_os(CONFIG_ENV) {
            Some(path) => Some(read_config_file(Path::new(&path))?),
            None => None,
        };
        Self::from_sources(file.as_deref(), |key| env::var(key).ok())
    }

    /// Build from optional JSON text, then apply variable overrides
    pub fn from_sources<F>(file: Option<&str>, var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config: RelayConfig = match file {
            Some(text) => serde_json::from_str(text).map_err(|e| Error::Config(format!("invalid config file: {e}")))?,
            None => Self::default(),
        };

        if let Some(value) = var(STRATEGY_ENV) {
            config.strategy = value.parse()?;
        }
        if let Some(value) = var(BUFFER_SIZE_ENV) {
            config.buffer_size = parse_var(BUFFER_SIZE_ENV, &value)?;
        }
        if let Some(value) = var(DRAIN_ENV) {
            config.drain_timeout_ms = parse_var(DRAIN_ENV, &value)?;
        }
        if let Some(value) = var(TERM_ENV) {
            config.term = value;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<()> {
        if self.term.is_empty() || self.term.contains('\0') {
            return Err(Error::Config(format!("invalid TERM value {:?}", self.term)));
        }
        self.buffer_size = self.buffer_size.max(MIN_BUFFER_SIZE);
        Ok(())
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

fn read_config_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("{name}={value:?}: {e}")))
}
