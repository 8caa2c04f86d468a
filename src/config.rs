//! Store configuration.
//!
//! Sources are layered lowest to highest: built-in defaults, an optional
//! config file, then `CONTEXT_CHAIN_*` environment variables.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default per-segment lock timeout, in seconds.
pub const DEFAULT_LOCK_TIMEOUT_SECONDS: u64 = 60;

/// Prefix of environment overrides, e.g. `CONTEXT_CHAIN_LOCK_TIMEOUT_MS`.
pub const ENV_PREFIX: &str = "CONTEXT_CHAIN";

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("config source error: {0}")]
    Source(#[from] config::ConfigError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Per-segment lock timeout in milliseconds. Close waits up to twice this.
    pub lock_timeout_ms: u64,

    /// Record a backtrace at every outermost acquisition so close timeouts
    /// can say where the blocking context was taken. Costly; off by default.
    pub capture_lock_sites: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_SECONDS * 1000,
            capture_lock_sites: false,
        }
    }
}

impl StoreConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_lock_site_capture(mut self, capture: bool) -> Self {
        self.capture_lock_sites = capture;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.lock_timeout_ms == 0 {
            return Err(ConfigLoadError::Invalid(
                "lock_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Load from defaults, `path` if given, and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigLoadError> {
        let defaults = Self::default();
        let mut builder = Config::builder()
            .set_default(
                "lock_timeout_ms",
                i64::try_from(defaults.lock_timeout_ms).unwrap_or(i64::MAX),
            )?
            .set_default("capture_lock_sites", defaults.capture_lock_sites)?;
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true));
        let config: StoreConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}
