//! Configuration management for the property broker.
//!
//! Provides hierarchical configuration loading and validation with:
//! - Default values as code base
//! - Configuration file support
//! - Environment variable overrides
mod server;
mod tracker;

use std::env;
use std::fmt::Debug;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;
pub use server::*;
pub use tracker::*;

use crate::Result;

#[cfg(test)]
mod config_test;

/// Environment variable prefix, e.g. `AUTOPROP__SERVER__NAME`.
pub const ENV_PREFIX: &str = "AUTOPROP";

/// Main configuration container
///
/// Sources are merged with later ones taking priority:
/// 1. Default values from code
/// 2. Configuration file specified by `CONFIG_PATH`
/// 3. Environment variables with the `AUTOPROP__` prefix
#[derive(Serialize, Deserialize, Clone, Default)]
pub struct BrokerConfig {
    /// Property server parameters
    #[serde(default)]
    pub server: ServerConfig,
    /// Response tracker housekeeping
    #[serde(default)]
    pub tracker: TrackerConfig,
}

impl Debug for BrokerConfig {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("server", &self.server)
            .field("tracker", &self.tracker)
            .finish()
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .ignore_empty(true)
        .try_parsing(true)
}

impl BrokerConfig {
    /// Loads configuration from hierarchical sources without validation.
    ///
    /// Callers must call [`validate`](Self::validate) once all overrides are
    /// applied.
    ///
    /// ```ignore
    /// std::env::set_var("CONFIG_PATH", "config/broker.toml");
    /// std::env::set_var("AUTOPROP__SERVER__NAME", "settings");
    /// let cfg = BrokerConfig::new()?.validate()?;
    /// ```
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(environment());

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Applies overrides from the file at `path`, then the environment again.
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(environment())
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Validates every section and returns the validated configuration.
    pub fn validate(self) -> Result<Self> {
        self.server.validate()?;
        self.tracker.validate()?;
        Ok(self)
    }

    /// Default configuration with a custom server name.
    pub fn named(name: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.server.name = name.into();
        config
    }
}
