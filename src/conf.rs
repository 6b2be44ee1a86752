//! Configuration for the client binary

use config::{Config, ConfigError, Environment, File, Source};
use serde::Deserialize;

use super::net;

/// All configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Connection pool configuration.
    pub client: net::Config,
}

impl Configuration {
    /// Get the configuration from file, overridden by `KVPOOL__` environment variables
    /// such as `KVPOOL__CLIENT__PORT`.
    pub fn get(name: &str) -> Result<Self, ConfigError> {
        Self::from_source(File::with_name(name))
    }

    /// Get the configuration from `kvpool.toml` (or any supported extension) when one
    /// exists in the working directory, overridden by the environment.
    pub fn discover() -> Result<Self, ConfigError> {
        Self::from_source(File::with_name("kvpool").required(false))
    }

    fn from_source<S>(source: S) -> Result<Self, ConfigError>
    where
        S: Source + Send + Sync + 'static,
    {
        let conf = Config::builder()
            .add_source(source)
            .add_source(Environment::with_prefix("KVPOOL").separator("__"))
            .build()?;
        conf.try_deserialize()
    }
}
