//! Layered configuration for the resource management runtime.
//!
//! Precedence: built-in defaults < TOML file < environment variables.
//!
//! ```toml
//! [bus]
//! workers_per_server = 4
//! queue_capacity = 64
//! ```

use std::env;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::error::RmpError;

pub const DEFAULT_ENV_PREFIX: &str = "RMP";
pub const DEFAULT_WORKERS_PER_SERVER: usize = 4;
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RmpConfig {
    pub bus: BusConfig,
}

/// Dispatch settings of the in-process bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Tasks draining each server's job queue. Nested calls into the same
    /// server need one free worker per nesting level.
    pub workers_per_server: usize,
    /// Load/unload jobs buffered per server before senders wait.
    pub queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            workers_per_server: DEFAULT_WORKERS_PER_SERVER,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl RmpConfig {
    pub fn validate(&self) -> Result<(), RmpError> {
        if self.bus.workers_per_server == 0 {
            return Err(RmpError::Config(
                "bus.workers_per_server must be at least 1".to_string(),
            ));
        }
        if self.bus.queue_capacity == 0 {
            return Err(RmpError::Config(
                "bus.queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder that resolves an [`RmpConfig`] from its layers.
///
/// ```no_run
/// use rmp_core::ConfigLoader;
///
/// let config = ConfigLoader::new()
///     .with_file("rmp.toml")
///     .load()?;
/// # Ok::<(), rmp_core::RmpError>(())
/// ```
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    env_prefix: String,
    skip_env: bool,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            file: None,
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
            skip_env: false,
        }
    }

    /// Read overrides from `path`. A missing file is not an error.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Default is `RMP`, which reads `RMP_WORKERS_PER_SERVER` and
    /// `RMP_QUEUE_CAPACITY`.
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn skip_env_layer(mut self) -> Self {
        self.skip_env = true;
        self
    }

    pub fn load(self) -> Result<RmpConfig, RmpError> {
        let mut config = match &self.file {
            Some(path) => Self::load_from_file(path)?,
            None => RmpConfig::default(),
        };
        if !self.skip_env {
            Self::apply_env_overrides(&mut config, &self.env_prefix, |name| env::var(name).ok())?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<RmpConfig, RmpError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("config file not found at {}, using defaults", path.display());
                return Ok(RmpConfig::default());
            }
            Err(err) => {
                return Err(RmpError::Config(format!(
                    "failed to read {}: {err}",
                    path.display()
                )));
            }
        };
        toml::from_str(&contents)
            .map_err(|err| RmpError::Config(format!("failed to parse {}: {err}", path.display())))
    }

    /// Apply `<prefix>_WORKERS_PER_SERVER` and `<prefix>_QUEUE_CAPACITY`,
    /// looking variables up through `lookup`.
    pub fn apply_env_overrides<F>(
        config: &mut RmpConfig,
        prefix: &str,
        lookup: F,
    ) -> Result<(), RmpError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let workers_var = format!("{prefix}_WORKERS_PER_SERVER");
        if let Some(value) = lookup(&workers_var)
            && !value.trim().is_empty()
        {
            tracing::debug!("Applying env override: {workers_var}={value}");
            config.bus.workers_per_server = parse_count(&workers_var, &value)?;
        }

        let capacity_var = format!("{prefix}_QUEUE_CAPACITY");
        if let Some(value) = lookup(&capacity_var)
            && !value.trim().is_empty()
        {
            tracing::debug!("Applying env override: {capacity_var}={value}");
            config.bus.queue_capacity = parse_count(&capacity_var, &value)?;
        }

        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_count(var: &str, value: &str) -> Result<usize, RmpError> {
    value
        .trim()
        .parse()
        .map_err(|_| RmpError::Config(format!("{var}={value} is not a non-negative integer")))
}
