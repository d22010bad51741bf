//! Engine configuration.

use crate::invariant_ppt::{assert_invariant, CONFIG_VALID};
use crate::pipeline::{CompilerSettings, DEFAULT_UNITS_PER_PROGRAM};
use crate::pool::DEFAULT_POOL_BYTES;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings for a running engine.
///
/// # TOML Format
///
/// ```toml
/// sample_rate = 48000
/// rt_pool_bytes = 8388608
/// registry_capacity = 256
/// queue_capacity = 64
/// library_path = "/usr/share/dsp"
/// include_paths = ["/home/me/dsp"]
/// target = ""
/// reclaim_interval_ms = 100
/// units_per_program = 16
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sample_rate: u32,
    /// Budget of the RT pool in bytes.
    pub rt_pool_bytes: usize,
    pub registry_capacity: usize,
    /// Capacity of every stage and command queue.
    pub queue_capacity: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library_path: Option<PathBuf>,
    pub include_paths: Vec<PathBuf>,
    /// Compiler target triple, empty for the host.
    pub target: String,
    /// How often the NRT worker drops retired programs while idle.
    pub reclaim_interval_ms: u64,
    /// Unit slots prepared with every compiled program. Caps how many units
    /// of one program run at once.
    pub units_per_program: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            rt_pool_bytes: DEFAULT_POOL_BYTES,
            registry_capacity: 256,
            queue_capacity: 64,
            library_path: None,
            include_paths: Vec::new(),
            target: String::new(),
            reclaim_interval_ms: 100,
            units_per_program: DEFAULT_UNITS_PER_PROGRAM,
        }
    }
}

impl EngineConfig {
    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::Invalid("sample_rate must be positive".into()));
        }
        if self.registry_capacity == 0 {
            return Err(ConfigError::Invalid("registry_capacity must be positive".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be positive".into()));
        }
        if self.rt_pool_bytes == 0 {
            return Err(ConfigError::Invalid("rt_pool_bytes must be positive".into()));
        }
        assert_invariant(CONFIG_VALID, true, "config validated", None);
        Ok(())
    }

    pub fn compiler_settings(&self) -> CompilerSettings {
        CompilerSettings {
            library_path: self.library_path.clone(),
            include_paths: self.include_paths.clone(),
            target: self.target.clone(),
            units_per_program: self.units_per_program,
        }
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms)
    }
}
