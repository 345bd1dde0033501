//! `warden` configuration, read from TOML.
//!
//! Every field has a default, so an empty file (or no file) is valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::constants::{
    DEFAULT_EVENT_CAPACITY, DEFAULT_MAX_RETRIES, DEFAULT_MIN_SIMILARITY,
    DEFAULT_REMEDIATION_TIMEOUT_SECS, DEFAULT_RETRY_BASE_MS, DEFAULT_RETRY_MAX_MS,
    DEFAULT_SWEEP_INTERVAL_MS,
};
use crate::models::FixType;

/// Location searched when `--config` is not given
pub const DEFAULT_CONFIG_PATH: &str = ".warden/config.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub engine: EngineConfig,
    pub fix_loop: FixLoopConfig,
    pub storage: StorageConfig,
    pub remediation: RemediationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 0 disables the engine-wide fallback; graph and node timeouts still apply
    pub default_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub event_capacity: usize,
    /// Route node errors to the fix loop instead of blocking for an operator
    pub auto_fix: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 0,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            auto_fix: true,
        }
    }
}

impl EngineConfig {
    pub fn default_timeout(&self) -> Option<u64> {
        (self.default_timeout_ms > 0).then_some(self.default_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(10))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixLoopConfig {
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub min_similarity: f64,
}

impl Default for FixLoopConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_ms: DEFAULT_RETRY_BASE_MS,
            retry_max_ms: DEFAULT_RETRY_MAX_MS,
            min_similarity: DEFAULT_MIN_SIMILARITY,
        }
    }
}

impl FixLoopConfig {
    /// Settings with no inter-attempt delay, for tests and dry runs
    pub fn immediate() -> Self {
        Self {
            retry_base_ms: 0,
            retry_max_ms: 0,
            ..Self::default()
        }
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub fix_memory: Option<PathBuf>,
    pub snapshot: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            fix_memory: Some(PathBuf::from(".warden/fixes.jsonl")),
            snapshot: Some(PathBuf::from(".warden/snapshot.json")),
        }
    }
}

impl StorageConfig {
    /// Nothing is written to disk
    pub fn ephemeral() -> Self {
        Self {
            fix_memory: None,
            snapshot: None,
        }
    }
}

/// Shell commands used by the command remediator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemediationConfig {
    /// Re-checks the original error condition; exit 0 means resolved
    pub verify: Option<String>,
    /// Reverts partial changes after an unsuccessful loop
    pub rollback: Option<String>,
    pub timeout_secs: u64,
    pub working_dir: Option<PathBuf>,
    /// Command template per fix type, keyed by `config`, `patch`, `dependency`, `rollback`, `custom`
    pub commands: BTreeMap<String, String>,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            verify: None,
            rollback: None,
            timeout_secs: DEFAULT_REMEDIATION_TIMEOUT_SECS,
            working_dir: None,
            commands: BTreeMap::new(),
        }
    }
}

impl RemediationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    /// Command template configured for a fix type
    pub fn command_for(&self, fix_type: FixType) -> Option<&str> {
        self.commands
            .iter()
            .find(|(key, _)| key.parse::<FixType>().ok() == Some(fix_type))
            .map(|(_, command)| command.as_str())
    }

    fn validate(&self) -> Result<()> {
        for key in self.commands.keys() {
            key.parse::<FixType>()
                .with_context(|| format!("Invalid key in [remediation.commands]: {key}"))?;
        }
        Ok(())
    }
}

impl WardenConfig {
    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse warden config")?;
        config.remediation.validate()?;
        Ok(config)
    }

    /// Load from a file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Load the explicit path if given, else the default location if it
    /// exists, else defaults
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::load(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }
}
