//! Repository configuration.
//!
//! `config.toml` holds the shared settings; `config.local` is an optional
//! per-checkout override whose values win field by field. Isolated executors
//! write a `config.local` pointing their cache back at the base repository.

use crate::error::{ExpError, Result};
use crate::lock::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Name of the shared configuration file inside `.exp/`.
pub const CONFIG_FILE: &str = "config.toml";
/// Name of the local override file inside `.exp/`.
pub const LOCAL_CONFIG_FILE: &str = "config.local";

/// Full repository configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Ref lease retry settings.
    #[serde(default)]
    pub lock: LockConfig,

    /// Executor settings.
    #[serde(default)]
    pub exec: ExecConfig,

    /// Content cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Config {
    /// Loads `config.toml` and overlays `config.local` when present.
    pub fn load(exp_dir: &Path) -> Result<Self> {
        let mut config = match read_partial(&exp_dir.join(CONFIG_FILE))? {
            Some(partial) => Config::default().merged(partial),
            None => Config::default(),
        };
        if let Some(local) = read_partial(&exp_dir.join(LOCAL_CONFIG_FILE))? {
            debug!(dir = %exp_dir.display(), "Applying local config override");
            config = config.merged(local);
        }
        config.validate()?;
        Ok(config)
    }

    /// Saves the shared configuration file.
    pub fn save(&self, exp_dir: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ExpError::ConfigError(format!("failed to serialize config: {}", e)))?;
        fs::write(exp_dir.join(CONFIG_FILE), content)
            .map_err(|e| ExpError::ConfigError(format!("failed to write config: {}", e)))?;
        Ok(())
    }

    /// Writes a local override that only sets the cache directory.
    pub fn write_local_cache_override(exp_dir: &Path, cache_dir: &Path) -> Result<()> {
        let path = exp_dir.join(LOCAL_CONFIG_FILE);
        debug!(path = %path.display(), "Writing experiments local config");
        let partial = PartialConfig {
            cache: Some(PartialCache {
                dir: Some(cache_dir.to_path_buf()),
            }),
            ..Default::default()
        };
        let content = toml::to_string_pretty(&partial)
            .map_err(|e| ExpError::ConfigError(format!("failed to serialize config: {}", e)))?;
        fs::write(&path, content)
            .map_err(|e| ExpError::ConfigError(format!("failed to write config: {}", e)))?;
        Ok(())
    }

    /// Builds the retry policy used for ref leases.
    pub fn lock_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.lock.max_attempts,
            Duration::from_millis(self.lock.backoff_ms),
        )
    }

    fn merged(mut self, partial: PartialConfig) -> Self {
        if let Some(lock) = partial.lock {
            if let Some(n) = lock.max_attempts {
                self.lock.max_attempts = n;
            }
            if let Some(ms) = lock.backoff_ms {
                self.lock.backoff_ms = ms;
            }
        }
        if let Some(exec) = partial.exec {
            if exec.tmp_dir.is_some() {
                self.exec.tmp_dir = exec.tmp_dir;
            }
        }
        if let Some(cache) = partial.cache {
            if cache.dir.is_some() {
                self.cache.dir = cache.dir;
            }
        }
        self
    }

    fn validate(&self) -> Result<()> {
        if self.lock.max_attempts == 0 {
            return Err(ExpError::ConfigError(
                "lock.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Ref lease retry settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockConfig {
    /// Attempts before giving up with `LockContention` (default: 180).
    pub max_attempts: u32,
    /// Pause between attempts in milliseconds (default: 1000).
    pub backoff_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_attempts: 180,
            backoff_ms: 1000,
        }
    }
}

/// Executor settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ExecConfig {
    /// Parent directory for isolated executor roots.
    /// Defaults to `.exp/tmp/exps`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmp_dir: Option<PathBuf>,
}

/// Content cache settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CacheConfig {
    /// Content cache the workload resolves outputs from.
    /// Defaults to the repository's own `.exp/cache`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

// Every field optional so an override can set a single value.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PartialConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lock: Option<PartialLock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exec: Option<ExecConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cache: Option<PartialCache>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PartialLock {
    max_attempts: Option<u32>,
    backoff_ms: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PartialCache {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dir: Option<PathBuf>,
}

fn read_partial(path: &Path) -> Result<Option<PartialConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .map_err(|e| ExpError::ConfigError(format!("failed to read config: {}", e)))?;
    toml::from_str(&content)
        .map(Some)
        .map_err(|e| {
            ExpError::ConfigError(format!("failed to parse {}: {}", path.display(), e))
        })
}
