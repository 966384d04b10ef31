//! Configuration system for Cairn.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CAIRN_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/cairn/config.toml
//!   3. ~/.config/cairn/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CairnConfig {
    pub link: LinkConfig,
    pub retry: RetryConfig,
    pub routing: RoutingConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Maximum payload bytes per frame. Set to whatever the radio
    /// negotiates; every transfer is fragmented against this.
    pub mtu: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts before a pending transfer is permanently failed.
    pub max_attempts: u32,
    /// First retry delay, milliseconds. Doubles per attempt.
    pub initial_backoff_ms: u64,
    /// Backoff ceiling, milliseconds.
    pub max_backoff_ms: u64,
    /// Scheduler tick interval, milliseconds.
    pub tick_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Hop budget stamped on locally originated transfers.
    pub default_ttl: u8,
    /// Capacity of the recently-seen frame cache. Bounds duplicate
    /// suppression memory per node.
    pub seen_cache_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Where reassembled payloads are written.
    pub storage_path: PathBuf,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

impl Default for CairnConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            retry: RetryConfig::default(),
            routing: RoutingConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self { mtu: 480 }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            tick_interval_ms: 500,
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_ttl: 7,
            seen_cache_capacity: 4_096,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_path: data_dir().join("received"),
        }
    }
}

impl RetryConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

// ── Path helpers ─────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("cairn")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("cairn")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ──────────────────────────────────────────────────────────────────

impl CairnConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            CairnConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CAIRN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&CairnConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply CAIRN_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CAIRN_LINK__MTU") {
            if let Ok(n) = v.parse() {
                self.link.mtu = n;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_RETRY__MAX_ATTEMPTS") {
            if let Ok(n) = v.parse() {
                self.retry.max_attempts = n;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_RETRY__INITIAL_BACKOFF_MS") {
            if let Ok(n) = v.parse() {
                self.retry.initial_backoff_ms = n;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_RETRY__MAX_BACKOFF_MS") {
            if let Ok(n) = v.parse() {
                self.retry.max_backoff_ms = n;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_ROUTING__DEFAULT_TTL") {
            if let Ok(n) = v.parse() {
                self.routing.default_ttl = n;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_STORAGE__STORAGE_PATH") {
            self.storage.storage_path = PathBuf::from(v);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
