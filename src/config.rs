//! Application configuration (`config.toml`)
//!
//! Looked up in order: `--config <FILE>`, `$SCOPECACHE_CONFIG`, then
//! `<config dir>/scopecache/config.toml`. Every key is optional; a missing
//! file means all defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheLimits;
use crate::models::QueryOptions;

pub const CONFIG_ENV: &str = "SCOPECACHE_CONFIG";
pub const APP_DIR: &str = "scopecache";
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub search: SearchSection,
    #[serde(default)]
    pub elaborate: ElaborateSection,
    #[serde(default)]
    pub credentials: Credentials,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSection {
    /// Cache directory (default: the platform cache dir)
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_ttl_days")]
    pub ttl_days: u64,
    #[serde(default = "default_size_limit_mb")]
    pub size_limit_mb: u64,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

fn default_ttl_days() -> u64 {
    7
}

fn default_size_limit_mb() -> u64 {
    100
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

fn default_compression_level() -> i32 {
    3
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            dir: None,
            ttl_days: default_ttl_days(),
            size_limit_mb: default_size_limit_mb(),
            lock_timeout_ms: default_lock_timeout_ms(),
            compression_level: default_compression_level(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSection {
    #[serde(default = "default_context_lines")]
    pub context_lines: usize,
    #[serde(default)]
    pub exclude_dirs: Vec<String>,
    #[serde(default)]
    pub exclude_files: Vec<String>,
    #[serde(default)]
    pub include_hidden: bool,
    /// Match-time budget for one search (0 = unbounded)
    #[serde(default = "default_budget_secs")]
    pub budget_secs: u64,
}

fn default_context_lines() -> usize {
    3
}

fn default_budget_secs() -> u64 {
    30
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            context_lines: default_context_lines(),
            exclude_dirs: Vec::new(),
            exclude_files: Vec::new(),
            include_hidden: false,
            budget_secs: default_budget_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElaborateSection {
    /// `provider/model`; unset falls through to `$SCOPECACHE_MODEL`, then the built-in default
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default = "default_context_window_lines")]
    pub context_window_lines: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_context_window_lines() -> usize {
    10
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for ElaborateSection {
    fn default() -> Self {
        Self {
            model: None,
            api_base: None,
            context_window_lines: default_context_window_lines(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default)]
    pub anthropic_api_key: Option<String>,
    #[serde(default)]
    pub gemini_api_key: Option<String>,
}

impl Credentials {
    pub fn api_key_for(&self, provider: &str) -> Option<&str> {
        match provider.to_lowercase().as_str() {
            "openai" => self.openai_api_key.as_deref(),
            "anthropic" => self.anthropic_api_key.as_deref(),
            "gemini" => self.gemini_api_key.as_deref(),
            _ => None,
        }
    }
}

impl AppConfig {
    /// Load from the first configured location. An explicit path must exist.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_file(path);
        }

        let path = match std::env::var_os(CONFIG_ENV) {
            Some(p) if !p.is_empty() => PathBuf::from(p),
            _ => match default_config_path() {
                Some(p) => p,
                None => {
                    log::debug!("No config directory on this platform, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        if !path.exists() {
            log::debug!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        Self::load_file(&path)
    }

    fn load_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_toml_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        log::debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache.dir.clone().unwrap_or_else(default_cache_dir)
    }

    pub fn cache_limits(&self) -> CacheLimits {
        CacheLimits {
            ttl_days: self.cache.ttl_days,
            size_limit_bytes: self.cache.size_limit_mb.saturating_mul(1024 * 1024),
            lock_timeout: Duration::from_millis(self.cache.lock_timeout_ms),
            compression_level: self.cache.compression_level,
        }
    }

    /// Search defaults from the `[search]` section
    pub fn query_options(&self) -> QueryOptions {
        QueryOptions {
            context_lines: self.search.context_lines,
            exclude_dirs: self.search.exclude_dirs.clone(),
            exclude_files: self.search.exclude_files.clone(),
            include_hidden: self.search.include_hidden,
            ..Default::default()
        }
    }

    pub fn search_budget(&self) -> Option<Duration> {
        (self.search.budget_secs > 0).then(|| Duration::from_secs(self.search.budget_secs))
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_DIR).join(CONFIG_FILE))
}

pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from(".scopecache"))
}
