//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::infrastructure::image::disk_cache::{
    DEFAULT_INLINE_THRESHOLD, DEFAULT_MAX_CACHE_SIZE, DiskCacheLimits,
};
use crate::infrastructure::image::memory_cache::{
    DEFAULT_MAX_COST, DEFAULT_MAX_COUNT, MemoryCacheLimits,
};
use crate::infrastructure::transport::{DEFAULT_TIMEOUT, USER_AGENT};

pub(crate) const APP_NAME: &str = "oximage";
pub(crate) const APP_QUALIFIER: &str = "com";
pub(crate) const APP_ORGANIZATION: &str = "linuxmobile";

/// Log level configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level.
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    #[default]
    Info,
    /// Warning level.
    Warn,
    /// Error level.
    Error,
}

impl LogLevel {
    /// Converts to tracing level.
    #[must_use]
    pub const fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trace => write!(f, "trace"),
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Engine configuration, loaded from `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Memory tier.
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Disk tier.
    #[serde(default)]
    pub disk: DiskConfig,

    /// Transports and downloads.
    #[serde(default)]
    pub network: NetworkConfig,

    /// Animated frame caching and playback.
    #[serde(default)]
    pub animation: AnimationConfig,

    /// Worker pool.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Logging.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Memory tier configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Maximum summed decoded size in bytes.
    #[serde(default = "default_max_cost")]
    pub max_cost_bytes: usize,

    /// Maximum number of images.
    #[serde(default = "default_max_count")]
    pub max_count: usize,

    /// Images untouched for this many seconds are dropped by maintenance.
    #[serde(default)]
    pub max_age_secs: Option<u64>,

    /// Share of current usage kept after a memory warning.
    #[serde(default = "default_retain_ratio")]
    pub memory_warning_retain_ratio: f64,

    /// Empty the memory tier when the host enters the background.
    #[serde(default)]
    pub clear_on_background: bool,
}

impl MemoryConfig {
    /// Limits for the memory cache.
    #[must_use]
    pub fn limits(&self) -> MemoryCacheLimits {
        MemoryCacheLimits {
            max_cost: self.max_cost_bytes,
            max_count: self.max_count,
            max_age: self.max_age_secs.map(Duration::from_secs),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_cost_bytes: default_max_cost(),
            max_count: default_max_count(),
            max_age_secs: None,
            memory_warning_retain_ratio: default_retain_ratio(),
            clear_on_background: false,
        }
    }
}

/// Disk tier configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Disable to run memory-only.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cache directory. Defaults to the platform cache dir.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Maximum summed blob size in bytes.
    #[serde(default = "default_disk_size")]
    pub max_size_bytes: Option<u64>,

    /// Records untouched for this many seconds are trimmed.
    #[serde(default = "default_disk_age")]
    pub max_age_secs: Option<u64>,

    /// Maximum number of records.
    #[serde(default)]
    pub max_count: Option<u64>,

    /// Blobs smaller than this are stored in the index.
    #[serde(default = "default_inline_threshold")]
    pub inline_threshold_bytes: usize,

    /// Seconds between maintenance trims.
    #[serde(default = "default_trim_interval")]
    pub trim_interval_secs: u64,
}

impl DiskConfig {
    /// Limits for the disk cache.
    #[must_use]
    pub fn limits(&self) -> DiskCacheLimits {
        DiskCacheLimits {
            max_size: self.max_size_bytes,
            max_age: self.max_age_secs.map(Duration::from_secs),
            max_count: self.max_count,
        }
    }

    /// Interval between maintenance trims.
    #[must_use]
    pub fn trim_interval(&self) -> Duration {
        Duration::from_secs(self.trim_interval_secs.max(1))
    }
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            max_size_bytes: default_disk_size(),
            max_age_secs: default_disk_age(),
            max_count: None,
            inline_threshold_bytes: default_inline_threshold(),
            trim_interval_secs: default_trim_interval(),
        }
    }
}

/// Network configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// User agent sent with HTTP requests.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Produce previews from partial downloads.
    #[serde(default = "default_true")]
    pub progressive: bool,
}

impl NetworkConfig {
    /// Request timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
            progressive: true,
        }
    }
}

/// Animation configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnimationConfig {
    /// Byte cap for one playback buffer, applied after the memory budget.
    #[serde(default)]
    pub max_buffer_bytes: Option<u64>,

    /// Keep the shared frame cache preloading ahead of each playback position.
    #[serde(default = "default_true")]
    pub preload: bool,
}

impl Default for AnimationConfig {
    fn default() -> Self {
        Self {
            max_buffer_bytes: None,
            preload: true,
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Worker count. Derived from available parallelism when unset.
    #[serde(default)]
    pub workers: Option<usize>,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log verbosity level. `RUST_LOG` takes precedence.
    #[serde(default)]
    pub level: LogLevel,

    /// Append log output to this file instead of stderr.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl EngineConfig {
    /// Returns default config directory.
    #[must_use]
    pub fn default_config_dir() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Returns default log file path.
    #[must_use]
    pub fn default_log_path() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.data_dir().join("oximage.log"))
    }
}

fn default_true() -> bool {
    true
}

fn default_max_cost() -> usize {
    DEFAULT_MAX_COST
}

fn default_max_count() -> usize {
    DEFAULT_MAX_COUNT
}

fn default_retain_ratio() -> f64 {
    0.5
}

#[allow(clippy::unnecessary_wraps)]
fn default_disk_size() -> Option<u64> {
    Some(DEFAULT_MAX_CACHE_SIZE)
}

#[allow(clippy::unnecessary_wraps)]
fn default_disk_age() -> Option<u64> {
    Some(7 * 24 * 60 * 60)
}

fn default_inline_threshold() -> usize {
    DEFAULT_INLINE_THRESHOLD
}

fn default_trim_interval() -> u64 {
    60
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT.as_secs()
}

fn default_user_agent() -> String {
    USER_AGENT.to_string()
}
