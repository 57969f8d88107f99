//! Engine configuration.

pub mod app_config;
pub mod storage;

pub use app_config::{
    AnimationConfig, DiskConfig, EngineConfig, LogLevel, LoggingConfig, MemoryConfig,
    NetworkConfig, PoolConfig,
};
pub use storage::{ConfigError, ConfigStore};
