//! Image handling infrastructure.
//!
//! This module provides:
//! - Memory caching with LRU eviction
//! - Disk caching for persistence
//! - Pluggable decoders with animated frame access
//! - Async image loading pipeline

pub mod container;
pub mod decoder;
pub mod disk_cache;
pub mod disk_store;
pub mod image_cache;
pub mod loader;
pub mod memory_cache;

pub use container::AnimatedContainer;
pub use decoder::{
    AnimatedImageDecoder, DecoderRegistry, ImageCrateFrameSource, StillImageDecoder,
};
pub use disk_cache::{DiskCache, DiskCacheLimits, ErrorHook, default_cache_path};
pub use disk_store::{DiskRecord, DiskStore, RecordFlags};
pub use image_cache::ImageCache;
pub use loader::{ImageLoader, LoadCompletionFn, LoadOptions, LoadTask};
pub use memory_cache::{CacheStats, ImageMemoryCache, MemoryCache, MemoryCacheLimits};
