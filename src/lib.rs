//! Oximage - a concurrent image loading engine.
//!
//! This crate loads images from the network or local files through a memory
//! LRU cache and a persistent disk cache, coalesces concurrent downloads of
//! the same resource, and plays animated images from a memory-bounded frame
//! cache.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Application layer containing the engine context and lifecycle handling.
pub mod application;
/// Domain layer containing entities, errors, and port definitions.
pub mod domain;
/// Infrastructure layer containing caches, transports and decoders.
pub mod infrastructure;

pub use application::{ContextError, ImageContext, LifecycleSignal, Playback};

/// Current version of the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = "oximage";
