//! Application layer: the engine context and its lifecycle handling.

/// Shared engine state.
pub mod context;
/// Lifecycle signal dispatch and periodic maintenance.
pub mod lifecycle;

pub use context::{ContextError, ImageContext, Playback};
pub use lifecycle::LifecycleSignal;
