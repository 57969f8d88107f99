//! Infrastructure layer with adapters for the host system, storage and the
//! network.

/// Animated frame caching and playback.
pub mod animation;
/// Engine configuration.
pub mod config;
/// Download deduplication and progress fan-out.
pub mod download;
/// Image caching, decoding and loading.
pub mod image;
/// Tracing subscriber setup.
pub mod logging;
/// Worker threads.
pub mod pool;
/// Device memory introspection.
pub mod system;
/// Byte transports.
pub mod transport;

pub use animation::{AnimatedImage, AnimationRegistry, ConsumerLease, PlaybackBuffer, TickOutcome};
pub use config::{ConfigError, ConfigStore, EngineConfig, LogLevel};
pub use download::{CancelToken, DownloadCoordinator, DownloadProgress};
pub use image::{
    DecoderRegistry, DiskCache, ImageCache, ImageLoader, ImageMemoryCache, LoadOptions, LoadTask,
};
pub use logging::{LoggingError, init_logging};
pub use pool::{SerialQueue, WorkerPool};
pub use system::{FixedMemoryProbe, SystemMemoryProbe};
pub use transport::{FileTransport, HttpTransport, SchemeTransport};
