//! Domain layer with core entities, error taxonomy and port definitions.

/// Entity definitions.
pub mod entities;
/// Error types.
pub mod errors;
/// Port definitions.
pub mod ports;

pub use entities::{CacheKey, DecodedImage, ImageResource, ImageSource, LoadedImage};
pub use errors::{DecodeError, LoadError, StorageError, TransportError};
