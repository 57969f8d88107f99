//! Port definitions (traits at the infrastructure seams).

mod decoder_port;
mod image_cache_port;
mod memory_probe_port;
mod transformer_port;
mod transport_port;

pub use decoder_port::{AnimatedFrameSource, ImageDecoderPort};
pub use image_cache_port::ImageCachePort;
pub use memory_probe_port::MemoryProbePort;
pub use transformer_port::ImageTransformerPort;
pub use transport_port::{ByteStream, FetchRequest, TransportPort, TransportResponse};
