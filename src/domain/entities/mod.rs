//! Domain entity definitions.

mod cache_key;
mod image;

pub use cache_key::CacheKey;
pub use image::{
    BYTES_PER_PIXEL, DecodedImage, FrameInfo, ImageResource, ImageSource, LoadedImage, LoopCount,
};
