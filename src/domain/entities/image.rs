//! Domain types for image handling.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use image::{DynamicImage, ImageFormat};

use super::CacheKey;
use crate::domain::ports::AnimatedFrameSource;

/// Bytes per decoded pixel (RGBA8).
pub const BYTES_PER_PIXEL: usize = 4;

/// A loadable image resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageResource {
    /// An `http` or `https` URL.
    Remote(String),
    /// A file on the local file system.
    Local(PathBuf),
}

impl ImageResource {
    /// Parses a URL or path. `file://` URLs and bare paths are local.
    #[must_use]
    pub fn parse(input: &str) -> Self {
        if let Some(path) = input.strip_prefix("file://") {
            Self::Local(PathBuf::from(path))
        } else if input.starts_with("http://") || input.starts_with("https://") {
            Self::Remote(input.to_string())
        } else {
            Self::Local(PathBuf::from(input))
        }
    }

    /// Returns the transform-free identity of this resource as a URL string.
    #[must_use]
    pub fn source_id(&self) -> String {
        match self {
            Self::Remote(url) => url.clone(),
            Self::Local(path) => format!("file://{}", path.display()),
        }
    }

    /// Returns the key used for download dedup and raw-byte disk storage.
    #[must_use]
    pub fn source_key(&self) -> CacheKey {
        CacheKey::for_source(&self.source_id())
    }

    /// Returns the key for this resource under the given transform.
    #[must_use]
    pub fn cache_key(&self, transform: Option<&str>) -> CacheKey {
        CacheKey::new(&self.source_id(), transform)
    }

    /// Returns true for resources read from the local file system.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

impl From<&str> for ImageResource {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl std::fmt::Display for ImageResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source_id())
    }
}

/// How many times an animation plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopCount {
    /// Loops forever.
    #[default]
    Infinite,
    /// Plays the given number of times, then stops on the last frame.
    Finite(u32),
}

impl LoopCount {
    /// Converts a container loop field where 0 means "forever".
    #[must_use]
    pub const fn from_container(value: u32) -> Self {
        if value == 0 {
            Self::Infinite
        } else {
            Self::Finite(value)
        }
    }
}

/// Metadata for one frame of an animated image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Frame position in the animation.
    pub index: usize,
    /// Canvas width in pixels.
    pub width: u32,
    /// Canvas height in pixels.
    pub height: u32,
    /// How long the frame stays on screen.
    pub duration: Duration,
}

impl FrameInfo {
    /// Decoded size of the frame in bytes.
    #[must_use]
    pub const fn cost(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }
}

/// A decoded image, either still or animated.
///
/// For animated images the poster is the first frame and `frames` gives
/// on-demand access to the rest.
#[derive(Clone)]
pub struct DecodedImage {
    format: ImageFormat,
    poster: Arc<DynamicImage>,
    frames: Option<Arc<dyn AnimatedFrameSource>>,
}

impl DecodedImage {
    /// Creates a still image.
    #[must_use]
    pub fn still(format: ImageFormat, image: DynamicImage) -> Self {
        Self {
            format,
            poster: Arc::new(image),
            frames: None,
        }
    }

    /// Creates an animated image with its first frame as poster.
    #[must_use]
    pub fn animated(
        format: ImageFormat,
        poster: DynamicImage,
        frames: Arc<dyn AnimatedFrameSource>,
    ) -> Self {
        Self {
            format,
            poster: Arc::new(poster),
            frames: Some(frames),
        }
    }

    /// Returns a copy with the poster replaced, keeping format and frames.
    #[must_use]
    pub fn with_poster(&self, poster: DynamicImage) -> Self {
        Self {
            format: self.format,
            poster: Arc::new(poster),
            frames: self.frames.clone(),
        }
    }

    /// Source container format.
    #[must_use]
    pub const fn format(&self) -> ImageFormat {
        self.format
    }

    /// The still image, or the first frame of an animation.
    #[must_use]
    pub fn poster(&self) -> &Arc<DynamicImage> {
        &self.poster
    }

    /// Width of the poster in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.poster.width()
    }

    /// Height of the poster in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.poster.height()
    }

    /// Frame access for animated images.
    #[must_use]
    pub fn frames(&self) -> Option<&Arc<dyn AnimatedFrameSource>> {
        self.frames.as_ref()
    }

    /// Returns true if the image has more than one frame.
    #[must_use]
    pub fn is_animated(&self) -> bool {
        self.frames.as_ref().is_some_and(|f| f.frame_count() > 1)
    }

    /// Number of frames; 1 for still images.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.as_ref().map_or(1, |f| f.frame_count())
    }

    /// Memory cost of the poster in bytes.
    #[must_use]
    pub fn cost(&self) -> usize {
        self.width() as usize * self.height() as usize * BYTES_PER_PIXEL
    }
}

impl std::fmt::Debug for DecodedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedImage")
            .field("format", &self.format)
            .field("width", &self.width())
            .field("height", &self.height())
            .field("frame_count", &self.frame_count())
            .finish()
    }
}

/// An image delivered to a caller.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    /// Key the image is cached under.
    pub key: CacheKey,
    /// The decoded (and transformed) image.
    pub image: DecodedImage,
    /// Encoded bytes, when they were read from disk or the origin.
    pub data: Option<Bytes>,
    /// Tier that served the image.
    pub source: ImageSource,
}

/// Where an image was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    /// Loaded from in-memory LRU cache.
    MemoryCache,
    /// Loaded from disk cache.
    DiskCache,
    /// Fetched from its origin (network or local file).
    Network,
}

impl std::fmt::Display for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MemoryCache => write!(f, "memory"),
            Self::DiskCache => write!(f, "disk"),
            Self::Network => write!(f, "network"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resources() {
        assert_eq!(
            ImageResource::parse("https://example.com/a.gif"),
            ImageResource::Remote("https://example.com/a.gif".to_string())
        );
        assert_eq!(
            ImageResource::parse("file:///tmp/a.png"),
            ImageResource::Local(PathBuf::from("/tmp/a.png"))
        );
        assert_eq!(
            ImageResource::parse("/tmp/a.png"),
            ImageResource::Local(PathBuf::from("/tmp/a.png"))
        );
    }

    #[test]
    fn test_local_source_id_is_file_url() {
        let resource = ImageResource::parse("/tmp/a.png");
        assert_eq!(resource.source_id(), "file:///tmp/a.png");
        assert!(resource.is_local());
    }

    #[test]
    fn test_source_key_ignores_transform() {
        let resource = ImageResource::parse("https://example.com/a.png");
        assert_eq!(resource.source_key(), resource.cache_key(None));
        assert_ne!(resource.source_key(), resource.cache_key(Some("blur")));
    }

    #[test]
    fn test_still_image_cost() {
        let image = DecodedImage::still(ImageFormat::Png, DynamicImage::new_rgba8(10, 20));
        assert_eq!(image.cost(), 10 * 20 * 4);
        assert_eq!(image.frame_count(), 1);
        assert!(!image.is_animated());
    }

    #[test]
    fn test_loop_count_from_container() {
        assert_eq!(LoopCount::from_container(0), LoopCount::Infinite);
        assert_eq!(LoopCount::from_container(3), LoopCount::Finite(3));
    }
}
