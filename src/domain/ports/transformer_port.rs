//! Port for image transformers.

use crate::domain::entities::DecodedImage;
use crate::domain::errors::DecodeError;

/// Post-decode transform (crop, round, tint, ...). Only the cache-key
/// contract is defined here: `identifier` must differ for transforms that
/// produce different pixels.
pub trait ImageTransformerPort: Send + Sync {
    /// Stable identifier appended to the cache key.
    fn identifier(&self) -> &str;

    /// Applies the transform.
    ///
    /// # Errors
    /// Returns `DecodeError::Transform` when the transform cannot be applied.
    fn transform(&self, image: &DecodedImage) -> Result<DecodedImage, DecodeError>;
}
