//! Port definitions for image decoders.

use bytes::Bytes;
use image::RgbaImage;

use crate::domain::entities::{DecodedImage, FrameInfo, LoopCount};
use crate::domain::errors::DecodeError;

/// A pluggable decoder. Registries try decoders in priority order and use the
/// first one whose `can_decode` accepts the data.
pub trait ImageDecoderPort: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Returns true if this decoder understands the data.
    fn can_decode(&self, data: &[u8]) -> bool;

    /// Decodes complete data.
    ///
    /// # Errors
    /// Returns `DecodeError` for malformed or unsupported data.
    fn decode(&self, data: &Bytes) -> Result<DecodedImage, DecodeError>;

    /// Returns true if a preview can be produced from a prefix of the data.
    fn can_incrementally_decode(&self, _data: &[u8]) -> bool {
        false
    }

    /// Produces a preview from partial data. `Ok(None)` means not enough data
    /// yet.
    ///
    /// # Errors
    /// Returns `DecodeError` when the prefix is unusable.
    fn incremental_decode(
        &self,
        data: &Bytes,
        finished: bool,
    ) -> Result<Option<DecodedImage>, DecodeError> {
        if finished {
            self.decode(data).map(Some)
        } else {
            Ok(None)
        }
    }
}

/// Random access to the frames of an animated image. Sources hold only the
/// immutable encoded bytes; every decoded frame is re-derivable.
pub trait AnimatedFrameSource: Send + Sync {
    /// Number of frames.
    fn frame_count(&self) -> usize;

    /// Container loop count.
    fn loop_count(&self) -> LoopCount;

    /// Metadata for a frame.
    fn frame_info(&self, index: usize) -> Option<FrameInfo>;

    /// Decoded size of one frame in bytes.
    fn bytes_per_frame(&self) -> usize {
        self.frame_info(0).map_or(0, |info| info.cost())
    }

    /// Decodes `count` consecutive frames starting at `start`.
    ///
    /// # Errors
    /// Returns `DecodeError` when the range is invalid or decoding fails.
    fn decode_frames(&self, start: usize, count: usize) -> Result<Vec<RgbaImage>, DecodeError>;

    /// Decodes a single frame.
    ///
    /// # Errors
    /// Returns `DecodeError` when the index is invalid or decoding fails.
    fn decode_frame(&self, index: usize) -> Result<RgbaImage, DecodeError> {
        self.decode_frames(index, 1)?
            .pop()
            .ok_or(DecodeError::FrameOutOfRange {
                index,
                count: self.frame_count(),
            })
    }
}
