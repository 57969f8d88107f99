//! Byte-level sniffing of animated containers.
//!
//! The `image` crate exposes frames but not loop counts, so the loop fields
//! are read straight from the container here.

use image::ImageFormat;

use crate::domain::entities::LoopCount;

const GIF87_MAGIC: &[u8] = b"GIF87a";
const GIF89_MAGIC: &[u8] = b"GIF89a";
const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";
const NETSCAPE_APP: &[u8] = b"NETSCAPE2.0";

/// Container families that may hold more than one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum AnimatedContainer {
    Gif,
    WebP,
    Apng,
}

impl AnimatedContainer {
    /// Detects an animated container. GIF always qualifies; WebP and PNG only
    /// when they carry animation chunks.
    #[must_use]
    pub fn sniff(data: &[u8]) -> Option<Self> {
        if is_gif(data) {
            Some(Self::Gif)
        } else if is_animated_webp(data) {
            Some(Self::WebP)
        } else if find_png_chunk(data, b"acTL").is_some() {
            Some(Self::Apng)
        } else {
            None
        }
    }

    /// Matching `image` crate format.
    #[must_use]
    pub const fn image_format(self) -> ImageFormat {
        match self {
            Self::Gif => ImageFormat::Gif,
            Self::WebP => ImageFormat::WebP,
            Self::Apng => ImageFormat::Png,
        }
    }

    /// Reads the loop count stored in the container.
    #[must_use]
    pub fn loop_count(self, data: &[u8]) -> LoopCount {
        match self {
            Self::Gif => gif_loop_count(data),
            Self::WebP => webp_loop_count(data),
            Self::Apng => apng_loop_count(data),
        }
    }
}

/// Returns true for GIF87a/GIF89a data.
#[must_use]
pub fn is_gif(data: &[u8]) -> bool {
    data.starts_with(GIF89_MAGIC) || data.starts_with(GIF87_MAGIC)
}

fn is_webp(data: &[u8]) -> bool {
    data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP"
}

fn is_animated_webp(data: &[u8]) -> bool {
    // VP8X chunk header at 12, flags byte at 20, animation bit 0x02.
    is_webp(data) && data.len() > 20 && &data[12..16] == b"VP8X" && data[20] & 0x02 != 0
}

/// No NETSCAPE2.0 extension means the animation plays once.
fn gif_loop_count(data: &[u8]) -> LoopCount {
    let Some(pos) = find(data, NETSCAPE_APP) else {
        return LoopCount::Finite(1);
    };
    // Sub-block: size (3), id (1), count (u16 LE).
    let block = pos + NETSCAPE_APP.len();
    match data.get(block..block + 4) {
        Some([3, 1, lo, hi]) => LoopCount::from_container(u32::from(u16::from_le_bytes([*lo, *hi]))),
        _ => LoopCount::Infinite,
    }
}

fn webp_loop_count(data: &[u8]) -> LoopCount {
    let mut offset = 12;
    while let Some(header) = data.get(offset..offset + 8) {
        let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if &header[0..4] == b"ANIM" {
            // Background colour (4), then loop count (u16 LE).
            return data.get(offset + 12..offset + 14).map_or(LoopCount::Infinite, |b| {
                LoopCount::from_container(u32::from(u16::from_le_bytes([b[0], b[1]])))
            });
        }
        offset += 8 + size + (size & 1);
    }
    LoopCount::Infinite
}

fn apng_loop_count(data: &[u8]) -> LoopCount {
    // acTL body: num_frames (u32 BE), num_plays (u32 BE).
    find_png_chunk(data, b"acTL")
        .and_then(|body| body.get(4..8))
        .map_or(LoopCount::Infinite, |b| {
            LoopCount::from_container(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        })
}

/// Body of the first chunk of `kind` appearing before image data.
fn find_png_chunk<'a>(data: &'a [u8], kind: &[u8; 4]) -> Option<&'a [u8]> {
    if !data.starts_with(PNG_MAGIC) {
        return None;
    }
    let mut offset = PNG_MAGIC.len();
    while let Some(header) = data.get(offset..offset + 8) {
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let chunk_type = &header[4..8];
        if chunk_type == kind {
            return data.get(offset + 8..offset + 8 + len);
        }
        if chunk_type == b"IDAT" || chunk_type == b"IEND" {
            return None;
        }
        offset += 12 + len;
    }
    None
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
