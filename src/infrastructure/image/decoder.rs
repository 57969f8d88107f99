//! `image`-crate backed decoders and the priority-ordered decoder registry.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use image::codecs::gif::GifDecoder;
use image::codecs::png::PngDecoder;
use image::codecs::webp::WebPDecoder;
use image::{AnimationDecoder, Delay, DynamicImage, Frames, ImageError, ImageFormat, RgbaImage};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use super::container::{AnimatedContainer, is_gif};
use crate::domain::entities::{DecodedImage, FrameInfo, LoopCount};
use crate::domain::errors::DecodeError;
use crate::domain::ports::{AnimatedFrameSource, ImageDecoderPort};

/// Frames shorter than this play at `DEFAULT_FRAME_DURATION`.
pub const MIN_FRAME_DURATION: Duration = Duration::from_millis(11);

/// Substitute duration for zero or near-zero frame delays.
pub const DEFAULT_FRAME_DURATION: Duration = Duration::from_millis(100);

/// Formats the still decoder accepts.
const STILL_FORMATS: &[ImageFormat] = &[
    ImageFormat::Png,
    ImageFormat::Jpeg,
    ImageFormat::WebP,
    ImageFormat::Gif,
];

/// Normalizes a container frame delay.
#[must_use]
pub fn frame_duration(delay: Delay) -> Duration {
    let (numer, denom) = delay.numer_denom_ms();
    let micros = u64::from(numer) * 1000 / u64::from(denom.max(1));
    let duration = Duration::from_micros(micros);
    if duration < MIN_FRAME_DURATION {
        DEFAULT_FRAME_DURATION
    } else {
        duration
    }
}

/// Decodes single-frame PNG, JPEG, WebP and GIF data.
#[derive(Debug, Default, Clone, Copy)]
pub struct StillImageDecoder;

impl ImageDecoderPort for StillImageDecoder {
    fn name(&self) -> &'static str {
        "still"
    }

    fn can_decode(&self, data: &[u8]) -> bool {
        image::guess_format(data).is_ok_and(|format| STILL_FORMATS.contains(&format))
    }

    fn decode(&self, data: &Bytes) -> Result<DecodedImage, DecodeError> {
        let format = image::guess_format(data).map_err(|_| DecodeError::UnknownFormat)?;
        let image = image::load_from_memory_with_format(data, format)?;
        trace!(format = ?format, width = image.width(), height = image.height(), "Decoded still image");
        Ok(DecodedImage::still(format, image))
    }
}

/// Decodes animated GIF, WebP and APNG data into a poster plus an on-demand
/// frame source. Single-frame containers come back as still images.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnimatedImageDecoder;

impl ImageDecoderPort for AnimatedImageDecoder {
    fn name(&self) -> &'static str {
        "animated"
    }

    fn can_decode(&self, data: &[u8]) -> bool {
        AnimatedContainer::sniff(data).is_some()
    }

    fn decode(&self, data: &Bytes) -> Result<DecodedImage, DecodeError> {
        let container = AnimatedContainer::sniff(data).ok_or(DecodeError::UnknownFormat)?;
        let (source, poster) = ImageCrateFrameSource::scan(container, data.clone())?;
        let poster = DynamicImage::ImageRgba8(poster);

        if source.frame_count() <= 1 {
            return Ok(DecodedImage::still(container.image_format(), poster));
        }

        debug!(
            format = ?container,
            frames = source.frame_count(),
            loop_count = ?source.loop_count(),
            "Decoded animated image"
        );
        Ok(DecodedImage::animated(
            container.image_format(),
            poster,
            Arc::new(source),
        ))
    }

    fn can_incrementally_decode(&self, data: &[u8]) -> bool {
        is_gif(data)
    }

    /// Previews the first GIF frame once it has fully arrived. Truncated
    /// data yields no preview; malformed data is an error.
    fn incremental_decode(
        &self,
        data: &Bytes,
        finished: bool,
    ) -> Result<Option<DecodedImage>, DecodeError> {
        if finished {
            return self.decode(data).map(Some);
        }
        if !is_gif(data) {
            return Ok(None);
        }
        let decoder = match GifDecoder::new(Cursor::new(data.clone())) {
            Ok(decoder) => decoder,
            Err(e) => return partial_preview(e),
        };
        match decoder.into_frames().next() {
            Some(Ok(frame)) => Ok(Some(DecodedImage::still(
                ImageFormat::Gif,
                DynamicImage::ImageRgba8(frame.into_buffer()),
            ))),
            Some(Err(e)) => partial_preview(e),
            None => Ok(None),
        }
    }
}

/// Running out of bytes is expected mid-download.
fn partial_preview(err: ImageError) -> Result<Option<DecodedImage>, DecodeError> {
    match err {
        ImageError::IoError(_) => Ok(None),
        other => Err(other.into()),
    }
}

/// Frame source over immutable encoded bytes.
///
/// Container frame iterators only decode forward, so frames are served by a
/// cursor thread that keeps the iterator between requests. Reading forward
/// resumes where the last request stopped; seeking backward re-opens the
/// container.
pub struct ImageCrateFrameSource {
    container: AnimatedContainer,
    data: Bytes,
    width: u32,
    height: u32,
    durations: Vec<Duration>,
    loop_count: LoopCount,
    cursor: Mutex<Option<mpsc::Sender<CursorRequest>>>,
    frames_decoded: Arc<AtomicUsize>,
}

type FrameBatch = Result<Vec<RgbaImage>, DecodeError>;

struct CursorRequest {
    start: usize,
    count: usize,
    reply: mpsc::Sender<FrameBatch>,
}

impl ImageCrateFrameSource {
    /// Walks every frame once to collect durations. Returns the source and
    /// its first frame.
    ///
    /// # Errors
    /// Returns `DecodeError` if the container is malformed or empty.
    pub fn scan(
        container: AnimatedContainer,
        data: Bytes,
    ) -> Result<(Self, RgbaImage), DecodeError> {
        let mut durations = Vec::new();
        let mut poster: Option<RgbaImage> = None;

        for frame in open_frames(container, &data)? {
            let frame = frame?;
            durations.push(frame_duration(frame.delay()));
            if poster.is_none() {
                poster = Some(frame.into_buffer());
            }
        }

        let poster = poster.ok_or_else(|| DecodeError::malformed("animation has no frames"))?;
        let loop_count = container.loop_count(&data);

        let source = Self {
            container,
            width: poster.width(),
            height: poster.height(),
            data,
            durations,
            loop_count,
            cursor: Mutex::new(None),
            frames_decoded: Arc::new(AtomicUsize::new(0)),
        };
        Ok((source, poster))
    }

    /// Encoded bytes backing this source.
    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Container frames decoded to serve requests, skipped ones included.
    #[must_use]
    pub fn frames_decoded(&self) -> usize {
        self.frames_decoded.load(Ordering::Relaxed)
    }

    fn cursor(&self) -> Option<mpsc::Sender<CursorRequest>> {
        let mut cursor = self.cursor.lock();
        if let Some(tx) = cursor.as_ref() {
            return Some(tx.clone());
        }

        let (tx, rx) = mpsc::channel::<CursorRequest>();
        let container = self.container;
        let data = self.data.clone();
        let decoded = self.frames_decoded.clone();
        let spawned = thread::Builder::new()
            .name("oximage-frames".to_string())
            .spawn(move || {
                let mut reader = FrameReader::new(container, data, decoded);
                while let Ok(request) = rx.recv() {
                    let batch = reader.read(request.start, request.count);
                    let _ = request.reply.send(batch);
                }
                trace!("Frame cursor closed");
            });

        match spawned {
            Ok(_) => {
                *cursor = Some(tx.clone());
                Some(tx)
            }
            Err(e) => {
                warn!(error = %e, "Failed to start frame cursor, decoding from the start");
                None
            }
        }
    }

    fn decode_from_start(&self, start: usize, count: usize) -> FrameBatch {
        FrameReader::new(self.container, self.data.clone(), self.frames_decoded.clone())
            .read(start, count)
    }
}

/// Forward-only reader owned by the cursor thread.
struct FrameReader {
    container: AnimatedContainer,
    data: Bytes,
    frames: Option<Frames<'static>>,
    next: usize,
    decoded: Arc<AtomicUsize>,
}

impl FrameReader {
    fn new(container: AnimatedContainer, data: Bytes, decoded: Arc<AtomicUsize>) -> Self {
        Self {
            container,
            data,
            frames: None,
            next: 0,
            decoded,
        }
    }

    fn read(&mut self, start: usize, count: usize) -> FrameBatch {
        let result = self.read_inner(start, count);
        if result.is_err() {
            self.frames = None;
        }
        result
    }

    fn read_inner(&mut self, start: usize, count: usize) -> FrameBatch {
        if self.frames.is_none() || start < self.next {
            self.frames = Some(open_frames(self.container, &self.data)?);
            self.next = 0;
        }
        let Some(frames) = self.frames.as_mut() else {
            return Err(DecodeError::malformed("frame cursor unavailable"));
        };

        let mut out = Vec::with_capacity(count);
        while self.next < start + count {
            let frame = frames
                .next()
                .ok_or_else(|| DecodeError::malformed("animation ended early"))??;
            self.decoded.fetch_add(1, Ordering::Relaxed);
            if self.next >= start {
                out.push(frame.into_buffer());
            }
            self.next += 1;
        }
        Ok(out)
    }
}

impl AnimatedFrameSource for ImageCrateFrameSource {
    fn frame_count(&self) -> usize {
        self.durations.len()
    }

    fn loop_count(&self) -> LoopCount {
        self.loop_count
    }

    fn frame_info(&self, index: usize) -> Option<FrameInfo> {
        self.durations.get(index).map(|&duration| FrameInfo {
            index,
            width: self.width,
            height: self.height,
            duration,
        })
    }

    fn decode_frames(&self, start: usize, count: usize) -> Result<Vec<RgbaImage>, DecodeError> {
        let total = self.frame_count();
        if start >= total {
            return Err(DecodeError::FrameOutOfRange {
                index: start,
                count: total,
            });
        }
        let count = count.min(total - start);

        let Some(cursor) = self.cursor() else {
            return self.decode_from_start(start, count);
        };
        let (reply, response) = mpsc::channel();
        let request = CursorRequest {
            start,
            count,
            reply,
        };
        if cursor.send(request).is_err() {
            self.cursor.lock().take();
            return self.decode_from_start(start, count);
        }
        response.recv().unwrap_or_else(|_| {
            self.cursor.lock().take();
            self.decode_from_start(start, count)
        })
    }
}

impl std::fmt::Debug for ImageCrateFrameSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCrateFrameSource")
            .field("container", &self.container)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("frames", &self.durations.len())
            .field("loop_count", &self.loop_count)
            .finish_non_exhaustive()
    }
}

fn open_frames(container: AnimatedContainer, data: &Bytes) -> Result<Frames<'static>, DecodeError> {
    let cursor = Cursor::new(data.clone());
    let frames = match container {
        AnimatedContainer::Gif => GifDecoder::new(cursor)?.into_frames(),
        AnimatedContainer::WebP => WebPDecoder::new(cursor)?.into_frames(),
        AnimatedContainer::Apng => PngDecoder::new(cursor)?.apng()?.into_frames(),
    };
    Ok(frames)
}

/// Decoders tried in priority order. Later registrations take priority.
pub struct DecoderRegistry {
    decoders: RwLock<Vec<Arc<dyn ImageDecoderPort>>>,
}

impl DecoderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            decoders: RwLock::new(Vec::new()),
        }
    }

    /// Creates a registry with the still and animated decoders; animated
    /// containers are tried first.
    #[must_use]
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(StillImageDecoder));
        registry.register(Arc::new(AnimatedImageDecoder));
        registry
    }

    /// Registers a decoder ahead of all existing ones.
    pub fn register(&self, decoder: Arc<dyn ImageDecoderPort>) {
        debug!(decoder = decoder.name(), "Registered image decoder");
        self.decoders.write().insert(0, decoder);
    }

    /// Number of registered decoders.
    #[must_use]
    pub fn len(&self) -> usize {
        self.decoders.read().len()
    }

    /// Returns true if no decoder is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.decoders.read().is_empty()
    }

    /// First decoder accepting the data.
    #[must_use]
    pub fn decoder_for(&self, data: &[u8]) -> Option<Arc<dyn ImageDecoderPort>> {
        self.decoders
            .read()
            .iter()
            .find(|d| d.can_decode(data))
            .cloned()
    }

    /// First decoder able to preview a prefix of the data.
    #[must_use]
    pub fn incremental_decoder_for(&self, data: &[u8]) -> Option<Arc<dyn ImageDecoderPort>> {
        self.decoders
            .read()
            .iter()
            .find(|d| d.can_incrementally_decode(data))
            .cloned()
    }

    /// Decodes complete data with the first accepting decoder.
    ///
    /// # Errors
    /// Returns `DecodeError::UnknownFormat` if no decoder accepts the data,
    /// or the chosen decoder's error.
    pub fn decode(&self, data: &Bytes) -> Result<DecodedImage, DecodeError> {
        let decoder = self.decoder_for(data).ok_or(DecodeError::UnknownFormat)?;
        trace!(decoder = decoder.name(), size = data.len(), "Decoding image");
        decoder.decode(data)
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&'static str> = self.decoders.read().iter().map(|d| d.name()).collect();
        f.debug_struct("DecoderRegistry")
            .field("decoders", &names)
            .finish()
    }
}
