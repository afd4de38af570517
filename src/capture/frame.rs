use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Decoded frame with zero-copy semantics
///
/// Frames are never mutated after decode. Cloning shares the pixel data.
#[derive(Clone)]
pub struct Frame {
    /// Immutable pixel data, tightly packed rows of `width * channels` bytes
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Decode completion time, used for inter-arrival statistics
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Size of the encoded payload this frame was decoded from
    pub encoded_len: usize,
}

/// Pixel layouts a decoded frame can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Gray8,
    Rgb24,
    Bgr24,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
        }
    }

    /// V4L2 fourcc for output devices
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Gray8 => *b"GREY",
            PixelFormat::Rgb24 => *b"RGB3",
            PixelFormat::Bgr24 => *b"BGR3",
        }
    }
}

impl Frame {
    pub fn new(data: impl Into<Bytes>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data: data.into(),
            meta: Arc::new(FrameMetadata {
                sequence: 0,
                width,
                height,
                format,
                encoded_len: 0,
            }),
            timestamp: Instant::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn format(&self) -> PixelFormat {
        self.meta.format
    }

    /// (height, width), the key the normalizer caches crop geometry on
    pub fn shape(&self) -> (u32, u32) {
        (self.meta.height, self.meta.width)
    }

    pub fn row_bytes(&self) -> usize {
        self.meta.width as usize * self.meta.format.channels()
    }

    /// Copy of this frame with a new sequence number and encoded size
    pub(crate) fn with_sequence(mut self, sequence: u64, encoded_len: usize) -> Self {
        let mut meta = (*self.meta).clone();
        meta.sequence = sequence;
        meta.encoded_len = encoded_len;
        self.meta = Arc::new(meta);
        self
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.meta.sequence)
            .field("width", &self.meta.width)
            .field("height", &self.meta.height)
            .field("format", &self.meta.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}
