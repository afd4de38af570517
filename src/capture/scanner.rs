//! Marker scanning for back-to-back JPEG payloads (MJPEG without length prefixes)
//!
//! Bytes are accumulated as they arrive. A frame is the inclusive range from the
//! first SOI (`FF D8`) to the first EOI (`FF D9`) strictly after it. Everything in
//! front of a newly found SOI is discarded, so at most one partial frame is ever
//! pending.

use bytes::{Buf, Bytes, BytesMut};
use tracing::warn;

pub const SOI: [u8; 2] = [0xFF, 0xD8];
pub const EOI: [u8; 2] = [0xFF, 0xD9];

/// Upper bound on a single pending frame before the scanner resyncs
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug)]
pub struct MarkerScanner {
    buf: BytesMut,
    /// Offset (relative to the SOI at index 0) already searched for EOI
    scanned: usize,
    max_frame_bytes: usize,
}

impl Default for MarkerScanner {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl MarkerScanner {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(64 * 1024),
            scanned: 0,
            max_frame_bytes,
        }
    }

    /// Append a transport chunk.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Extract the leftmost complete frame, if any.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        let Some(start) = find_marker(&self.buf, SOI, 0) else {
            // Keep a trailing 0xFF, it may be the first half of a split SOI
            let keep = usize::from(self.buf.last() == Some(&0xFF));
            let drop = self.buf.len() - keep;
            self.buf.advance(drop);
            self.scanned = 0;
            return None;
        };

        if start > 0 {
            self.buf.advance(start);
            self.scanned = 0;
        }

        let from = self.scanned.max(SOI.len());
        match find_marker(&self.buf, EOI, from) {
            Some(end) => {
                self.scanned = 0;
                Some(self.buf.split_to(end + EOI.len()).freeze())
            }
            None => {
                if self.buf.len() > self.max_frame_bytes {
                    warn!(
                        pending = self.buf.len(),
                        limit = self.max_frame_bytes,
                        "no end marker within frame limit, resyncing"
                    );
                    self.buf.clear();
                    self.scanned = 0;
                } else {
                    // Back off one byte so an EOI split across chunks is still found
                    self.scanned = self.buf.len().saturating_sub(1);
                }
                None
            }
        }
    }

    /// Push a chunk and collect every frame it completes, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.push(chunk);
        std::iter::from_fn(|| self.next_frame()).collect()
    }

    /// Bytes currently held for the pending partial frame
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.scanned = 0;
    }
}

fn find_marker(haystack: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    if haystack.len() < from + 2 {
        return None;
    }
    haystack[from..]
        .windows(2)
        .position(|w| w == marker)
        .map(|p| p + from)
}
