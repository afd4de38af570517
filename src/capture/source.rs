//! Capture-delegate abstraction: something that hands out whole frames
//!
//! The receiver's capture strategy only sees `open` and `read_frame`; how the
//! frames are produced (scanning an HTTP body, a GStreamer pipeline, ...) is
//! the backend's business.

use std::collections::VecDeque;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info};

use super::decoder::decode_jpeg;
use super::frame::Frame;
use super::scanner::MarkerScanner;
use super::transport::{classify_read_error, ByteStream, Transport};
use crate::error::StreamError;

/// An opened capture handle
pub trait FrameCapture: Send {
    /// `Ok(Some)` for a frame, `Ok(None)` when nothing is ready yet and the
    /// caller should check for cancellation, `Err` when the stream is lost.
    fn read_frame(&mut self) -> Result<Option<Frame>, StreamError>;

    /// Release the underlying handle. Called once when the session ends.
    fn release(&mut self) {}
}

/// Opens capture handles against a stream URL
pub trait CaptureBackend: Send + Sync {
    fn open(&self, url: &str) -> Result<Box<dyn FrameCapture>, StreamError>;
}

/// Built-in backend: MJPEG over any `Transport`, scanned and decoded in-process
pub struct MjpegCaptureBackend {
    transport: Arc<dyn Transport>,
    chunk_size: usize,
    read_timeout: Duration,
}

impl MjpegCaptureBackend {
    pub fn new(transport: Arc<dyn Transport>, chunk_size: usize, read_timeout: Duration) -> Self {
        Self {
            transport,
            chunk_size: chunk_size.max(1),
            read_timeout,
        }
    }
}

impl CaptureBackend for MjpegCaptureBackend {
    fn open(&self, url: &str) -> Result<Box<dyn FrameCapture>, StreamError> {
        let stream = self
            .transport
            .open(url)
            .map_err(|e| StreamError::CaptureOpen(e.to_string()))?;
        info!(url, "MJPEG capture opened");
        Ok(Box::new(MjpegCapture {
            stream: Some(stream),
            scanner: MarkerScanner::default(),
            chunk: vec![0; self.chunk_size],
            ready: VecDeque::new(),
            read_timeout: self.read_timeout,
        }))
    }
}

struct MjpegCapture {
    stream: Option<ByteStream>,
    scanner: MarkerScanner,
    chunk: Vec<u8>,
    ready: VecDeque<Bytes>,
    read_timeout: Duration,
}

impl FrameCapture for MjpegCapture {
    fn read_frame(&mut self) -> Result<Option<Frame>, StreamError> {
        if self.ready.is_empty() {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| StreamError::CaptureRead("capture released".into()))?;
            let read_timeout = self.read_timeout;
            let n = stream.read(&mut self.chunk).map_err(|e| {
                StreamError::CaptureRead(classify_read_error(e, read_timeout).to_string())
            })?;
            if n == 0 {
                return Err(StreamError::CaptureRead("end of stream".into()));
            }
            self.ready.extend(self.scanner.feed(&self.chunk[..n]));
        }

        let Some(encoded) = self.ready.pop_front() else {
            return Ok(None);
        };
        match decode_jpeg(&encoded) {
            Ok(frame) => Ok(Some(frame)),
            Err(e) => {
                debug!("dropping undecodable frame: {}", e);
                metrics::counter!("phonecam_decode_failures").increment(1);
                Ok(None)
            }
        }
    }

    fn release(&mut self) {
        self.stream = None;
        self.scanner.reset();
        self.ready.clear();
    }
}
