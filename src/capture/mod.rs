pub mod decoder;
pub mod frame;
#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_capture;
pub mod scanner;
pub mod source;
pub mod transport;

pub use frame::Frame;
pub use frame::PixelFormat;
#[cfg(feature = "gstreamer-pipeline")]
pub use gst_capture::GstCaptureBackend;
pub use scanner::MarkerScanner;
pub use source::{CaptureBackend, FrameCapture, MjpegCaptureBackend};
pub use transport::{ByteStream, HttpTransport, Transport};
