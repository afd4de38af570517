//! GStreamer-based MJPEG-over-HTTP capture with hardware decode where available

use std::time::Instant;

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use super::frame::{Frame, PixelFormat};
use super::source::{CaptureBackend, FrameCapture};
use crate::error::StreamError;
use crate::StreamConfig;

/// How long one `read_frame` waits for a sample before yielding to the caller
const PULL_TIMEOUT_MS: u64 = 200;

/// Capture backend that lets GStreamer fetch, demux and decode the stream
pub struct GstCaptureBackend {
    timeout_secs: u64,
}

impl GstCaptureBackend {
    pub fn new(config: &StreamConfig) -> Result<Self, StreamError> {
        gst::init().map_err(|e| StreamError::CaptureOpen(format!("GStreamer init: {}", e)))?;
        Ok(Self {
            timeout_secs: config.read_timeout().as_secs().max(1),
        })
    }

    fn build_pipeline_string(&self, url: &str) -> String {
        let jpeg_decoder = detect_jpeg_decoder();
        info!("Using JPEG decoder: {}", jpeg_decoder);

        format!(
            "souphttpsrc location={} is-live=true timeout={} ! \
             multipartdemux ! \
             image/jpeg ! \
             queue max-size-buffers=2 max-size-time=0 max-size-bytes=0 leaky=downstream ! \
             {} ! \
             videoconvert ! \
             video/x-raw,format=RGB ! \
             appsink name=appsink",
            url, self.timeout_secs, jpeg_decoder
        )
    }
}

/// Detect best available JPEG decoder (hardware > software)
fn detect_jpeg_decoder() -> &'static str {
    let decoders = [
        "nvjpegdec",    // NVIDIA hardware decoder
        "vaapijpegdec", // Intel/AMD VAAPI hardware decoder
        "v4l2jpegdec",  // V4L2 hardware decoder
        "jpegdec",      // Software decoder (fallback)
    ];

    for decoder in &decoders {
        if gst::ElementFactory::find(decoder).is_some() {
            debug!("Found decoder: {}", decoder);
            return decoder;
        }
    }

    warn!("No hardware JPEG decoder found, using software decoder");
    "jpegdec"
}

impl CaptureBackend for GstCaptureBackend {
    fn open(&self, url: &str) -> Result<Box<dyn FrameCapture>, StreamError> {
        let pipeline_str = self.build_pipeline_string(url);
        info!("Pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| StreamError::CaptureOpen(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| StreamError::CaptureOpen("not a pipeline".into()))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| StreamError::CaptureOpen("missing appsink element".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| StreamError::CaptureOpen("appsink has wrong type".into()))?;

        // Latest frame wins; never let the sink queue up
        appsink.set_property("emit-signals", false);
        appsink.set_property("max-buffers", 1u32);
        appsink.set_property("drop", true);
        appsink.set_property("sync", false);

        let capture = GstCapture {
            pipeline,
            appsink,
            sequence: 0,
        };
        capture.start()?;
        Ok(Box::new(capture))
    }
}

struct GstCapture {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    sequence: u64,
}

impl GstCapture {
    fn start(&self) -> Result<(), StreamError> {
        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| StreamError::CaptureOpen(format!("failed to start pipeline: {:?}", e)))?;

        let (state_change, _, _) = self.pipeline.state(Some(gst::ClockTime::from_seconds(5)));
        match state_change {
            Ok(gst::StateChangeSuccess::Success) | Ok(gst::StateChangeSuccess::NoPreroll) => {
                info!("Pipeline started");
                Ok(())
            }
            Ok(gst::StateChangeSuccess::Async) => {
                info!("Pipeline starting asynchronously");
                Ok(())
            }
            Err(_) => Err(StreamError::CaptureOpen(
                self.bus_error().unwrap_or_else(|| "pipeline failed to start".into()),
            )),
        }
    }

    fn bus_error(&self) -> Option<String> {
        let bus = self.pipeline.bus()?;
        let msg = bus.pop_filtered(&[gst::MessageType::Error])?;
        match msg.view() {
            gst::MessageView::Error(err) => Some(err.error().to_string()),
            _ => None,
        }
    }

    fn sample_to_frame(&mut self, sample: &gst::Sample) -> Result<Frame, StreamError> {
        let timestamp = Instant::now();
        let buffer = sample
            .buffer()
            .ok_or_else(|| StreamError::CaptureRead("sample contains no buffer".into()))?;
        let caps = sample
            .caps()
            .ok_or_else(|| StreamError::CaptureRead("sample has no caps".into()))?;
        let video_info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|_| StreamError::CaptureRead("failed to parse video info".into()))?;
        let map = buffer
            .map_readable()
            .map_err(|_| StreamError::CaptureRead("failed to map buffer".into()))?;

        let width = video_info.width();
        let height = video_info.height();
        let row = width as usize * 3;
        let stride = video_info.stride()[0] as usize;
        let src = map.as_slice();

        // GStreamer pads RGB rows to 4 bytes; repack to tight rows
        let data = if stride == row {
            Bytes::copy_from_slice(&src[..row * height as usize])
        } else {
            let mut packed = Vec::with_capacity(row * height as usize);
            for y in 0..height as usize {
                packed.extend_from_slice(&src[y * stride..y * stride + row]);
            }
            Bytes::from(packed)
        };

        self.sequence += 1;
        let mut frame = Frame::new(data, width, height, PixelFormat::Rgb24)
            .with_sequence(self.sequence, map.size());
        frame.timestamp = timestamp;
        Ok(frame)
    }
}

impl FrameCapture for GstCapture {
    fn read_frame(&mut self) -> Result<Option<Frame>, StreamError> {
        if let Some(err) = self.bus_error() {
            return Err(StreamError::CaptureRead(err));
        }
        match self
            .appsink
            .try_pull_sample(gst::ClockTime::from_mseconds(PULL_TIMEOUT_MS))
        {
            Some(sample) => self.sample_to_frame(&sample).map(Some),
            None if self.appsink.is_eos() => Err(StreamError::CaptureRead("end of stream".into())),
            None => Ok(None),
        }
    }

    fn release(&mut self) {
        info!("Stopping GStreamer pipeline");
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("Failed to stop pipeline: {:?}", e);
        }
    }
}

impl Drop for GstCapture {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
