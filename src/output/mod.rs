//! Frame normalization and the virtual camera output
//!
//! Every frame is center-cropped to the output aspect ratio, resized to the
//! output geometry, converted to the device pixel format and written. Delivery
//! is best-effort: `send_frame` never reports failure to the ingestion path.

pub mod device;
pub mod geometry;

use std::borrow::Cow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, Rgb};
use tracing::{debug, info, instrument, warn};

use crate::capture::{Frame, PixelFormat};
use crate::error::OutputError;
use crate::OutputConfig;

pub use device::{DeviceOpener, OutputGeometry, V4l2LoopbackOpener, VirtualDevice};
pub use geometry::{CropCache, CropGeometry};

struct OutputState {
    device: Option<Box<dyn VirtualDevice>>,
    geometry: OutputGeometry,
    crop: CropCache,
}

pub struct VirtualOutput {
    opener: Arc<dyn DeviceOpener>,
    state: Mutex<OutputState>,
}

impl VirtualOutput {
    pub fn new(opener: Arc<dyn DeviceOpener>, config: &OutputConfig) -> Self {
        Self {
            opener,
            state: Mutex::new(OutputState {
                device: None,
                geometry: config.geometry(),
                crop: CropCache::default(),
            }),
        }
    }

    /// Output backed by the configured v4l2loopback node
    pub fn loopback(config: &OutputConfig) -> Self {
        Self::new(Arc::new(V4l2LoopbackOpener::new(&config.device)), config)
    }

    fn lock(&self) -> MutexGuard<'_, OutputState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_available(&self) -> bool {
        self.opener.is_available()
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().device.is_some()
    }

    pub fn device_name(&self) -> Option<String> {
        self.lock().device.as_ref().map(|d| d.name().to_string())
    }

    pub fn geometry(&self) -> OutputGeometry {
        self.lock().geometry
    }

    /// Acquire the device. Succeeds immediately if already started; on failure
    /// the output stays disabled.
    #[instrument(skip(self))]
    pub fn start(&self, width: u32, height: u32, fps: u32) -> Result<(), OutputError> {
        let mut state = self.lock();
        if state.device.is_some() {
            return Ok(());
        }

        let geometry = OutputGeometry {
            width,
            height,
            fps,
            format: state.geometry.format,
        };
        let device = self.opener.open(&geometry)?;
        info!("Virtual camera started: {}", device.name());
        state.geometry = geometry;
        state.crop.clear();
        state.device = Some(device);
        Ok(())
    }

    pub fn stop(&self) {
        let mut state = self.lock();
        if let Some(mut device) = state.device.take() {
            device.close();
            info!("Virtual camera stopped");
        }
        state.crop.clear();
    }

    /// Best-effort delivery; failures are logged and counted, never returned.
    pub fn send_frame(&self, frame: &Frame) {
        match self.try_send_frame(frame) {
            Ok(()) | Err(OutputError::NotStarted) => {}
            Err(e) => {
                warn!("Error sending frame: {}", e);
                metrics::counter!("phonecam_output_errors").increment(1);
            }
        }
    }

    /// Like `send_frame`, but surfaces the failure kind.
    pub fn try_send_frame(&self, frame: &Frame) -> Result<(), OutputError> {
        let mut state = self.lock();
        let state = &mut *state;
        let device = state.device.as_mut().ok_or(OutputError::NotStarted)?;

        let geometry = state.geometry;
        let crop = state
            .crop
            .get(frame.shape(), (geometry.width, geometry.height));
        let data = normalize(frame, &crop, &geometry)?;
        device.write_frame(&data)?;
        metrics::counter!("phonecam_output_frames").increment(1);
        Ok(())
    }

    /// Times the crop geometry has been recomputed since creation
    pub fn crop_recomputes(&self) -> u64 {
        self.lock().crop.recomputes()
    }
}

impl Drop for VirtualOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Crop, resize and convert one frame into the device layout.
pub fn normalize(
    frame: &Frame,
    crop: &CropGeometry,
    geometry: &OutputGeometry,
) -> Result<Vec<u8>, OutputError> {
    let channels = frame.format().channels();
    let expected = frame.row_bytes() * frame.height() as usize;
    if frame.data.len() != expected {
        return Err(OutputError::Format(format!(
            "{}x{} {:?} frame carries {} bytes, expected {}",
            frame.width(),
            frame.height(),
            frame.format(),
            frame.data.len(),
            expected
        )));
    }

    let (mut pixels, mut width, mut height): (Cow<'_, [u8]>, u32, u32) = if crop.needs_crop {
        let row = frame.row_bytes();
        let x0 = crop.x_offset as usize * channels;
        let span = crop.width as usize * channels;
        let mut out = Vec::with_capacity(span * crop.height as usize);
        for y in crop.y_offset as usize..(crop.y_offset + crop.height) as usize {
            let start = y * row + x0;
            out.extend_from_slice(&frame.data[start..start + span]);
        }
        (Cow::Owned(out), crop.width, crop.height)
    } else {
        (Cow::Borrowed(&frame.data[..]), frame.width(), frame.height())
    };

    if (width, height) != (geometry.width, geometry.height) {
        debug!(
            from = ?(width, height),
            to = ?(geometry.width, geometry.height),
            "resizing frame"
        );
        pixels = Cow::Owned(resize(
            pixels.into_owned(),
            width,
            height,
            geometry.width,
            geometry.height,
            frame.format(),
        )?);
        width = geometry.width;
        height = geometry.height;
    }
    debug_assert_eq!((width, height), (geometry.width, geometry.height));

    Ok(convert_format(&pixels, frame.format(), geometry.format))
}

fn resize(
    data: Vec<u8>,
    width: u32,
    height: u32,
    new_width: u32,
    new_height: u32,
    format: PixelFormat,
) -> Result<Vec<u8>, OutputError> {
    let bad_buffer = || OutputError::Format(format!("{}x{} buffer does not match", width, height));
    match format {
        PixelFormat::Gray8 => {
            let img = ImageBuffer::<Luma<u8>, _>::from_raw(width, height, data)
                .ok_or_else(bad_buffer)?;
            Ok(imageops::resize(&img, new_width, new_height, FilterType::Triangle).into_raw())
        }
        // Resampling is per channel, so BGR goes through the RGB path unchanged
        PixelFormat::Rgb24 | PixelFormat::Bgr24 => {
            let img = ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, data)
                .ok_or_else(bad_buffer)?;
            Ok(imageops::resize(&img, new_width, new_height, FilterType::Triangle).into_raw())
        }
    }
}

fn convert_format(data: &[u8], from: PixelFormat, to: PixelFormat) -> Vec<u8> {
    use PixelFormat::*;
    match (from, to) {
        (a, b) if a == b => data.to_vec(),
        (Rgb24, Bgr24) | (Bgr24, Rgb24) => data
            .chunks_exact(3)
            .flat_map(|p| [p[2], p[1], p[0]])
            .collect(),
        (Gray8, Rgb24) | (Gray8, Bgr24) => data.iter().flat_map(|&g| [g, g, g]).collect(),
        (Rgb24, Gray8) => data.chunks_exact(3).map(|p| luma(p[0], p[1], p[2])).collect(),
        (Bgr24, Gray8) => data.chunks_exact(3).map(|p| luma(p[2], p[1], p[0])).collect(),
        _ => data.to_vec(),
    }
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Recorded {
        frames: Mutex<Vec<Vec<u8>>>,
        closed: AtomicBool,
        fail_writes: AtomicBool,
    }

    struct RecordingDevice(Arc<Recorded>);

    impl VirtualDevice for RecordingDevice {
        fn name(&self) -> &str {
            "recording"
        }

        fn write_frame(&mut self, data: &[u8]) -> Result<(), OutputError> {
            if self.0.fail_writes.load(Ordering::SeqCst) {
                return Err(OutputError::Write(std::io::Error::other("device gone")));
            }
            self.0.frames.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        fn close(&mut self) {
            self.0.closed.store(true, Ordering::SeqCst);
        }
    }

    struct RecordingOpener {
        recorded: Arc<Recorded>,
        available: bool,
    }

    impl DeviceOpener for RecordingOpener {
        fn is_available(&self) -> bool {
            self.available
        }

        fn open(&self, _geometry: &OutputGeometry) -> Result<Box<dyn VirtualDevice>, OutputError> {
            if !self.available {
                return Err(OutputError::Unavailable("no driver".into()));
            }
            Ok(Box::new(RecordingDevice(self.recorded.clone())))
        }
    }

    fn output(available: bool) -> (VirtualOutput, Arc<Recorded>) {
        let recorded = Arc::new(Recorded::default());
        let opener = Arc::new(RecordingOpener {
            recorded: recorded.clone(),
            available,
        });
        let config = OutputConfig {
            format: PixelFormat::Rgb24,
            ..OutputConfig::default()
        };
        (VirtualOutput::new(opener, &config), recorded)
    }

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Frame {
        let data: Vec<u8> = (0..width * height).flat_map(|_| rgb).collect();
        Frame::new(data, width, height, PixelFormat::Rgb24)
    }

    #[test]
    fn send_before_start_is_a_noop() {
        let (out, recorded) = output(true);
        out.send_frame(&solid(4, 4, [1, 2, 3]));
        assert!(matches!(
            out.try_send_frame(&solid(4, 4, [1, 2, 3])),
            Err(OutputError::NotStarted)
        ));
        assert!(recorded.frames.lock().unwrap().is_empty());
    }

    #[test]
    fn start_failure_leaves_output_disabled() {
        let (out, _) = output(false);
        assert!(!out.is_available());
        assert!(matches!(out.start(64, 36, 30), Err(OutputError::Unavailable(_))));
        assert!(!out.is_enabled());
    }

    #[test]
    fn start_is_idempotent() {
        let (out, _) = output(true);
        out.start(64, 36, 30).unwrap();
        out.start(32, 18, 15).unwrap();
        assert!(out.is_enabled());
        assert_eq!(out.geometry().width, 64);
        assert_eq!(out.device_name().as_deref(), Some("recording"));
    }

    #[test]
    fn frames_are_cropped_and_resized_to_target() {
        let (out, recorded) = output(true);
        out.start(16, 9, 30).unwrap();
        // portrait source, only the middle band survives the crop
        let mut data = Vec::new();
        for y in 0..64u32 {
            let v = if (22..42).contains(&y) { 200 } else { 10 };
            data.extend(std::iter::repeat([v, v, v]).take(36).flatten());
        }
        let frame = Frame::new(data, 36, 64, PixelFormat::Rgb24);
        out.try_send_frame(&frame).unwrap();

        let frames = recorded.frames.lock().unwrap();
        assert_eq!(frames[0].len(), 16 * 9 * 3);
        assert!(frames[0].iter().all(|&b| b > 150), "crop kept the border rows");
    }

    #[test]
    fn crop_is_cached_across_frames() {
        let (out, recorded) = output(true);
        out.start(16, 9, 30).unwrap();
        for _ in 0..5 {
            out.send_frame(&solid(32, 18, [9, 9, 9]));
        }
        out.send_frame(&solid(18, 32, [9, 9, 9]));
        assert_eq!(out.crop_recomputes(), 2);
        assert_eq!(recorded.frames.lock().unwrap().len(), 6);
    }

    #[test]
    fn write_failures_are_swallowed() {
        let (out, recorded) = output(true);
        out.start(4, 4, 30).unwrap();
        recorded.fail_writes.store(true, Ordering::SeqCst);
        out.send_frame(&solid(4, 4, [1, 2, 3]));
        assert!(matches!(
            out.try_send_frame(&solid(4, 4, [1, 2, 3])),
            Err(OutputError::Write(_))
        ));
        assert!(out.is_enabled());
    }

    #[test]
    fn stop_releases_device_and_is_repeatable() {
        let (out, recorded) = output(true);
        out.start(4, 4, 30).unwrap();
        out.stop();
        out.stop();
        assert!(recorded.closed.load(Ordering::SeqCst));
        assert!(!out.is_enabled());
        assert!(out.device_name().is_none());
    }

    #[test]
    fn channel_order_is_converted_for_the_device() {
        let frame = solid(2, 1, [1, 2, 3]);
        let crop = CropGeometry::compute((2, 1), (2, 1));
        let geometry = OutputGeometry {
            width: 2,
            height: 1,
            fps: 30,
            format: PixelFormat::Bgr24,
        };
        assert_eq!(normalize(&frame, &crop, &geometry).unwrap(), vec![3, 2, 1, 3, 2, 1]);
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let frame = Frame::new(vec![0u8; 5], 2, 2, PixelFormat::Rgb24);
        let crop = CropGeometry::compute((2, 2), (2, 2));
        let geometry = OutputGeometry {
            width: 2,
            height: 2,
            fps: 30,
            format: PixelFormat::Rgb24,
        };
        assert!(matches!(
            normalize(&frame, &crop, &geometry),
            Err(OutputError::Format(_))
        ));
    }
}
