//! Virtual camera devices
//!
//! The loopback implementation needs the `v4l2loopback` kernel module:
//!
//! ```bash
//! sudo modprobe v4l2loopback devices=1 video_nr=10 card_label="Phone Camera" exclusive_caps=1
//! ```

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use v4l::video::Output;
use v4l::{Device, FourCC};

use crate::capture::PixelFormat;
use crate::error::OutputError;

/// Geometry a virtual device is acquired with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputGeometry {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
}

impl OutputGeometry {
    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * self.format.channels()
    }
}

/// An acquired virtual output device
pub trait VirtualDevice: Send {
    fn name(&self) -> &str;

    /// Push one frame of exactly `geometry.frame_bytes()` bytes.
    fn write_frame(&mut self, data: &[u8]) -> Result<(), OutputError>;

    fn close(&mut self) {}
}

/// Acquires virtual devices by geometry
pub trait DeviceOpener: Send + Sync {
    /// Whether the driver/device node exists at all
    fn is_available(&self) -> bool;

    fn open(&self, geometry: &OutputGeometry) -> Result<Box<dyn VirtualDevice>, OutputError>;
}

/// Opens a v4l2loopback node for writing
pub struct V4l2LoopbackOpener {
    path: PathBuf,
}

impl V4l2LoopbackOpener {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DeviceOpener for V4l2LoopbackOpener {
    fn is_available(&self) -> bool {
        self.path.exists()
    }

    fn open(&self, geometry: &OutputGeometry) -> Result<Box<dyn VirtualDevice>, OutputError> {
        info!(
            "Opening V4L2 loopback device {} ({}x{}@{}, {:?})",
            self.path.display(),
            geometry.width,
            geometry.height,
            geometry.fps,
            geometry.format
        );

        if !self.path.exists() {
            return Err(OutputError::Unavailable(self.path.display().to_string()));
        }

        let file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    OutputError::PermissionDenied(self.path.display().to_string())
                } else {
                    OutputError::Open(e.to_string())
                }
            })?;

        // Loopback devices take their format from the first writer
        let device = Device::with_path(&self.path).map_err(|e| OutputError::Open(e.to_string()))?;
        let fourcc = FourCC::new(&geometry.format.fourcc());
        let fmt = v4l::Format::new(geometry.width, geometry.height, fourcc);
        match Output::set_format(&device, &fmt) {
            Ok(applied) => debug!(
                "V4L2 output format: {}x{} {}",
                applied.width, applied.height, applied.fourcc
            ),
            Err(e) => warn!("Could not set V4L2 format (may still work): {}", e),
        }

        Ok(Box::new(V4l2Loopback {
            name: self.path.display().to_string(),
            file: Some(file),
            expected: geometry.frame_bytes(),
            frames_written: 0,
        }))
    }
}

struct V4l2Loopback {
    name: String,
    file: Option<File>,
    expected: usize,
    frames_written: u64,
}

impl VirtualDevice for V4l2Loopback {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_frame(&mut self, data: &[u8]) -> Result<(), OutputError> {
        if data.len() != self.expected {
            return Err(OutputError::Format(format!(
                "frame is {} bytes, device expects {}",
                data.len(),
                self.expected
            )));
        }
        let file = self.file.as_mut().ok_or(OutputError::NotStarted)?;
        file.write_all(data)?;
        self.frames_written += 1;
        Ok(())
    }

    fn close(&mut self) {
        if self.file.take().is_some() {
            info!(device = %self.name, frames = self.frames_written, "V4L2 loopback closed");
        }
    }
}
