//! Phone camera relay: MJPEG ingestion, virtual camera output and USB bridge

pub mod bridge;
pub mod capture;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod receiver;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

pub use bridge::{AndroidDevice, DeviceBridge, DeviceListener, PortForwardSession};
pub use capture::Frame;
pub use error::{BridgeError, ConfigError, OutputError, StreamError};
pub use output::{CropGeometry, OutputGeometry, VirtualOutput};
pub use pipeline::{FrameBuffer, StreamStats};
pub use receiver::{ConnectionStatus, Ingest, ReceiverListener, StatusChange, StreamReceiver};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub stream: StreamConfig,
    pub output: OutputConfig,
    pub bridge: BridgeConfig,
}

/// Which ingestion strategy the relay uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestKind {
    /// Marker scanning over the raw HTTP body
    #[default]
    Raw,
    /// Built-in capture delegate
    Capture,
    /// GStreamer capture delegate (feature `gstreamer-pipeline`)
    Gstreamer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub ingest: IngestKind,
    pub chunk_size: usize,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Bounded wait for the ingestion thread on disconnect
    pub join_timeout_ms: u64,
    pub fps_window: usize,
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub enabled: bool,
    pub device: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Path or name of the bridge tool
    pub tool: String,
    /// Forward the stream port over USB before connecting
    pub use_usb: bool,
    pub device_serial: Option<String>,
    pub local_port: u16,
    pub remote_port: u16,
    pub command_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub join_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            path: "/video".into(),
            ingest: IngestKind::Raw,
            chunk_size: 4096,
            connect_timeout_ms: 10_000,
            read_timeout_ms: 10_000,
            join_timeout_ms: 2_000,
            fps_window: pipeline::window::FPS_WINDOW,
            max_frame_bytes: capture::scanner::DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            device: PathBuf::from("/dev/video10"),
            width: 1280,
            height: 720,
            fps: 30,
            format: PixelFormat::Rgb24,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            tool: "adb".into(),
            use_usb: false,
            device_serial: None,
            local_port: bridge::DEFAULT_LOCAL_PORT,
            remote_port: bridge::DEFAULT_REMOTE_PORT,
            command_timeout_ms: 10_000,
            poll_interval_ms: 2_000,
            join_timeout_ms: 2_000,
        }
    }
}

impl StreamConfig {
    /// `http://<host>:<port><path>`, keeping an explicit scheme if `host` has one
    pub fn stream_url(&self, host: &str, port: u16) -> String {
        let host = host.trim_end_matches('/');
        let base = if host.starts_with("http") {
            host.to_string()
        } else {
            format!("http://{}", host)
        };
        let path = if self.path.starts_with('/') || self.path.is_empty() {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("{}:{}{}", base, port, path)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl OutputConfig {
    pub fn geometry(&self) -> OutputGeometry {
        OutputGeometry {
            width: self.width,
            height: self.height,
            fps: self.fps,
            format: self.format,
        }
    }
}

impl BridgeConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Config {
    /// Defaults, overlaid by an optional TOML file, overlaid by
    /// `PHONECAM__<SECTION>__<KEY>` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("PHONECAM")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );
        Ok(builder.build()?.try_deserialize()?)
    }

    /// Publish this configuration as the process-wide active one.
    pub fn install(self) -> Arc<Self> {
        let config = Arc::new(self);
        CONFIG.store(config.clone());
        config
    }

    /// The active configuration (defaults until something is installed)
    pub fn current() -> Arc<Self> {
        CONFIG.load_full()
    }

    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let built = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?;
        Ok(built.try_deserialize()?)
    }
}
