//! Phonecam relay: phone MJPEG stream to a virtual camera

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tracing::{error, info, warn};

use phonecam::{
    AndroidDevice, Config, DeviceBridge, DeviceListener, Frame, IngestKind, ReceiverListener,
    StatusChange, StreamReceiver, VirtualOutput,
};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Forwards every decoded frame to the virtual camera
struct RelayListener {
    output: Option<Arc<VirtualOutput>>,
}

impl ReceiverListener for RelayListener {
    fn on_status(&self, change: &StatusChange) {
        match &change.message {
            Some(message) => info!(status = %change.status, "{}", message),
            None => info!(status = %change.status, "status changed"),
        }
    }

    fn on_frame(&self, frame: &Arc<Frame>) {
        if let Some(output) = &self.output {
            output.send_frame(frame);
        }
    }
}

struct LogDevices;

impl DeviceListener for LogDevices {
    fn on_devices_changed(&self, devices: &[AndroidDevice]) {
        let serials: Vec<&str> = devices.iter().map(|d| d.serial.as_str()).collect();
        info!(?serials, "USB devices changed");
    }
}

fn build_receiver(config: &Config, listener: Arc<dyn ReceiverListener>) -> Result<StreamReceiver> {
    let stream = config.stream.clone();
    let receiver = match stream.ingest {
        IngestKind::Raw => StreamReceiver::http(stream, listener),
        IngestKind::Capture => StreamReceiver::capture(stream, listener),
        #[cfg(feature = "gstreamer-pipeline")]
        IngestKind::Gstreamer => {
            let backend = phonecam::capture::GstCaptureBackend::new(&stream)?;
            StreamReceiver::new(phonecam::Ingest::Capture(Arc::new(backend)), stream, listener)
        }
        #[cfg(not(feature = "gstreamer-pipeline"))]
        IngestKind::Gstreamer => {
            return Err(eyre!("built without the gstreamer-pipeline feature"));
        }
    };
    Ok(receiver)
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "phonecam=info".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Phonecam relay launching...");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    Config::load(config_path.as_deref())?.install();
    let config = Config::current();

    // USB forwarding, if requested
    let bridge = if config.bridge.use_usb {
        let bridge = DeviceBridge::new(config.bridge.clone(), Arc::new(LogDevices));
        if !bridge.is_available() {
            return Err(eyre!("'{}' not found or not answering", config.bridge.tool));
        }
        bridge.start_port_forwarding(
            config.bridge.device_serial.as_deref(),
            config.bridge.local_port,
            config.bridge.remote_port,
        )?;
        bridge.start_device_monitor()?;
        Some(bridge)
    } else {
        None
    };

    // Virtual camera
    let output = if config.output.enabled {
        let output = Arc::new(VirtualOutput::loopback(&config.output));
        match output.start(config.output.width, config.output.height, config.output.fps) {
            Ok(()) => Some(output),
            Err(e) => {
                warn!("Virtual camera unavailable, continuing without it: {}", e);
                None
            }
        }
    } else {
        None
    };

    let listener = Arc::new(RelayListener {
        output: output.clone(),
    });

    let (host, port) = match &bridge {
        Some(_) => ("127.0.0.1".to_string(), config.bridge.local_port),
        None => (config.stream.host.clone(), config.stream.port),
    };

    let mut receiver = build_receiver(&config, listener)?;
    receiver.connect(&host, port);

    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = receiver.stats();
                info!(
                    status = %receiver.status(),
                    fps = stats.fps,
                    frames = stats.frame_count,
                    bytes = stats.bytes_received,
                    latency_ms = stats.latency_ms,
                    "stream stats"
                );
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
        }
    }

    info!("Phonecam relay shutting down");
    receiver.disconnect();
    if let Some(output) = output {
        output.stop();
    }
    if let Some(bridge) = bridge {
        bridge.stop_device_monitor();
        if let Err(e) = bridge.stop_all_forwarding() {
            warn!("Failed to remove port forwarding: {}", e);
        }
    }
    Ok(())
}
