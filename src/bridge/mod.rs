//! USB bridge: device discovery, port forwarding and device-set monitoring
//!
//! Every tool invocation is bounded by the configured timeout. Queries whose
//! callers only care about presence (`get_devices`, `get_device_ip`,
//! `is_available`) fold failures into empty results; state-changing calls
//! return the typed failure.

pub mod command;
pub mod device;

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::error::BridgeError;
use crate::pipeline::Worker;
use crate::BridgeConfig;

pub use command::{CommandRunner, ToolCommand};
pub use device::{parse_devices, parse_route_src, AndroidDevice};

pub const DEFAULT_LOCAL_PORT: u16 = 8080;
pub const DEFAULT_REMOTE_PORT: u16 = 8080;

/// Receives the full device list whenever the set of serials changes
pub trait DeviceListener: Send + Sync {
    fn on_devices_changed(&self, devices: &[AndroidDevice]);
}

impl DeviceListener for flume::Sender<Vec<AndroidDevice>> {
    fn on_devices_changed(&self, devices: &[AndroidDevice]) {
        let _ = self.send(devices.to_vec());
    }
}

/// The single active local↔remote mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortForwardSession {
    pub local_port: u16,
    pub remote_port: u16,
    /// Device the mapping resolved to, if it could be enumerated
    pub device: Option<AndroidDevice>,
}

impl PortForwardSession {
    pub fn device_serial(&self) -> Option<&str> {
        self.device.as_ref().map(|d| d.serial.as_str())
    }
}

pub struct DeviceBridge {
    runner: Arc<dyn CommandRunner>,
    config: BridgeConfig,
    listener: Arc<dyn DeviceListener>,
    session: Mutex<Option<PortForwardSession>>,
    monitor: Mutex<Option<Worker>>,
}

impl DeviceBridge {
    pub fn new(config: BridgeConfig, listener: Arc<dyn DeviceListener>) -> Self {
        let runner = Arc::new(ToolCommand::new(config.tool.clone(), config.command_timeout()));
        Self::with_runner(runner, config, listener)
    }

    pub fn with_runner(
        runner: Arc<dyn CommandRunner>,
        config: BridgeConfig,
        listener: Arc<dyn DeviceListener>,
    ) -> Self {
        Self {
            runner,
            config,
            listener,
            session: Mutex::new(None),
            monitor: Mutex::new(None),
        }
    }

    fn session_lock(&self) -> MutexGuard<'_, Option<PortForwardSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn monitor_lock(&self) -> MutexGuard<'_, Option<Worker>> {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True iff the tool answers a version query.
    pub fn is_available(&self) -> bool {
        self.runner.run(&["version"]).is_ok()
    }

    pub fn is_forwarding(&self) -> bool {
        self.session_lock().is_some()
    }

    pub fn connected_device(&self) -> Option<AndroidDevice> {
        self.session_lock().as_ref().and_then(|s| s.device.clone())
    }

    pub fn session(&self) -> Option<PortForwardSession> {
        self.session_lock().clone()
    }

    /// Attached devices, offline ones excluded. Empty on any failure.
    pub fn get_devices(&self) -> Vec<AndroidDevice> {
        enumerate(self.runner.as_ref())
    }

    /// Forward `tcp:<local_port>` to `tcp:<remote_port>` on the device.
    ///
    /// Replaces any previous mapping held by this bridge. The connected device
    /// resolves to `device_serial` if given, otherwise the first enumerated one.
    #[instrument(skip(self))]
    pub fn start_port_forwarding(
        &self,
        device_serial: Option<&str>,
        local_port: u16,
        remote_port: u16,
    ) -> Result<PortForwardSession, BridgeError> {
        let previous = self.session_lock().as_ref().map(|s| s.local_port);
        if let Some(previous) = previous.filter(|p| *p != local_port) {
            if let Err(e) = self.remove_forward(previous) {
                debug!(port = previous, "removing previous forward failed: {}", e);
            }
        }

        let local = format!("tcp:{}", local_port);
        let remote = format!("tcp:{}", remote_port);
        let mut args = Vec::with_capacity(5);
        if let Some(serial) = device_serial {
            args.extend(["-s", serial]);
        }
        args.extend(["forward", local.as_str(), remote.as_str()]);

        if let Err(e) = self.runner.run(&args) {
            warn!("port forwarding failed: {}", e);
            return Err(e);
        }

        let devices = self.get_devices();
        let device = match device_serial {
            Some(serial) => devices.into_iter().find(|d| d.serial == serial),
            None => devices.into_iter().next(),
        };

        let session = PortForwardSession {
            local_port,
            remote_port,
            device,
        };
        info!(
            local_port,
            remote_port,
            device = ?session.device_serial(),
            "USB port forwarding established"
        );
        *self.session_lock() = Some(session.clone());
        Ok(session)
    }

    fn remove_forward(&self, local_port: u16) -> Result<String, BridgeError> {
        self.runner
            .run(&["forward", "--remove", &format!("tcp:{}", local_port)])
    }

    /// Remove the active mapping (the configured local port if none is held).
    /// Local state is cleared even if the tool reports a failure.
    pub fn stop_port_forwarding(&self) -> Result<(), BridgeError> {
        let session = self.session_lock().take();
        let local_port = session.map_or(self.config.local_port, |s| s.local_port);
        let result = self.remove_forward(local_port);
        if let Err(e) = &result {
            debug!(local_port, "forward removal failed: {}", e);
        }
        result.map(|_| ())
    }

    /// Remove every mapping. Local state is cleared even if the tool fails.
    pub fn stop_all_forwarding(&self) -> Result<(), BridgeError> {
        let result = self.runner.run(&["forward", "--remove-all"]);
        self.session_lock().take();
        if let Err(e) = &result {
            debug!("forward removal failed: {}", e);
        }
        result.map(|_| ())
    }

    /// Outbound IP of the device, from its routing table.
    pub fn get_device_ip(&self, device_serial: Option<&str>) -> Option<IpAddr> {
        let mut args = Vec::with_capacity(7);
        if let Some(serial) = device_serial {
            args.extend(["-s", serial]);
        }
        args.extend(["shell", "ip", "route", "get", "1"]);
        match self.runner.run(&args) {
            Ok(output) => parse_route_src(&output),
            Err(e) => {
                debug!("device IP lookup failed: {}", e);
                None
            }
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor_lock()
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    /// Poll the device list in the background. No-op if already running.
    pub fn start_device_monitor(&self) -> Result<(), BridgeError> {
        let mut monitor = self.monitor_lock();
        if monitor.as_ref().is_some_and(|worker| !worker.is_finished()) {
            return Ok(());
        }

        let runner = self.runner.clone();
        let listener = self.listener.clone();
        let interval = self.config.poll_interval();
        let worker = Worker::spawn("phonecam-device-monitor", move |shutdown| {
            info!(?interval, "Device monitor started");
            let mut last: HashSet<String> = HashSet::new();
            loop {
                let devices = enumerate(runner.as_ref());
                let current: HashSet<String> = devices.iter().map(|d| d.serial.clone()).collect();
                if shutdown.is_requested() {
                    break;
                }
                if current != last {
                    debug!(count = devices.len(), "device set changed");
                    last = current;
                    listener.on_devices_changed(&devices);
                }
                if shutdown.wait(interval) {
                    break;
                }
            }
            info!("Device monitor stopped");
        })?;
        *monitor = Some(worker);
        Ok(())
    }

    pub fn stop_device_monitor(&self) {
        let worker = self.monitor_lock().take();
        if let Some(worker) = worker {
            worker.stop(self.config.join_timeout());
        }
    }
}

impl Drop for DeviceBridge {
    fn drop(&mut self) {
        self.stop_device_monitor();
    }
}

fn enumerate(runner: &dyn CommandRunner) -> Vec<AndroidDevice> {
    match runner.run(&["devices", "-l"]) {
        Ok(output) => parse_devices(&output),
        Err(e) => {
            debug!("device enumeration failed: {}", e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests;
