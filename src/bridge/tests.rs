use std::time::Duration;

use super::*;

const HEADER: &str = "List of devices attached";

/// Answers bridge commands from a mutable script and records every call.
#[derive(Default)]
struct ScriptedRunner {
    devices: Mutex<String>,
    fail_forward: bool,
    fail_remove: bool,
    route: Option<String>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    fn with_devices(lines: &[&str]) -> Self {
        let runner = Self::default();
        runner.set_devices(lines);
        runner
    }

    fn set_devices(&self, lines: &[&str]) {
        let mut out = String::from(HEADER);
        for line in lines {
            out.push('\n');
            out.push_str(line);
        }
        *self.devices.lock().unwrap() = out;
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, args: &[&str]) -> Result<String, BridgeError> {
        let line = args.join(" ");
        self.calls.lock().unwrap().push(line.clone());
        let failed = || BridgeError::NonZeroExit {
            code: Some(1),
            stderr: "error: no devices/emulators found".into(),
        };
        match args {
            ["version"] => Ok("Android Debug Bridge version 1.0.41".into()),
            ["devices", "-l"] => Ok(self.devices.lock().unwrap().clone()),
            [.., "forward", "--remove", _] | ["forward", "--remove-all"] if self.fail_remove => {
                Err(failed())
            }
            [.., "forward", "--remove", _] | ["forward", "--remove-all"] => Ok(String::new()),
            [.., "forward", _, _] if self.fail_forward => Err(failed()),
            [.., "forward", _, _] => Ok(String::new()),
            [.., "shell", "ip", "route", "get", "1"] => self.route.clone().ok_or_else(failed),
            _ => Err(BridgeError::NonZeroExit {
                code: Some(1),
                stderr: format!("unknown command: {}", line),
            }),
        }
    }
}

fn bridge(
    runner: ScriptedRunner,
) -> (DeviceBridge, Arc<ScriptedRunner>, flume::Receiver<Vec<AndroidDevice>>) {
    let runner = Arc::new(runner);
    let (tx, rx) = flume::unbounded();
    let config = BridgeConfig {
        poll_interval_ms: 10,
        ..BridgeConfig::default()
    };
    let bridge = DeviceBridge::with_runner(runner.clone(), config, Arc::new(tx));
    (bridge, runner, rx)
}

// ── Enumeration and availability ─────────────────────────────────

#[test]
fn available_when_version_answers() {
    let (bridge, _, _) = bridge(ScriptedRunner::default());
    assert!(bridge.is_available());
}

#[test]
fn missing_tool_is_unavailable_and_enumerates_nothing() {
    struct Missing;
    impl CommandRunner for Missing {
        fn run(&self, _args: &[&str]) -> Result<String, BridgeError> {
            Err(BridgeError::ToolMissing("adb".into()))
        }
    }
    let bridge = DeviceBridge::with_runner(
        Arc::new(Missing),
        BridgeConfig::default(),
        Arc::new(flume::unbounded::<Vec<AndroidDevice>>().0),
    );
    assert!(!bridge.is_available());
    assert!(bridge.get_devices().is_empty());
    assert!(bridge.get_device_ip(None).is_none());
    assert!(matches!(
        bridge.start_port_forwarding(None, 8080, 8080),
        Err(BridgeError::ToolMissing(_))
    ));
    assert!(!bridge.is_forwarding());
}

#[test]
fn get_devices_parses_listing() {
    let (bridge, _, _) = bridge(ScriptedRunner::with_devices(&[
        "ABC123 device model:Pixel6 product:raven",
        "DEF456 offline",
    ]));
    let devices = bridge.get_devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].serial, "ABC123");
    assert_eq!(devices[0].product.as_deref(), Some("raven"));
}

// ── Port forwarding ──────────────────────────────────────────────

#[test]
fn forwarding_resolves_requested_device() {
    let (bridge, runner, _) = bridge(ScriptedRunner::with_devices(&[
        "AAA device model:One",
        "BBB device model:Two",
    ]));
    let session = bridge.start_port_forwarding(Some("BBB"), 8080, 8081).unwrap();
    assert_eq!(session.device_serial(), Some("BBB"));
    assert!(bridge.is_forwarding());
    assert_eq!(bridge.connected_device().unwrap().model.as_deref(), Some("Two"));
    assert!(runner.calls().contains(&"-s BBB forward tcp:8080 tcp:8081".to_string()));
}

#[test]
fn forwarding_without_serial_picks_first_device() {
    let (bridge, runner, _) = bridge(ScriptedRunner::with_devices(&["AAA device", "BBB device"]));
    let session = bridge.start_port_forwarding(None, 8080, 8080).unwrap();
    assert_eq!(session.device_serial(), Some("AAA"));
    assert!(runner.calls().contains(&"forward tcp:8080 tcp:8080".to_string()));
}

#[test]
fn failed_forward_leaves_state_untouched() {
    let (bridge, _, _) = bridge(ScriptedRunner {
        fail_forward: true,
        ..ScriptedRunner::with_devices(&["AAA device"])
    });
    assert!(matches!(
        bridge.start_port_forwarding(None, 8080, 8080),
        Err(BridgeError::NonZeroExit { .. })
    ));
    assert!(!bridge.is_forwarding());
    assert!(bridge.connected_device().is_none());
}

#[test]
fn stop_all_clears_state_even_when_removal_fails() {
    let (bridge, _, _) = bridge(ScriptedRunner {
        fail_remove: true,
        ..ScriptedRunner::with_devices(&["AAA device"])
    });
    bridge.start_port_forwarding(None, 8080, 8080).unwrap();
    assert!(bridge.stop_all_forwarding().is_err());
    assert!(!bridge.is_forwarding());
    assert!(bridge.connected_device().is_none());

    bridge.start_port_forwarding(None, 8080, 8080).unwrap();
    assert!(bridge.stop_port_forwarding().is_err());
    assert!(!bridge.is_forwarding());
}

#[test]
fn new_session_on_another_port_removes_the_old_mapping() {
    let (bridge, runner, _) = bridge(ScriptedRunner::with_devices(&["AAA device"]));
    bridge.start_port_forwarding(None, 8080, 8080).unwrap();
    bridge.start_port_forwarding(None, 9090, 8080).unwrap();
    assert!(runner.calls().contains(&"forward --remove tcp:8080".to_string()));
    assert_eq!(bridge.session().unwrap().local_port, 9090);

    bridge.stop_port_forwarding().unwrap();
    assert!(runner.calls().contains(&"forward --remove tcp:9090".to_string()));
    assert!(bridge.session().is_none());
}

#[test]
fn device_ip_comes_from_route_src() {
    let (bridge, runner, _) = bridge(ScriptedRunner {
        route: Some("1.0.0.0 via 192.168.1.1 dev wlan0 src 192.168.1.100 uid 2000".into()),
        ..ScriptedRunner::default()
    });
    assert_eq!(
        bridge.get_device_ip(Some("AAA")),
        Some("192.168.1.100".parse().unwrap())
    );
    assert!(runner.calls().contains(&"-s AAA shell ip route get 1".to_string()));
}

// ── Device monitor ───────────────────────────────────────────────

fn expect_change(rx: &flume::Receiver<Vec<AndroidDevice>>) -> Vec<AndroidDevice> {
    rx.recv_timeout(Duration::from_secs(5))
        .expect("timed out waiting for device change")
}

fn expect_quiet(rx: &flume::Receiver<Vec<AndroidDevice>>) {
    // several poll intervals without a callback
    assert!(rx.recv_timeout(Duration::from_millis(80)).is_err());
}

#[test]
fn monitor_fires_only_when_the_serial_set_changes() {
    let (bridge, runner, rx) = bridge(ScriptedRunner::with_devices(&["AAA device", "BBB device"]));
    bridge.start_device_monitor().unwrap();
    assert!(bridge.is_monitoring());

    let first = expect_change(&rx);
    assert_eq!(first.len(), 2);

    // reorder and change non-serial fields: same set
    runner.set_devices(&["BBB unauthorized model:Pixel", "AAA device"]);
    expect_quiet(&rx);

    runner.set_devices(&["AAA device"]);
    let removed = expect_change(&rx);
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].serial, "AAA");

    runner.set_devices(&["AAA device", "CCC device"]);
    assert_eq!(expect_change(&rx).len(), 2);

    bridge.stop_device_monitor();
    assert!(!bridge.is_monitoring());
    runner.set_devices(&[]);
    expect_quiet(&rx);
}

#[test]
fn empty_device_set_does_not_fire_initially() {
    let (bridge, _, rx) = bridge(ScriptedRunner::with_devices(&[]));
    bridge.start_device_monitor().unwrap();
    expect_quiet(&rx);
    bridge.stop_device_monitor();
}

#[test]
fn monitor_start_is_idempotent() {
    let (bridge, runner, rx) = bridge(ScriptedRunner::with_devices(&["AAA device"]));
    bridge.start_device_monitor().unwrap();
    bridge.start_device_monitor().unwrap();
    expect_change(&rx);
    expect_quiet(&rx);
    bridge.stop_device_monitor();
    bridge.stop_device_monitor();
    let polls = runner.calls().len();
    std::thread::sleep(Duration::from_millis(40));
    assert_eq!(runner.calls().len(), polls);
}
