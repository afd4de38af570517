use std::net::IpAddr;

use serde::Serialize;

/// One attached device as reported by `devices -l`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AndroidDevice {
    pub serial: String,
    pub state: String,
    pub model: Option<String>,
    pub product: Option<String>,
}

/// Parse `devices -l` output. The first line is a header; offline devices are
/// skipped.
///
/// ```text
/// List of devices attached
/// ABC123         device usb:1-1 product:raven model:Pixel_6 device:raven transport_id:1
/// ```
pub fn parse_devices(output: &str) -> Vec<AndroidDevice> {
    output
        .lines()
        .skip(1)
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.contains("offline"))
        .filter_map(parse_device_line)
        .collect()
}

fn parse_device_line(line: &str) -> Option<AndroidDevice> {
    let mut parts = line.split_whitespace();
    let serial = parts.next()?;
    let state = parts.next()?;

    let mut device = AndroidDevice {
        serial: serial.to_string(),
        state: state.to_string(),
        model: None,
        product: None,
    };
    for part in parts {
        if let Some(model) = part.strip_prefix("model:") {
            device.model = Some(model.to_string());
        } else if let Some(product) = part.strip_prefix("product:") {
            device.product = Some(product.to_string());
        }
    }
    Some(device)
}

/// Pull the `src <ip>` token out of `ip route get 1` output.
///
/// `1.0.0.0 via 192.168.1.1 dev wlan0 src 192.168.1.100 uid 0`
pub fn parse_route_src(output: &str) -> Option<IpAddr> {
    let mut tokens = output.split_whitespace();
    tokens.find(|t| *t == "src")?;
    tokens.next()?.parse().ok()
}
