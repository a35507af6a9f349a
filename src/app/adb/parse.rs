use std::collections::HashSet;

use crate::app::models::{Device, DeviceState};

/// Parses `adb devices [-l]` output. Every listed device is returned with its
/// state; duplicates of an id keep the first occurrence.
pub fn parse_adb_devices(output: &str) -> Vec<Device> {
    let mut seen = HashSet::new();
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with('*'))
        .filter(|line| !line.to_lowercase().contains("list of devices"))
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 2 {
                return None;
            }
            let id = tokens[0].to_string();
            if !seen.insert(id.clone()) {
                return None;
            }
            let mut device = Device {
                id,
                state: DeviceState::from_token(tokens[1]),
                architecture: None,
                model: None,
                product: None,
                transport_id: None,
            };
            for token in tokens.iter().skip(2) {
                if let Some(value) = token.strip_prefix("model:") {
                    device.model = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("product:") {
                    device.product = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("transport_id:") {
                    device.transport_id = Some(value.to_string());
                }
            }
            Some(device)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectStatus {
    Connected { message: String },
    Failed { reason: String },
}

/// `adb connect` reports most failures on stdout with exit code 0, so the
/// text is classified against known failure prefixes. This is brittle across
/// adb versions; the prefixes are configurable for that reason.
pub fn classify_connect_output(
    stdout: &str,
    stderr: &str,
    exit_code: Option<i32>,
    failure_prefixes: &[String],
) -> ConnectStatus {
    let message = stdout.trim();
    let lowered = message.to_lowercase();
    if let Some(prefix) = failure_prefixes
        .iter()
        .find(|prefix| lowered.starts_with(prefix.as_str()))
    {
        return ConnectStatus::Failed {
            reason: if message.is_empty() {
                prefix.clone()
            } else {
                message.to_string()
            },
        };
    }
    if exit_code != Some(0) {
        let detail = if stderr.trim().is_empty() {
            message
        } else {
            stderr.trim()
        };
        return ConnectStatus::Failed {
            reason: format!("adb connect exited with {exit_code:?}: {detail}"),
        };
    }
    ConnectStatus::Connected {
        message: message.to_string(),
    }
}

/// First non-empty line of a `getprop <key>` call.
pub fn parse_getprop_value(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// `pidof` prints space separated pids; the first one is the main process.
pub fn parse_pidof(output: &str) -> Option<u32> {
    output
        .split_whitespace()
        .next()
        .and_then(|token| token.parse::<u32>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn online_ids(output: &str) -> Vec<String> {
        parse_adb_devices(output)
            .into_iter()
            .filter(Device::is_online)
            .map(|device| device.id)
            .collect()
    }

    #[test]
    fn only_device_state_counts_as_connected() {
        let output = "emulator-5554\tdevice\nemulator-5556\toffline\n";
        assert_eq!(online_ids(output), vec!["emulator-5554".to_string()]);
    }

    #[test]
    fn parses_long_listing() {
        let output = "List of devices attached\n0123456789ABCDEF device product:sdk_gphone64_arm64 model:Pixel_7 device:emu64a transport_id:1\nemulator-5554 unauthorized transport_id:2\n";
        let parsed = parse_adb_devices(output);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].id, "0123456789ABCDEF");
        assert_eq!(parsed[0].state, DeviceState::Online);
        assert_eq!(parsed[0].model.as_deref(), Some("Pixel_7"));
        assert_eq!(parsed[0].transport_id.as_deref(), Some("1"));
        assert_eq!(parsed[1].state, DeviceState::Unauthorized);
        assert_eq!(online_ids(output), vec!["0123456789ABCDEF".to_string()]);
    }

    #[test]
    fn ignores_daemon_banner_and_duplicates() {
        let output = "* daemon not running; starting now at tcp:5037\n* daemon started successfully\nList of devices attached\nA device\nA offline\n\n";
        let parsed = parse_adb_devices(output);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].state, DeviceState::Online);
    }

    fn prefixes() -> Vec<String> {
        vec!["failed to connect".to_string(), "cannot connect".to_string()]
    }

    #[test]
    fn connect_failure_text_with_zero_exit_is_failure() {
        let status = classify_connect_output(
            "failed to connect to '10.0.0.5:5555': Connection refused\n",
            "",
            Some(0),
            &prefixes(),
        );
        assert!(matches!(status, ConnectStatus::Failed { ref reason } if reason.contains("Connection refused")));

        let status = classify_connect_output("Cannot connect to 10.0.0.5:5555", "", Some(0), &prefixes());
        assert!(matches!(status, ConnectStatus::Failed { .. }));
    }

    #[test]
    fn connect_success_and_nonzero_exit() {
        let status = classify_connect_output("connected to 10.0.0.5:5555\n", "", Some(0), &prefixes());
        assert_eq!(
            status,
            ConnectStatus::Connected {
                message: "connected to 10.0.0.5:5555".to_string()
            }
        );
        let status = classify_connect_output("", "error: no host\n", Some(1), &prefixes());
        assert!(matches!(status, ConnectStatus::Failed { ref reason } if reason.contains("no host")));
    }

    #[test]
    fn parses_getprop_and_pidof() {
        assert_eq!(parse_getprop_value("\narm64-v8a\r\n").as_deref(), Some("arm64-v8a"));
        assert_eq!(parse_getprop_value("   \n"), None);
        assert_eq!(parse_pidof("4321 4400\n"), Some(4321));
        assert_eq!(parse_pidof(""), None);
    }
}
