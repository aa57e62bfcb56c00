//! Service configuration
//!
//! Loaded through `common::config_loader` (defaults, YAML file, `BMSSRV_`
//! environment overrides) and checked once at startup by [`BmsConfig::validate`].

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::battery::controller::TargetMode;
use crate::error::{BmsError, Result};

/// Environment variable prefix for overrides, e.g. `BMSSRV_SERVICE__LOG_LEVEL`
pub const ENV_PREFIX: &str = "BMSSRV_";

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "BMSSRV_CONFIG";

/// Config file used when neither CLI nor environment name one
pub const DEFAULT_CONFIG_PATH: &str = "config/bmssrv.yaml";

/// Highest rack number of a cluster
pub const MAX_RACKS: u8 = 5;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BmsConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub bridges: Vec<BridgeConfig>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory for daily rolling log files; console only when unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub log_json: bool,
    /// Period of the device snapshot summary log, 0 disables it
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_dir: None,
            log_json: false,
            status_interval_secs: default_status_interval(),
        }
    }
}

fn default_service_name() -> String {
    "bmssrv".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_status_interval() -> u64 {
    60
}

/// Serial parity
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Physical link of one bus
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    Tcp {
        host: String,
        #[serde(default = "default_tcp_port")]
        port: u16,
    },
    Rtu {
        port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
        #[serde(default)]
        parity: Parity,
    },
}

fn default_tcp_port() -> u16 {
    502
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

/// One Modbus bus with its cycle parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    pub id: String,
    pub transport: TransportConfig,
    #[serde(default = "default_cycle_time")]
    pub cycle_time_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// LOW priority read tasks executed per cycle
    #[serde(default = "default_low_tasks")]
    pub low_tasks_per_cycle: usize,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl BridgeConfig {
    pub fn cycle_time(&self) -> Duration {
        Duration::from_millis(self.cycle_time_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_cycle_time() -> u64 {
    1000
}

fn default_request_timeout() -> u64 {
    500
}

fn default_connect_timeout() -> u64 {
    3000
}

fn default_low_tasks() -> usize {
    1
}

/// Backoff between connection attempts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff")]
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff(),
        }
    }
}

fn default_initial_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    60_000
}

fn default_backoff() -> f64 {
    2.0
}

/// Battery model family
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    SingleRack,
    Cluster,
}

/// One battery device on a bridge
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub id: String,
    /// Id of the bridge the device is polled on
    pub bridge: String,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    pub kind: DeviceKind,
    /// Racks in use (cluster only), numbered from 1
    #[serde(default)]
    pub racks: Vec<u8>,
    #[serde(default)]
    pub target_mode: TargetMode,
    #[serde(default)]
    pub state_machine: StateMachineTimings,
}

fn default_unit_id() -> u8 {
    1
}

/// Start/stop timing, all in seconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateMachineTimings {
    #[serde(default = "default_max_start_time")]
    pub max_start_time: u64,
    #[serde(default = "default_max_start_attempts")]
    pub max_start_attempts: u32,
    #[serde(default = "default_error_level2_delay")]
    pub error_level2_delay: u64,
    #[serde(default = "default_start_unsuccessful_delay")]
    pub start_unsuccessful_delay: u64,
    #[serde(default = "default_pending_tolerance")]
    pub pending_tolerance: u64,
}

impl Default for StateMachineTimings {
    fn default() -> Self {
        Self {
            max_start_time: default_max_start_time(),
            max_start_attempts: default_max_start_attempts(),
            error_level2_delay: default_error_level2_delay(),
            start_unsuccessful_delay: default_start_unsuccessful_delay(),
            pending_tolerance: default_pending_tolerance(),
        }
    }
}

fn default_max_start_time() -> u64 {
    30
}

fn default_max_start_attempts() -> u32 {
    5
}

fn default_error_level2_delay() -> u64 {
    600
}

fn default_start_unsuccessful_delay() -> u64 {
    3600
}

fn default_pending_tolerance() -> u64 {
    15
}

impl BmsConfig {
    /// Check cross references and ranges; errors here are fatal at startup
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(BmsError::config("No devices configured"));
        }

        let mut bridge_ids = HashSet::new();
        for bridge in &self.bridges {
            if !bridge_ids.insert(bridge.id.as_str()) {
                return Err(BmsError::config(format!(
                    "Duplicate bridge id: {}",
                    bridge.id
                )));
            }
            bridge.validate()?;
        }

        let mut device_ids = HashSet::new();
        let mut addresses = HashSet::new();
        for device in &self.devices {
            if !device_ids.insert(device.id.as_str()) {
                return Err(BmsError::config(format!(
                    "Duplicate device id: {}",
                    device.id
                )));
            }
            if !bridge_ids.contains(device.bridge.as_str()) {
                return Err(BmsError::config(format!(
                    "Device {} references unknown bridge {}",
                    device.id, device.bridge
                )));
            }
            if !addresses.insert((device.bridge.as_str(), device.unit_id)) {
                return Err(BmsError::config(format!(
                    "Device {}: unit id {} already used on bridge {}",
                    device.id, device.unit_id, device.bridge
                )));
            }
            device.validate()?;
        }

        Ok(())
    }
}

impl BridgeConfig {
    fn validate(&self) -> Result<()> {
        let invalid = |what: &str| {
            Err(BmsError::config(format!("Bridge {}: {}", self.id, what)))
        };
        if self.id.is_empty() {
            return Err(BmsError::config("Bridge id must not be empty"));
        }
        if self.cycle_time_ms == 0 {
            return invalid("cycle_time_ms must be greater than 0");
        }
        if self.request_timeout_ms == 0 {
            return invalid("request_timeout_ms must be greater than 0");
        }
        if self.connect_timeout_ms == 0 {
            return invalid("connect_timeout_ms must be greater than 0");
        }
        if self.low_tasks_per_cycle == 0 {
            return invalid("low_tasks_per_cycle must be at least 1");
        }
        if self.reconnect.initial_delay_ms == 0
            || self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms
        {
            return invalid("reconnect delays must satisfy 0 < initial_delay_ms <= max_delay_ms");
        }
        if self.reconnect.backoff_multiplier.is_nan() || self.reconnect.backoff_multiplier < 1.0 {
            return invalid("reconnect.backoff_multiplier must be at least 1.0");
        }
        match &self.transport {
            TransportConfig::Tcp { host, .. } if host.is_empty() => invalid("tcp host is empty"),
            TransportConfig::Rtu {
                port,
                baud_rate,
                data_bits,
                stop_bits,
                ..
            } => {
                if port.is_empty() {
                    invalid("rtu port is empty")
                } else if *baud_rate == 0 {
                    invalid("rtu baud_rate must be greater than 0")
                } else if !(5..=8).contains(data_bits) {
                    invalid("rtu data_bits must be 5..=8")
                } else if !(1..=2).contains(stop_bits) {
                    invalid("rtu stop_bits must be 1 or 2")
                } else {
                    Ok(())
                }
            },
            _ => Ok(()),
        }
    }
}

impl DeviceConfig {
    fn validate(&self) -> Result<()> {
        let invalid = |what: String| Err(BmsError::config(format!("Device {}: {}", self.id, what)));

        if !(1..=247).contains(&self.unit_id) {
            return invalid(format!("unit_id {} not in 1..=247", self.unit_id));
        }

        match self.kind {
            DeviceKind::Cluster => {
                if self.racks.is_empty() {
                    return invalid("a cluster needs at least one rack in use".to_string());
                }
                let mut seen = HashSet::new();
                for &rack in &self.racks {
                    if !(1..=MAX_RACKS).contains(&rack) {
                        return invalid(format!("rack {} not in 1..={}", rack, MAX_RACKS));
                    }
                    if !seen.insert(rack) {
                        return invalid(format!("rack {} listed twice", rack));
                    }
                }
            },
            DeviceKind::SingleRack => {
                if !self.racks.is_empty() {
                    return invalid("racks only apply to clusters".to_string());
                }
            },
        }

        let t = &self.state_machine;
        if t.max_start_time == 0
            || t.max_start_attempts == 0
            || t.error_level2_delay == 0
            || t.start_unsuccessful_delay == 0
            || t.pending_tolerance == 0
        {
            return invalid("state machine timings must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
service:
  name: bmssrv
  log_level: debug
bridges:
  - id: bus0
    transport:
      type: tcp
      host: 192.168.1.50
    cycle_time_ms: 500
devices:
  - id: battery0
    bridge: bus0
    kind: cluster
    racks: [1, 2, 3]
    state_machine:
      max_start_time: 10
  - id: battery1
    bridge: bus0
    unit_id: 2
    kind: single_rack
    target_mode: force_off
"#;

    fn sample() -> BmsConfig {
        serde_yaml::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_parse_sample_with_defaults() {
        let config = sample();
        config.validate().unwrap();

        let bridge = &config.bridges[0];
        assert_eq!(
            bridge.transport,
            TransportConfig::Tcp {
                host: "192.168.1.50".to_string(),
                port: 502
            }
        );
        assert_eq!(bridge.cycle_time(), Duration::from_millis(500));
        assert_eq!(bridge.request_timeout_ms, 500);
        assert_eq!(bridge.low_tasks_per_cycle, 1);

        let cluster = &config.devices[0];
        assert_eq!(cluster.unit_id, 1);
        assert_eq!(cluster.state_machine.max_start_time, 10);
        assert_eq!(cluster.state_machine.max_start_attempts, 5);
        assert_eq!(cluster.target_mode, TargetMode::Default);
        assert_eq!(config.devices[1].target_mode, TargetMode::ForceOff);
    }

    #[test]
    fn test_rtu_transport_parses() {
        let yaml = "type: rtu\nport: /dev/ttyUSB0\nparity: even\n";
        let transport: TransportConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            transport,
            TransportConfig::Rtu {
                port: "/dev/ttyUSB0".to_string(),
                baud_rate: 9600,
                data_bits: 8,
                stop_bits: 1,
                parity: Parity::Even,
            }
        );
    }

    #[test]
    fn test_unknown_bridge_rejected() {
        let mut config = sample();
        config.devices[1].bridge = "bus9".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown bridge bus9"));
    }

    #[test]
    fn test_rack_range_checked() {
        let mut config = sample();
        config.devices[0].racks = vec![1, 6];
        assert!(config.validate().is_err());

        config.devices[0].racks = vec![2, 2];
        assert!(config.validate().is_err());

        config.devices[0].racks.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timings_rejected() {
        let mut config = sample();
        config.devices[1].state_machine.pending_tolerance = 0;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.bridges[0].cycle_time_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_unit_on_bridge_rejected() {
        let mut config = sample();
        config.devices[1].unit_id = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_config_rejected() {
        assert!(BmsConfig::default().validate().is_err());
    }
}
