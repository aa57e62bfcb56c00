//! Runtime lifecycle management
//!
//! Builds bridges and devices from the validated configuration, spawns one
//! tokio task per bus and joins them on shutdown.

use std::collections::HashMap;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::bridge::Bridge;
use crate::battery::device::{Device, DeviceHandle};
use crate::core::config::{BmsConfig, BridgeConfig};
use crate::error::{BmsError, Result};
use crate::protocols::modbus::connection::{ModbusClient, ModbusTransport};

/// Build every bridge with its devices
///
/// Transports are created by `make_transport` from each bridge config; the
/// connection itself is made lazily by the first cycle.
///
/// # Returns
///
/// * `Ok((bridges, handles))` - Bridges in config order and one handle per device
/// * `Err(error)` - A device definition is invalid or references an unknown bridge
pub fn build_bridges<T, F>(
    config: &BmsConfig,
    mut make_transport: F,
) -> Result<(Vec<Bridge<T>>, Vec<DeviceHandle>)>
where
    T: ModbusTransport,
    F: FnMut(&BridgeConfig) -> T,
{
    let mut bridges: Vec<Bridge<T>> = config
        .bridges
        .iter()
        .map(|b| Bridge::new(b, make_transport(b)))
        .collect();
    let index: HashMap<String, usize> = bridges
        .iter()
        .enumerate()
        .map(|(i, b)| (b.id().to_string(), i))
        .collect();

    let mut handles = Vec::with_capacity(config.devices.len());
    for device_config in &config.devices {
        let bridge = index.get(&device_config.bridge).copied().ok_or_else(|| {
            BmsError::config(format!(
                "Device {} references unknown bridge {}",
                device_config.id, device_config.bridge
            ))
        })?;
        let (device, handle) = Device::new(device_config)?;
        bridges[bridge].add_device(device);
        handles.push(handle);
    }

    Ok((bridges, handles))
}

/// Build bridges over real TCP/RTU clients
pub fn build_modbus_bridges(
    config: &BmsConfig,
) -> Result<(Vec<Bridge<ModbusClient>>, Vec<DeviceHandle>)> {
    build_bridges(config, |b| {
        ModbusClient::new(b.transport.clone(), b.connect_timeout())
    })
}

/// Spawn one task per bridge; buses run independently of each other
pub fn spawn_bridges<T>(bridges: Vec<Bridge<T>>, cancel: &CancellationToken) -> Vec<JoinHandle<()>>
where
    T: ModbusTransport + 'static,
{
    bridges
        .into_iter()
        .filter(|b| {
            if b.devices().is_empty() {
                info!("Bridge {} has no devices, not started", b.id());
                false
            } else {
                true
            }
        })
        .map(|bridge| tokio::spawn(bridge.run(cancel.child_token())))
        .collect()
}

/// Wait for every bridge task to finish
pub async fn join_bridges(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        join_task("Bridge", handle).await;
    }
    info!("All bridges stopped");
}

/// Await a service task; a panic or abort is logged, false if it did not finish cleanly
pub async fn join_task(name: &str, handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            error!("{} task failed: {}", name, e);
            false
        },
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::config::TransportConfig;
    use tracing_test::traced_test;

    const CONFIG: &str = r#"
bridges:
  - id: bus0
    transport:
      type: tcp
      host: 127.0.0.1
      port: 1
  - id: bus1
    transport:
      type: tcp
      host: 127.0.0.1
      port: 2
devices:
  - id: rack
    bridge: bus0
    kind: single_rack
  - id: cluster
    bridge: bus0
    unit_id: 2
    kind: cluster
    racks: [1, 2]
"#;

    #[test]
    fn test_devices_attached_to_their_bridge() {
        let config: BmsConfig = serde_yaml::from_str(CONFIG).unwrap();
        config.validate().unwrap();

        let (bridges, handles) = build_modbus_bridges(&config).unwrap();
        assert_eq!(bridges.len(), 2);
        assert_eq!(bridges[0].devices().len(), 2);
        assert!(bridges[1].devices().is_empty());
        assert_eq!(
            handles.iter().map(|h| h.id()).collect::<Vec<_>>(),
            vec!["rack", "cluster"]
        );
        assert_eq!(bridges[0].transport().describe(), "tcp://127.0.0.1:1");
    }

    #[test]
    fn test_unknown_bridge_is_an_error() {
        let mut config: BmsConfig = serde_yaml::from_str(CONFIG).unwrap();
        config.devices[0].bridge = "bus7".to_string();
        let result = build_bridges(&config, |b| {
            ModbusClient::new(b.transport.clone(), b.connect_timeout())
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_spawn_skips_empty_bridges_and_stops_on_cancel() {
        let config: BmsConfig = serde_yaml::from_str(CONFIG).unwrap();
        let (bridges, _handles) = build_bridges(&config, |_| {
            ModbusClient::new(
                TransportConfig::Tcp {
                    host: "127.0.0.1".to_string(),
                    port: 1,
                },
                std::time::Duration::from_millis(10),
            )
        })
        .unwrap();

        let cancel = CancellationToken::new();
        let tasks = spawn_bridges(bridges, &cancel);
        assert_eq!(tasks.len(), 1);

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), join_bridges(tasks))
            .await
            .unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn test_join_task_logs_panicked_task() {
        let ok = tokio::spawn(async {});
        assert!(join_task("Status", ok).await);

        let panicked = tokio::spawn(async { panic!("status report broke") });
        assert!(!join_task("Status", panicked).await);
        assert!(logs_contain("Status task failed"));
    }
}
