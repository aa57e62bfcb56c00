//! BmsSrv main program
//!
//! Loads the configuration, starts one bus bridge per configured bus and runs
//! until a shutdown signal arrives.

use std::time::Duration;

use clap::Parser;
use errors::VoltageResult;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use bmssrv::core::bootstrap::{load_config, log_config, Args};
use bmssrv::runtime::lifecycle::{build_modbus_bridges, join_bridges, join_task, spawn_bridges};
use bmssrv::DeviceHandle;

#[tokio::main]
async fn main() -> VoltageResult<()> {
    let args = Args::parse();

    let config = load_config(&args)?;
    if args.validate {
        println!(
            "Configuration OK: {} bridges, {} devices",
            config.bridges.len(),
            config.devices.len()
        );
        return Ok(());
    }

    common::logging::init_with_config(log_config(&config.service, !args.no_color))?;
    info!("Starting {} v{}", config.service.name, env!("CARGO_PKG_VERSION"));

    let (bridges, handles) = build_modbus_bridges(&config)?;
    info!(
        "Configured {} bridges with {} devices",
        bridges.len(),
        handles.len()
    );

    let cancel = CancellationToken::new();
    let tasks = spawn_bridges(bridges, &cancel);

    let status = (config.service.status_interval_secs > 0).then(|| {
        tokio::spawn(report_status(
            handles.clone(),
            Duration::from_secs(config.service.status_interval_secs),
            cancel.child_token(),
        ))
    });

    let signal = common::shutdown::cancel_on_shutdown(cancel.clone());
    cancel.cancelled().await;
    info!("Stopping bridges");

    join_bridges(tasks).await;
    if let Some(status) = status {
        join_task("Status", status).await;
    }
    join_task("Shutdown signal", signal).await;
    info!("{} stopped", config.service.name);
    Ok(())
}

/// Periodically log the published state of every device
async fn report_status(handles: Vec<DeviceHandle>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {},
        }
        for handle in &handles {
            let snapshot = handle.snapshot();
            info!(
                "Device {}: {} ready={} starts_failed={} limits={:?}",
                snapshot.id,
                snapshot.state,
                snapshot.ready,
                snapshot.unsuccessful_starts,
                snapshot.limits
            );
            match serde_json::to_string(&snapshot.channels) {
                Ok(json) => tracing::debug!("Device {} channels: {}", snapshot.id, json),
                Err(e) => warn!("Device {}: cannot serialize channels: {}", snapshot.id, e),
            }
        }
    }
}
