//! Bus bridge
//!
//! One bridge owns one Modbus transport and every device on that bus. It runs
//! discrete cycles at a fixed period:
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────┐   ┌───────────────┐   ┌─────────┐
//! │ read phase   │──►│ evaluation phase │──►│ write phase   │──►│ publish │
//! │ HIGH + LOW   │   │ limits, machines │   │ pending only  │   │ watch   │
//! └──────────────┘   └──────────────────┘   └───────────────┘   └─────────┘
//! ```
//!
//! Exchanges are strictly sequential. A failed read leaves prior values in
//! place and marks the task's channels invalid; a failed write keeps the
//! value pending for the next cycle.

use std::fmt;
use std::time::Duration;

use errors::VoltageErrorTrait;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};

use super::reconnect::{ConnectionState, ReconnectHelper, ReconnectPolicy};
use super::scheduler::{TaskRef, TaskScheduler};
use crate::battery::device::Device;
use crate::core::channel::ChannelStore;
use crate::core::config::BridgeConfig;
use crate::error::{BmsError, Result};
use crate::protocols::modbus::connection::ModbusTransport;
use crate::protocols::modbus::pdu::ModbusPdu;
use crate::protocols::modbus::task::Task;
use crate::protocols::modbus::transport::ModbusFrameProcessor;

/// Statistics of one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle: u64,
    /// Exchanges that completed successfully
    pub executed: usize,
    /// Exchanges that failed on the wire or could not be decoded
    pub failed: usize,
    /// Tasks not sent because the bus was down
    pub skipped: usize,
    pub duration: Duration,
}

/// Transport plus its connection bookkeeping
struct BusLink<T> {
    transport: T,
    reconnect: ReconnectHelper,
    request_timeout: Duration,
}

impl<T: ModbusTransport> BusLink<T> {
    /// Connect if disconnected and the backoff allows it
    async fn ensure_connected(&mut self, bridge: &str, cancel: &CancellationToken) -> Result<bool> {
        if self.transport.is_connected() {
            return Ok(true);
        }
        self.reconnect.mark_disconnected();
        if !self.reconnect.ready(Instant::now()) {
            return Ok(false);
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BmsError::Cancelled),
            r = self.transport.connect() => r,
        };
        match result {
            Ok(()) => {
                self.reconnect.mark_connected(Instant::now());
                info!("Bridge {}: connected to {}", bridge, self.transport.describe());
                Ok(true)
            },
            Err(e) => {
                warn!(
                    "Bridge {}: connect to {} failed: {}",
                    bridge,
                    self.transport.describe(),
                    e
                );
                self.reconnect.record_failure(Instant::now());
                Ok(false)
            },
        }
    }

    /// One request/response bounded by the request timeout
    ///
    /// Exception responses come back as [`BmsError::Exception`]. Errors that
    /// leave the link unusable drop the connection.
    async fn exchange(
        &mut self,
        unit_id: u8,
        request: &ModbusPdu,
        cancel: &CancellationToken,
    ) -> Result<ModbusPdu> {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BmsError::Cancelled),
            r = timeout(self.request_timeout, self.transport.exchange(unit_id, request)) => match r {
                Ok(r) => r,
                Err(_) => Err(BmsError::timeout(format!(
                    "No response from unit {} within {:?}",
                    unit_id, self.request_timeout
                ))),
            },
        };

        match result {
            Ok(pdu) => {
                ModbusFrameProcessor::check_exception(&pdu)?;
                Ok(pdu)
            },
            Err(e) => {
                if e.breaks_connection() {
                    self.transport.disconnect().await;
                    self.reconnect.mark_disconnected();
                }
                Err(e)
            },
        }
    }
}

pub struct Bridge<T: ModbusTransport> {
    id: String,
    link: BusLink<T>,
    devices: Vec<Device>,
    scheduler: TaskScheduler,
    cycle_time: Duration,
    cycles: u64,
}

impl<T: ModbusTransport> Bridge<T> {
    pub fn new(config: &BridgeConfig, transport: T) -> Self {
        Self {
            id: config.id.clone(),
            link: BusLink {
                transport,
                reconnect: ReconnectHelper::new(ReconnectPolicy::from(&config.reconnect)),
                request_timeout: config.request_timeout(),
            },
            devices: Vec::new(),
            scheduler: TaskScheduler::new(config.low_tasks_per_cycle),
            cycle_time: config.cycle_time(),
            cycles: 0,
        }
    }

    pub fn add_device(&mut self, device: Device) {
        let index = self.devices.len();
        self.scheduler.add_device(index, device.tasks());
        debug!(
            "Bridge {}: device {} (unit {}) with {} tasks",
            self.id,
            device.id(),
            device.unit_id(),
            device.tasks().len()
        );
        self.devices.push(device);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device_mut(&mut self, id: &str) -> Option<&mut Device> {
        self.devices.iter_mut().find(|d| d.id() == id)
    }

    pub fn transport(&self) -> &T {
        &self.link.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.link.transport
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.link.reconnect.connection_state()
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Run one complete cycle
    ///
    /// Only cancellation aborts a cycle; wire failures are recorded in the
    /// report and in channel validity.
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> Result<CycleReport> {
        let started = Instant::now();
        self.cycles += 1;
        let mut report = CycleReport {
            cycle: self.cycles,
            ..CycleReport::default()
        };

        let plan = self.scheduler.plan_cycle();
        let connected = self.link.ensure_connected(&self.id, cancel).await?;

        for task_ref in &plan.reads {
            self.read_task(*task_ref, connected, cancel, &mut report).await?;
        }

        let now = Instant::now();
        for device in &mut self.devices {
            device.evaluate(now);
        }

        let connected = connected && self.link.transport.is_connected();
        for task_ref in &plan.writes {
            self.write_task(*task_ref, connected, cancel, &mut report).await?;
        }

        for device in &self.devices {
            device.publish();
        }

        report.duration = started.elapsed();
        Ok(report)
    }

    async fn read_task(
        &mut self,
        task_ref: TaskRef,
        connected: bool,
        cancel: &CancellationToken,
        report: &mut CycleReport,
    ) -> Result<()> {
        let Some(device) = self.devices.get_mut(task_ref.device) else {
            return Ok(());
        };
        let unit_id = device.unit_id();
        let Some((task, store)) = device.task_and_store(task_ref.task) else {
            return Ok(());
        };

        if !connected || !self.link.transport.is_connected() {
            invalidate(task, store);
            report.skipped += 1;
            return Ok(());
        }

        let request = match task.read_request() {
            Ok(request) => request,
            Err(e) => {
                error!("Bridge {}: {}: {}", self.id, task, e);
                invalidate(task, store);
                report.failed += 1;
                return Ok(());
            },
        };

        let outcome = match self.link.exchange(unit_id, &request, cancel).await {
            Ok(pdu) => task.decode_response(&pdu, store),
            Err(BmsError::Cancelled) => return Err(BmsError::Cancelled),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(decoded) => {
                store.apply(&decoded);
                report.executed += 1;
            },
            Err(e) => {
                log_failure(&self.id, format_args!("unit {} {}", unit_id, task), &e);
                invalidate(task, store);
                report.failed += 1;
            },
        }
        Ok(())
    }

    async fn write_task(
        &mut self,
        task_ref: TaskRef,
        connected: bool,
        cancel: &CancellationToken,
        report: &mut CycleReport,
    ) -> Result<()> {
        let Some(device) = self.devices.get_mut(task_ref.device) else {
            return Ok(());
        };
        let unit_id = device.unit_id();
        let Some((task, store)) = device.task_and_store(task_ref.task) else {
            return Ok(());
        };
        if !task.has_pending_writes(store) {
            return Ok(());
        }

        let (runs, rejected) = task.prepare_writes(store);
        for (channel, e) in rejected {
            warn!("Bridge {}: {}: dropping pending write: {}", self.id, task, e);
            store.clear_pending(channel);
        }
        if runs.is_empty() {
            return Ok(());
        }
        if !connected || !self.link.transport.is_connected() {
            report.skipped += 1;
            return Ok(());
        }

        for run in runs {
            let request = match task.write_request(&run) {
                Ok(request) => request,
                Err(e) => {
                    error!("Bridge {}: {}: {}", self.id, task, e);
                    report.failed += 1;
                    continue;
                },
            };
            let outcome = match self.link.exchange(unit_id, &request, cancel).await {
                Ok(pdu) => task.check_write_response(&run, &pdu),
                Err(BmsError::Cancelled) => return Err(BmsError::Cancelled),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => {
                    for channel in &run.channels {
                        store.promote_pending(*channel);
                    }
                    report.executed += 1;
                },
                Err(e) => {
                    // Value stays pending and is retried next cycle
                    log_failure(
                        &self.id,
                        format_args!("unit {} write 0x{:04X}+{}", unit_id, run.start, run.words.len()),
                        &e,
                    );
                    report.failed += 1;
                },
            }
        }
        Ok(())
    }

    /// Cycle until `cancel` fires, then drop the connection
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "Bridge {} started on {} with {} devices, cycle {:?}, LOW tasks every {} cycles",
            self.id,
            self.link.transport.describe(),
            self.devices.len(),
            self.cycle_time,
            self.scheduler.low_rotation_cycles()
        );

        let mut interval = tokio::time::interval(self.cycle_time);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {},
            }

            match self.run_cycle(&cancel).await {
                Ok(report) => {
                    debug!(
                        "Bridge {} cycle {}: {} ok, {} failed, {} skipped in {:?}",
                        self.id,
                        report.cycle,
                        report.executed,
                        report.failed,
                        report.skipped,
                        report.duration
                    );
                    if report.duration > self.cycle_time {
                        warn!(
                            "Bridge {} cycle {} took {:?}, longer than the {:?} period",
                            self.id, report.cycle, report.duration, self.cycle_time
                        );
                    }
                },
                Err(BmsError::Cancelled) => break,
                Err(e) => error!("Bridge {} cycle failed: {}", self.id, e),
            }
        }

        self.link.transport.disconnect().await;
        let stats = self.link.reconnect.stats();
        info!(
            "Bridge {} stopped after {} cycles ({} reconnects, {} failed connects)",
            self.id, self.cycles, stats.successful_reconnects, stats.failed_reconnects
        );
    }
}

/// Log a failed exchange at the level its error class asks for
fn log_failure(bridge: &str, what: fmt::Arguments<'_>, e: &BmsError) {
    match e.log_level() {
        Level::ERROR => error!("Bridge {}: {} failed: {}", bridge, what, e),
        Level::WARN => warn!("Bridge {}: {} failed: {}", bridge, what, e),
        _ => debug!("Bridge {}: {} failed: {}", bridge, what, e),
    }
}

fn invalidate(task: &Task, store: &mut ChannelStore) {
    for channel in task.channels() {
        store.invalidate(channel);
    }
}
