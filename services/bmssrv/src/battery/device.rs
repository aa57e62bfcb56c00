//! Battery device
//!
//! Owns the channels, tasks, model and controller of one battery and the
//! receiving ends of its upward interface. A device is driven exclusively by
//! the bridge of the bus it sits on.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::info;

use super::controller::{Controller, Evaluation, TargetMode};
use super::limitation::{LimitationEvent, LimitationSender, Limits, PowerLimitation, BMS_SOURCE};
use super::model::{build_model, BatteryModel};
use super::state_machine::{BatteryState, StateMachineConfig};
use crate::core::channel::{ChannelSnapshot, ChannelStore};
use crate::core::config::DeviceConfig;
use crate::error::Result;
use crate::protocols::modbus::task::Task;

/// Published view of a device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub id: String,
    pub state: BatteryState,
    /// Ready for work
    pub ready: bool,
    pub unsuccessful_starts: u32,
    pub mode: TargetMode,
    pub limits: Limits,
    pub channels: Vec<ChannelSnapshot>,
    pub updated_at: DateTime<Utc>,
}

/// Upward interface of one device
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    id: String,
    snapshot: watch::Receiver<DeviceSnapshot>,
    mode: Arc<watch::Sender<TargetMode>>,
    limitation: LimitationSender,
}

impl DeviceHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> DeviceSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DeviceSnapshot> {
        self.snapshot.clone()
    }

    /// Takes effect at the next evaluation
    pub fn set_target_mode(&self, mode: TargetMode) {
        self.mode.send_replace(mode);
    }

    pub fn target_mode(&self) -> TargetMode {
        *self.mode.borrow()
    }

    pub fn limitation_sender(&self) -> LimitationSender {
        self.limitation.clone()
    }
}

#[derive(Debug)]
pub struct Device {
    id: String,
    unit_id: u8,
    store: ChannelStore,
    tasks: Vec<Task>,
    model: Box<dyn BatteryModel>,
    controller: Controller,
    limitation: PowerLimitation,
    limitation_rx: mpsc::UnboundedReceiver<LimitationEvent>,
    mode_rx: watch::Receiver<TargetMode>,
    snapshot_tx: watch::Sender<DeviceSnapshot>,
    ready: bool,
}

impl Device {
    pub fn new(config: &DeviceConfig) -> Result<(Self, DeviceHandle)> {
        let parts = build_model(config)?;
        let sm_config =
            StateMachineConfig::from_timings(&config.state_machine, parts.model.supports_reset());
        let controller = Controller::new(sm_config);

        let initial = DeviceSnapshot {
            id: config.id.clone(),
            state: controller.state(),
            ready: false,
            unsuccessful_starts: 0,
            mode: config.target_mode,
            limits: Limits::default(),
            channels: parts.store.snapshot(),
            updated_at: Utc::now(),
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);
        let (mode_tx, mode_rx) = watch::channel(config.target_mode);
        let (limitation, limitation_rx) = LimitationSender::channel();

        let device = Self {
            id: config.id.clone(),
            unit_id: config.unit_id,
            store: parts.store,
            tasks: parts.tasks,
            model: parts.model,
            controller,
            limitation: PowerLimitation::new(),
            limitation_rx,
            mode_rx,
            snapshot_tx,
            ready: false,
        };
        let handle = DeviceHandle {
            id: config.id.clone(),
            snapshot: snapshot_rx,
            mode: Arc::new(mode_tx),
            limitation,
        };
        Ok((device, handle))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn store(&self) -> &ChannelStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ChannelStore {
        &mut self.store
    }

    /// Task `index` together with the channel store it reads and writes
    pub(crate) fn task_and_store(&mut self, index: usize) -> Option<(&Task, &mut ChannelStore)> {
        let task = self.tasks.get(index)?;
        Some((task, &mut self.store))
    }

    pub fn state(&self) -> BatteryState {
        self.controller.state()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Evaluation phase: limits, then the controller
    pub fn evaluate(&mut self, now: Instant) -> Evaluation {
        self.limitation.drain(&mut self.limitation_rx);
        if let Some((charge, discharge)) = self.model.bms_limits(&self.store) {
            self.limitation.apply(LimitationEvent::Set {
                source: BMS_SOURCE.to_string(),
                max_charge_current: charge,
                max_discharge_current: discharge,
            });
        }

        let mode = *self.mode_rx.borrow_and_update();
        let before = self.controller.state();
        let eval = self
            .controller
            .evaluate(now, mode, self.model.as_ref(), &mut self.store);
        if eval.state != before {
            info!("Device {}: {} -> {}", self.id, before, eval.state);
        }
        if eval.ready != self.ready {
            info!("Device {}: ready for work = {}", self.id, eval.ready);
        }
        self.ready = eval.ready;
        eval
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            id: self.id.clone(),
            state: self.controller.state(),
            ready: self.ready,
            unsuccessful_starts: self.controller.unsuccessful_starts(),
            mode: *self.mode_rx.borrow(),
            limits: self.limitation.effective(self.ready),
            channels: self.store.snapshot(),
            updated_at: Utc::now(),
        }
    }

    /// Publish the current snapshot to every subscriber
    pub fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }
}
