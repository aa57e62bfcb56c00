//! Battery device models
//!
//! A model declares a device's channels and register tasks, classifies the
//! decoded values into an [`Observation`] and turns controller commands into
//! pending channel writes. Register layouts live in the model modules as
//! static tables.

use std::fmt::Debug;

use tracing::debug;

use super::cluster::Cluster;
use super::single_rack::SingleRack;
use super::state_machine::{Command, Observation};
use crate::core::channel::{ChannelDoc, ChannelId, ChannelStore, ChannelType};
use crate::core::config::{DeviceConfig, DeviceKind};
use crate::error::Result;
use crate::protocols::modbus::codec::RegisterElement;
use crate::protocols::modbus::task::Task;

/// Behaviour shared by every battery family
pub trait BatteryModel: Send + Debug {
    /// Short family name used in logs
    fn family(&self) -> &'static str;

    /// Classify the current channel values
    fn observe(&self, store: &ChannelStore) -> Observation;

    /// Queue the channel writes that carry out `command`
    fn command(&self, command: Command, store: &mut ChannelStore) -> Result<()>;

    /// Drop start/stop writes that have not reached the device yet
    fn withdraw(&self, store: &mut ChannelStore);

    /// BMS charge and discharge current limits, when both are valid
    fn bms_limits(&self, store: &ChannelStore) -> Option<(f64, f64)>;

    /// Whether the model implements the sleep/reset sequence
    fn supports_reset(&self) -> bool {
        false
    }
}

/// Everything a device needs from its model
#[derive(Debug)]
pub struct ModelParts {
    pub store: ChannelStore,
    pub tasks: Vec<Task>,
    pub model: Box<dyn BatteryModel>,
}

/// Build, validate and bind the model for `config`
///
/// Fails on a malformed task or element definition; this is only ever
/// expected at startup.
pub fn build_model(config: &DeviceConfig) -> Result<ModelParts> {
    let mut store = ChannelStore::new();
    let (tasks, model): (Vec<Task>, Box<dyn BatteryModel>) = match config.kind {
        DeviceKind::SingleRack => {
            let (model, tasks) = SingleRack::build(&mut store)?;
            (tasks, Box::new(model))
        },
        DeviceKind::Cluster => {
            let (model, tasks) = Cluster::build(&mut store, &config.racks)?;
            (tasks, Box::new(model))
        },
    };

    for task in &tasks {
        task.validate(&store)?;
        task.bind(&mut store)?;
    }
    debug!(
        "Device {}: {} model with {} channels and {} tasks",
        config.id,
        model.family(),
        store.len(),
        tasks.len()
    );

    Ok(ModelParts {
        store,
        tasks,
        model,
    })
}

/// Declare one boolean channel per `(bit, name)` entry and map it on `element`
pub(crate) fn bit_table(
    store: &mut ChannelStore,
    mut element: RegisterElement,
    table: &[(u8, &'static str)],
) -> Result<(RegisterElement, Vec<ChannelId>)> {
    let mut ids = Vec::with_capacity(table.len());
    for &(bit, name) in table {
        let id = store.add(ChannelDoc::read(name, ChannelType::Boolean))?;
        element = element.bit(bit, id);
        ids.push(id);
    }
    Ok((element, ids))
}

/// True if any of `channels` is valid and set; invalid bits never count
pub(crate) fn any_set(store: &ChannelStore, channels: &[ChannelId]) -> bool {
    channels.iter().any(|&id| store.bool_value(id) == Some(true))
}

/// Both limits, when both channels are valid
pub(crate) fn limit_pair(store: &ChannelStore, charge: ChannelId, discharge: ChannelId) -> Option<(f64, f64)> {
    let charge = store.value(charge)?.as_f64();
    let discharge = store.value(discharge)?.as_f64();
    Some((charge, discharge))
}
