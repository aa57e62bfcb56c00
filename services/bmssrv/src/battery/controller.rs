//! Device controller
//!
//! Wraps the state machine with the target operating mode and the command
//! guards, and turns commands into pending channel writes through the
//! device model.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::model::BatteryModel;
use super::state_machine::{
    BatteryState, Command, ContactorPattern, Observation, StateMachine, StateMachineConfig,
};
use crate::core::channel::ChannelStore;

/// Requested operating mode of a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetMode {
    /// Start/stop decided by the state machine
    #[default]
    Default,
    /// Keep the battery started, bypassing the state machine
    ForceOn,
    /// Keep the battery stopped
    ForceOff,
}

/// Outcome of one controller evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub state: BatteryState,
    pub ready: bool,
    /// Commands that produced channel writes
    pub issued: Vec<Command>,
}

#[derive(Debug)]
pub struct Controller {
    machine: StateMachine,
    /// A stop was written and the contactors have not opened yet
    is_stopping: bool,
}

impl Controller {
    pub fn new(config: StateMachineConfig) -> Self {
        Self {
            machine: StateMachine::new(config),
            is_stopping: false,
        }
    }

    pub fn state(&self) -> BatteryState {
        self.machine.state()
    }

    pub fn unsuccessful_starts(&self) -> u32 {
        self.machine.unsuccessful_starts()
    }

    pub fn is_stopping(&self) -> bool {
        self.is_stopping
    }

    /// Evaluate once against the channel values of the cycle that just read
    pub fn evaluate(
        &mut self,
        now: Instant,
        mode: TargetMode,
        model: &dyn BatteryModel,
        store: &mut ChannelStore,
    ) -> Evaluation {
        let obs = model.observe(store);
        if obs.pattern == ContactorPattern::Stopped {
            self.is_stopping = false;
        }

        let (commands, ready) = match mode {
            TargetMode::Default => {
                let step = self.machine.step(now, &obs);
                (step.commands, step.ready)
            },
            TargetMode::ForceOn => (
                vec![Command::Start],
                obs.pattern == ContactorPattern::Running && !obs.fault,
            ),
            TargetMode::ForceOff => (vec![Command::Stop], false),
        };

        let mut issued = Vec::with_capacity(commands.len());
        for command in commands {
            if self.execute(command, &obs, model, store) {
                issued.push(command);
            }
        }

        Evaluation {
            state: self.machine.state(),
            ready,
            issued,
        }
    }

    /// Apply the command guards and queue the writes; true if writes were queued
    fn execute(
        &mut self,
        command: Command,
        obs: &Observation,
        model: &dyn BatteryModel,
        store: &mut ChannelStore,
    ) -> bool {
        match command {
            Command::Start if self.is_stopping => {
                debug!("{}: start skipped, stop in progress", model.family());
                return false;
            },
            // The contactors already match the decision; an older opposite
            // command that never got through must not follow it
            Command::Start if obs.pattern == ContactorPattern::Running => {
                model.withdraw(store);
                return false;
            },
            Command::Stop if obs.pattern == ContactorPattern::Stopped => {
                model.withdraw(store);
                return false;
            },
            Command::Sleep | Command::Reset if !model.supports_reset() => return false,
            _ => {},
        }

        match model.command(command, store) {
            Ok(()) => {
                if command == Command::Stop {
                    self.is_stopping = true;
                }
                true
            },
            Err(e) => {
                warn!("{}: {:?} command failed: {}", model.family(), command, e);
                false
            },
        }
    }
}
