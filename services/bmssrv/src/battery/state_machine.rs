//! Battery start/stop state machine
//!
//! ```text
//! UNDEFINED ──► OFF ──► INIT ──► RUNNING
//!    │  │        ▲       │ │        │
//!    │  └► PENDING       │ └► ERRORDELAY ◄── ERROR ◄── (fault)
//!    │                   ▼         │
//!    └─────────────► STOPPING ─────┘
//! ```
//!
//! The machine is a pure function of the observation and the instant passed
//! in: it never reads the clock and never touches channels. Commands it
//! returns are executed by the device controller.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::core::config::StateMachineTimings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatteryState {
    Undefined,
    Off,
    Init,
    Running,
    Stopping,
    Error,
    ErrorDelay,
    Pending,
}

impl fmt::Display for BatteryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatteryState::Undefined => "UNDEFINED",
            BatteryState::Off => "OFF",
            BatteryState::Init => "INIT",
            BatteryState::Running => "RUNNING",
            BatteryState::Stopping => "STOPPING",
            BatteryState::Error => "ERROR",
            BatteryState::ErrorDelay => "ERRORDELAY",
            BatteryState::Pending => "PENDING",
        };
        f.write_str(name)
    }
}

/// Contactor readback classified by the device model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContactorPattern {
    /// Every contactor reads open
    Stopped,
    /// Every contactor in use reads closed and no other does
    Running,
    /// Valid readings that are neither stopped nor running
    Ambiguous,
    /// At least one reading is invalid
    Unknown,
}

/// What the machine sees in one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub fault: bool,
    pub pattern: ContactorPattern,
}

impl Observation {
    pub fn new(fault: bool, pattern: ContactorPattern) -> Self {
        Self { fault, pattern }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    /// Put every rack to sleep before a reset
    Sleep,
    /// Reset master and racks
    Reset,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateMachineConfig {
    pub max_start_time: Duration,
    pub max_start_attempts: u32,
    pub error_level2_delay: Duration,
    pub start_unsuccessful_delay: Duration,
    pub pending_tolerance: Duration,
    /// Run the sleep/reset sequence while waiting in ERRORDELAY
    pub reset_on_error: bool,
}

impl StateMachineConfig {
    pub fn from_timings(timings: &StateMachineTimings, reset_on_error: bool) -> Self {
        Self {
            max_start_time: Duration::from_secs(timings.max_start_time),
            max_start_attempts: timings.max_start_attempts,
            error_level2_delay: Duration::from_secs(timings.error_level2_delay),
            start_unsuccessful_delay: Duration::from_secs(timings.start_unsuccessful_delay),
            pending_tolerance: Duration::from_secs(timings.pending_tolerance),
            reset_on_error,
        }
    }
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self::from_timings(&StateMachineTimings::default(), false)
    }
}

/// Progress of the ERRORDELAY reset sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResetProgress {
    Idle,
    SleepSent,
    Done,
}

/// Result of one evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub from: BatteryState,
    pub to: BatteryState,
    pub commands: Vec<Command>,
    /// Device may be dispatched
    pub ready: bool,
}

#[derive(Debug)]
pub struct StateMachine {
    config: StateMachineConfig,
    state: BatteryState,
    start_attempt: Option<Instant>,
    error_deadline: Option<Instant>,
    pending_since: Option<Instant>,
    unsuccessful_starts: u32,
    reset: ResetProgress,
}

impl StateMachine {
    pub fn new(config: StateMachineConfig) -> Self {
        Self {
            config,
            state: BatteryState::Undefined,
            start_attempt: None,
            error_deadline: None,
            pending_since: None,
            unsuccessful_starts: 0,
            reset: ResetProgress::Idle,
        }
    }

    pub fn state(&self) -> BatteryState {
        self.state
    }

    pub fn unsuccessful_starts(&self) -> u32 {
        self.unsuccessful_starts
    }

    pub fn error_deadline(&self) -> Option<Instant> {
        self.error_deadline
    }

    pub fn config(&self) -> &StateMachineConfig {
        &self.config
    }

    /// Evaluate once
    pub fn step(&mut self, now: Instant, obs: &Observation) -> Step {
        let from = self.state;
        let mut commands = Vec::new();
        let mut ready = false;

        let to = match self.state {
            BatteryState::Undefined => {
                if obs.fault {
                    BatteryState::Error
                } else {
                    match obs.pattern {
                        ContactorPattern::Stopped => BatteryState::Off,
                        ContactorPattern::Running => BatteryState::Running,
                        ContactorPattern::Ambiguous => {
                            self.pending_since = Some(now);
                            BatteryState::Pending
                        },
                        ContactorPattern::Unknown => BatteryState::Undefined,
                    }
                }
            },

            BatteryState::Off => {
                commands.push(Command::Start);
                self.start_attempt = Some(now);
                BatteryState::Init
            },

            BatteryState::Init => {
                if obs.pattern == ContactorPattern::Running {
                    self.unsuccessful_starts = 0;
                    self.start_attempt = None;
                    BatteryState::Running
                } else if self.start_timed_out(now) {
                    self.start_attempt = None;
                    self.unsuccessful_starts += 1;
                    commands.push(Command::Stop);
                    if self.unsuccessful_starts >= self.config.max_start_attempts {
                        info!(
                            "{} unsuccessful start attempts, waiting {:?}",
                            self.unsuccessful_starts, self.config.start_unsuccessful_delay
                        );
                        self.error_deadline = Some(now + self.config.start_unsuccessful_delay);
                        self.unsuccessful_starts = 0;
                        BatteryState::ErrorDelay
                    } else {
                        BatteryState::Stopping
                    }
                } else {
                    BatteryState::Init
                }
            },

            BatteryState::Running => {
                if obs.fault {
                    BatteryState::Error
                } else if obs.pattern != ContactorPattern::Running {
                    BatteryState::Undefined
                } else {
                    ready = true;
                    BatteryState::Running
                }
            },

            BatteryState::Stopping => {
                if obs.fault {
                    BatteryState::Error
                } else if obs.pattern == ContactorPattern::Stopped {
                    BatteryState::Off
                } else {
                    BatteryState::Stopping
                }
            },

            BatteryState::Error => {
                commands.push(Command::Stop);
                self.error_deadline = Some(now + self.config.error_level2_delay);
                BatteryState::ErrorDelay
            },

            BatteryState::ErrorDelay => {
                let expired = self.error_deadline.map(|d| now > d).unwrap_or(true);
                if expired {
                    self.error_deadline = None;
                    self.reset = ResetProgress::Idle;
                    if obs.fault {
                        BatteryState::Error
                    } else {
                        BatteryState::Off
                    }
                } else {
                    if self.config.reset_on_error {
                        self.advance_reset(&mut commands);
                    }
                    BatteryState::ErrorDelay
                }
            },

            BatteryState::Pending => {
                let since = *self.pending_since.get_or_insert(now);
                if now > since + self.config.pending_tolerance {
                    // State could not be determined; stop and start over
                    self.pending_since = None;
                    commands.push(Command::Stop);
                    BatteryState::Off
                } else if obs.fault {
                    self.pending_since = None;
                    BatteryState::Error
                } else {
                    match obs.pattern {
                        ContactorPattern::Stopped => {
                            self.pending_since = None;
                            BatteryState::Off
                        },
                        ContactorPattern::Running => {
                            self.pending_since = None;
                            BatteryState::Running
                        },
                        _ => BatteryState::Pending,
                    }
                }
            },
        };

        if to != from {
            debug!("State {} -> {}", from, to);
        }
        self.state = to;

        Step {
            from,
            to,
            commands,
            ready,
        }
    }

    fn start_timed_out(&self, now: Instant) -> bool {
        self.start_attempt
            .map(|t| now > t + self.config.max_start_time)
            .unwrap_or(true)
    }

    fn advance_reset(&mut self, commands: &mut Vec<Command>) {
        self.reset = match self.reset {
            ResetProgress::Idle => {
                commands.push(Command::Sleep);
                ResetProgress::SleepSent
            },
            ResetProgress::SleepSent => {
                commands.push(Command::Reset);
                ResetProgress::Done
            },
            ResetProgress::Done => ResetProgress::Done,
        };
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    const STOPPED: Observation = Observation {
        fault: false,
        pattern: ContactorPattern::Stopped,
    };
    const RUNNING: Observation = Observation {
        fault: false,
        pattern: ContactorPattern::Running,
    };
    const AMBIGUOUS: Observation = Observation {
        fault: false,
        pattern: ContactorPattern::Ambiguous,
    };
    const UNKNOWN: Observation = Observation {
        fault: false,
        pattern: ContactorPattern::Unknown,
    };
    const FAULT: Observation = Observation {
        fault: true,
        pattern: ContactorPattern::Running,
    };

    fn config() -> StateMachineConfig {
        StateMachineConfig {
            max_start_time: Duration::from_secs(5),
            max_start_attempts: 3,
            error_level2_delay: Duration::from_secs(60),
            start_unsuccessful_delay: Duration::from_secs(600),
            pending_tolerance: Duration::from_secs(15),
            reset_on_error: false,
        }
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[tokio::test(start_paused = true)]
    async fn test_undefined_resolves_by_pattern() {
        let t0 = Instant::now();
        for (obs, expected) in [
            (STOPPED, BatteryState::Off),
            (RUNNING, BatteryState::Running),
            (AMBIGUOUS, BatteryState::Pending),
            (UNKNOWN, BatteryState::Undefined),
            (FAULT, BatteryState::Error),
        ] {
            let mut sm = StateMachine::new(config());
            let step = sm.step(t0, &obs);
            assert_eq!(step.from, BatteryState::Undefined);
            assert_eq!(step.to, expected, "{:?}", obs);
            assert!(step.commands.is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_start_goes_to_stopping() {
        let t0 = Instant::now();
        let mut sm = StateMachine::new(config());
        sm.step(t0, &STOPPED);

        let step = sm.step(t0, &STOPPED);
        assert_eq!(step.to, BatteryState::Init);
        assert_eq!(step.commands, vec![Command::Start]);

        // Not yet expired at exactly max_start_time
        assert_eq!(sm.step(t0 + secs(5), &STOPPED).to, BatteryState::Init);

        let step = sm.step(t0 + secs(6), &STOPPED);
        assert_eq!(step.to, BatteryState::Stopping);
        assert_eq!(step.commands, vec![Command::Stop]);
        assert_eq!(sm.unsuccessful_starts(), 1);

        assert_eq!(sm.step(t0 + secs(7), &STOPPED).to, BatteryState::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_failures_enter_error_delay() {
        let mut now = Instant::now();
        let mut sm = StateMachine::new(config());
        sm.step(now, &STOPPED);

        for attempt in 1..=3 {
            assert_eq!(sm.step(now, &STOPPED).to, BatteryState::Init);
            now += secs(6);
            let step = sm.step(now, &STOPPED);
            if attempt < 3 {
                assert_eq!(step.to, BatteryState::Stopping);
                assert_eq!(sm.unsuccessful_starts(), attempt);
                assert_eq!(sm.step(now, &STOPPED).to, BatteryState::Off);
            } else {
                assert_eq!(step.to, BatteryState::ErrorDelay);
                assert_eq!(step.commands, vec![Command::Stop]);
                assert_eq!(sm.unsuccessful_starts(), 0);
                assert_eq!(sm.error_deadline(), Some(now + secs(600)));
            }
        }

        assert_eq!(sm.step(now + secs(600), &STOPPED).to, BatteryState::ErrorDelay);
        assert_eq!(sm.step(now + secs(601), &STOPPED).to, BatteryState::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_start_resets_counter() {
        let t0 = Instant::now();
        let mut sm = StateMachine::new(config());
        sm.step(t0, &STOPPED);
        sm.step(t0, &STOPPED);
        sm.step(t0 + secs(6), &STOPPED);
        assert_eq!(sm.unsuccessful_starts(), 1);

        sm.step(t0 + secs(7), &STOPPED);
        sm.step(t0 + secs(7), &STOPPED);
        let step = sm.step(t0 + secs(8), &RUNNING);
        assert_eq!(step.to, BatteryState::Running);
        assert_eq!(sm.unsuccessful_starts(), 0);
        assert!(sm.step(t0 + secs(9), &RUNNING).ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_while_running_stops_and_waits() {
        let t0 = Instant::now();
        let mut sm = StateMachine::new(config());
        sm.step(t0, &RUNNING);

        let step = sm.step(t0, &FAULT);
        assert_eq!(step.to, BatteryState::Error);
        assert!(!step.ready);

        let step = sm.step(t0, &FAULT);
        assert_eq!(step.to, BatteryState::ErrorDelay);
        assert_eq!(step.commands, vec![Command::Stop]);

        // Fault still present after the delay
        assert_eq!(sm.step(t0 + secs(61), &FAULT).to, BatteryState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_pattern_lost_goes_undefined() {
        let t0 = Instant::now();
        let mut sm = StateMachine::new(config());
        sm.step(t0, &RUNNING);
        assert_eq!(sm.step(t0, &UNKNOWN).to, BatteryState::Undefined);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_tolerance_stops() {
        let t0 = Instant::now();
        let mut sm = StateMachine::new(config());
        assert_eq!(sm.step(t0, &AMBIGUOUS).to, BatteryState::Pending);
        assert_eq!(sm.step(t0 + secs(15), &AMBIGUOUS).to, BatteryState::Pending);

        let step = sm.step(t0 + secs(16), &AMBIGUOUS);
        assert_eq!(step.to, BatteryState::Off);
        assert_eq!(step.commands, vec![Command::Stop]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_resolves_to_running() {
        let t0 = Instant::now();
        let mut sm = StateMachine::new(config());
        sm.step(t0, &AMBIGUOUS);
        assert_eq!(sm.step(t0 + secs(3), &RUNNING).to, BatteryState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_sequence_runs_once() {
        let t0 = Instant::now();
        let mut sm = StateMachine::new(StateMachineConfig {
            reset_on_error: true,
            ..config()
        });
        sm.step(t0, &FAULT);
        sm.step(t0, &FAULT);

        assert_eq!(sm.step(t0 + secs(1), &FAULT).commands, vec![Command::Sleep]);
        assert_eq!(sm.step(t0 + secs(2), &FAULT).commands, vec![Command::Reset]);
        assert!(sm.step(t0 + secs(3), &FAULT).commands.is_empty());

        assert_eq!(sm.step(t0 + secs(61), &STOPPED).to, BatteryState::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_inputs_same_outputs() {
        let t0 = Instant::now();
        let inputs = [STOPPED, STOPPED, AMBIGUOUS, RUNNING, FAULT, FAULT, STOPPED];
        let run = || {
            let mut sm = StateMachine::new(config());
            inputs
                .iter()
                .enumerate()
                .map(|(i, obs)| sm.step(t0 + secs(i as u64 * 4), obs))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }
}
