//! Battery Management Service Library (BmsSrv)
//!
//! Drives battery racks over Modbus: a register/channel codec, a cyclic
//! prioritized bus scheduler and a start/stop state machine per battery.
//!
//! # Architecture
//!
//! - **`core`**: channel model, configuration and bootstrap
//! - **`protocols`**: Modbus PDU, framing, transports, register codec and tasks
//! - **`battery`**: device models (single rack, cluster), state machine, controller
//! - **`runtime`**: bus bridges, scheduling, reconnection and lifecycle
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │   BmsConfig     │───►│     Bridge      │───►│ ModbusTransport │
//! │   (YAML/env)    │    │  (one per bus)  │    │   (TCP/RTU)     │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//!                                 │
//!                                 ▼
//!                        ┌─────────────────┐    ┌─────────────────┐
//!                        │     Device      │───►│  DeviceHandle   │
//!                        │ model + machine │    │ (watch / mpsc)  │
//!                        └─────────────────┘    └─────────────────┘
//! ```

pub mod battery;
pub mod core;
pub mod error;
pub mod protocols;
pub mod runtime;

pub use crate::battery::controller::TargetMode;
pub use crate::battery::device::{Device, DeviceHandle, DeviceSnapshot};
pub use crate::battery::state_machine::BatteryState;
pub use crate::core::config::BmsConfig;
pub use crate::error::{BmsError, Result};
