//! Battery devices: register models, start/stop control and limits

pub mod cluster;
pub mod controller;
pub mod device;
pub mod limitation;
pub mod model;
pub mod single_rack;
pub mod state_machine;
