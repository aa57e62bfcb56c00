//! Field bus protocols

pub mod modbus;
