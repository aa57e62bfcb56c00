//! Core service building blocks: channel model, configuration and bootstrap

pub mod bootstrap;
pub mod channel;
pub mod config;
