//! Basic library shared by the battery management services
//!
//! Provides:
//! - logging bootstrap (console + daily rolling file)
//! - layered configuration loading (defaults, file, environment)
//! - graceful shutdown signal handling

pub mod config_loader;
pub mod logging;
pub mod shutdown;
