//! Runtime orchestration: bus bridges, scheduling and lifecycle

pub mod bridge;
pub mod lifecycle;
pub mod reconnect;
pub mod scheduler;
