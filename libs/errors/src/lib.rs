//! Unified error handling for the battery management services
//!
//! Every service keeps its own domain error type (for example `BmsError`) and
//! converts into [`VoltageError`] at the process boundary. The shared
//! [`VoltageErrorTrait`] gives all of them the same classification interface
//! for logging and retry decisions.

use thiserror::Error;

// ============================================================================
// VoltageError - Main error type
// ============================================================================

/// Process level error shared by the libraries and service binaries
#[derive(Debug, Error)]
pub enum VoltageError {
    // ======================================
    // Configuration
    // ======================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // ======================================
    // Field bus
    // ======================================
    #[error("Modbus error: {0}")]
    Modbus(String),

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Timeout waiting for response from {0}")]
    Timeout(String),

    // ======================================
    // Channel data
    // ======================================
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Out of range: {value} not in [{min}, {max}]")]
    OutOfRange {
        value: String,
        min: String,
        max: String,
    },

    #[error("Channel error: {0}")]
    Channel(String),

    // ======================================
    // Service lifecycle
    // ======================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Service startup failed: {0}")]
    StartupFailed(String),

    #[error("Shutdown: {0}")]
    Shutdown(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type VoltageResult<T> = Result<T, VoltageError>;

impl From<serde_json::Error> for VoltageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for VoltageError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Deserialization(err.to_string())
    }
}

impl From<figment::Error> for VoltageError {
    fn from(err: figment::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl VoltageErrorTrait for VoltageError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::FileNotFound(_) => "FILE_NOT_FOUND",
            Self::Deserialization(_) => "DESERIALIZATION_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Modbus(_) => "MODBUS_ERROR",
            Self::Communication(_) => "COMMUNICATION_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::OutOfRange { .. } => "OUT_OF_RANGE",
            Self::Channel(_) => "CHANNEL_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::StartupFailed(_) => "STARTUP_FAILED",
            Self::Shutdown(_) => "SHUTDOWN",
            Self::Other(_) => "OTHER_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) | Self::Deserialization(_) => ErrorCategory::Configuration,
            Self::FileNotFound(_) => ErrorCategory::NotFound,
            Self::Modbus(_) => ErrorCategory::Protocol,
            Self::Communication(_) => ErrorCategory::Connection,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Validation(_) | Self::OutOfRange { .. } | Self::Channel(_) => {
                ErrorCategory::Validation
            },
            Self::Io(_) | Self::Serialization(_) | Self::StartupFailed(_) | Self::Shutdown(_) => {
                ErrorCategory::Internal
            },
            Self::Other(_) => ErrorCategory::Unknown,
        }
    }
}

// ============================================================================
// Error Trait - Architectural layer
// ============================================================================

/// Error category enum - used for classification and log routing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    NotFound,
    Validation,

    // Field bus
    Protocol,
    Connection,
    Timeout,
    Network,

    /// Decoded values that cannot be trusted
    DataCorruption,

    Internal,
    Unknown,
}

/// Error capability trait
///
/// Each service keeps its own domain-specific error type and gains the common
/// interface by implementing this trait.
pub trait VoltageErrorTrait: std::error::Error + Send + Sync + 'static {
    /// Stable code for logs and monitoring
    fn error_code(&self) -> &'static str;

    fn category(&self) -> ErrorCategory;

    /// Whether repeating the operation may succeed (category based by default)
    fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Network | ErrorCategory::Timeout | ErrorCategory::Connection
        )
    }

    /// Level the error should be logged at
    fn log_level(&self) -> tracing::Level {
        use tracing::Level;
        match self.category() {
            ErrorCategory::Internal | ErrorCategory::Configuration => Level::ERROR,
            ErrorCategory::Validation | ErrorCategory::NotFound => Level::INFO,
            _ => Level::WARN,
        }
    }
}
