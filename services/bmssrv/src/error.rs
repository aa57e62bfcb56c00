//! Error handling for the battery management service
//!
//! Wire-level failures (`WireTimeout`, `WireError`, `Exception`, `ConnectionError`) are
//! recovered per task by the bridge. `DecodeRange` invalidates one channel,
//! `EncodeRange` is returned to the caller that set the value. Only `ConfigError`
//! is fatal, and only at startup.

use errors::{ErrorCategory, VoltageError, VoltageErrorTrait};
use thiserror::Error;

/// Battery Management Service Error Type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BmsError {
    /// Malformed task/element definitions or invalid service configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// No complete response within the request timeout
    #[error("Wire timeout: {0}")]
    WireTimeout(String),

    /// Malformed response frame, CRC mismatch, unexpected function code
    #[error("Wire error: {0}")]
    WireError(String),

    /// Modbus exception response from the device
    #[error("Modbus exception: function 0x{function:02X}, code 0x{code:02X} ({description})")]
    Exception {
        function: u8,
        code: u8,
        description: &'static str,
    },

    /// Transport not connected, connect failure, peer closed
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Raw data cannot be represented in the bound channel
    #[error("Decode range error: {0}")]
    DecodeRange(String),

    /// Value cannot be represented by the bound register element
    #[error("Encode range error: {channel}: {value} not in [{min}, {max}]")]
    EncodeRange {
        channel: String,
        value: f64,
        min: f64,
        max: f64,
    },

    /// Channel misuse (unknown id, write to a read-only channel, wrong type)
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    IoError(String),

    /// In-flight operation abandoned because the bus is shutting down
    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias for the battery management service
pub type Result<T> = std::result::Result<T, BmsError>;

impl BmsError {
    pub fn config(msg: impl Into<String>) -> Self {
        BmsError::ConfigError(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        BmsError::WireTimeout(msg.into())
    }

    pub fn wire(msg: impl Into<String>) -> Self {
        BmsError::WireError(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        BmsError::ConnectionError(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        BmsError::DecodeRange(msg.into())
    }

    pub fn channel(msg: impl Into<String>) -> Self {
        BmsError::ChannelError(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        BmsError::IoError(msg.into())
    }

    pub fn not_connected() -> Self {
        BmsError::ConnectionError("Not connected".to_string())
    }

    /// Whether the transport should be dropped and re-established
    pub fn breaks_connection(&self) -> bool {
        matches!(self, BmsError::ConnectionError(_) | BmsError::IoError(_))
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<std::io::Error> for BmsError {
    fn from(err: std::io::Error) -> Self {
        BmsError::IoError(err.to_string())
    }
}

impl From<tokio_serial::Error> for BmsError {
    fn from(err: tokio_serial::Error) -> Self {
        BmsError::ConnectionError(format!("Serial: {err}"))
    }
}

impl From<serde_yaml::Error> for BmsError {
    fn from(err: serde_yaml::Error) -> Self {
        BmsError::ConfigError(format!("YAML: {err}"))
    }
}

// ============================================================================
// Extension trait for adding context to errors
// ============================================================================

/// Extension trait for adding context to errors
pub trait ErrorExt<T> {
    fn config_error(self, msg: &str) -> Result<T>;
    fn wire_error(self, msg: &str) -> Result<T>;
}

impl<T, E> ErrorExt<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn config_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| BmsError::ConfigError(format!("{msg}: {e}")))
    }

    fn wire_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| BmsError::WireError(format!("{msg}: {e}")))
    }
}

// ============================================================================
// VoltageErrorTrait implementation
// ============================================================================

impl VoltageErrorTrait for BmsError {
    fn error_code(&self) -> &'static str {
        match self {
            BmsError::ConfigError(_) => "BMS_CONFIG_ERROR",
            BmsError::WireTimeout(_) => "BMS_WIRE_TIMEOUT",
            BmsError::WireError(_) => "BMS_WIRE_ERROR",
            BmsError::Exception { .. } => "BMS_MODBUS_EXCEPTION",
            BmsError::ConnectionError(_) => "BMS_CONNECTION_ERROR",
            BmsError::DecodeRange(_) => "BMS_DECODE_RANGE",
            BmsError::EncodeRange { .. } => "BMS_ENCODE_RANGE",
            BmsError::ChannelError(_) => "BMS_CHANNEL_ERROR",
            BmsError::IoError(_) => "BMS_IO_ERROR",
            BmsError::Cancelled => "BMS_CANCELLED",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            BmsError::ConfigError(_) => ErrorCategory::Configuration,
            BmsError::WireTimeout(_) => ErrorCategory::Timeout,
            BmsError::WireError(_) | BmsError::Exception { .. } => ErrorCategory::Protocol,
            BmsError::ConnectionError(_) => ErrorCategory::Connection,
            BmsError::DecodeRange(_) => ErrorCategory::DataCorruption,
            BmsError::EncodeRange { .. } | BmsError::ChannelError(_) => {
                ErrorCategory::Validation
            },
            BmsError::IoError(_) => ErrorCategory::Network,
            BmsError::Cancelled => ErrorCategory::Internal,
        }
    }

    fn is_retryable(&self) -> bool {
        match self {
            // Device busy / acknowledge are worth retrying next cycle
            BmsError::Exception { code, .. } => matches!(code, 0x05 | 0x06),
            _ => matches!(
                self.category(),
                ErrorCategory::Network | ErrorCategory::Timeout | ErrorCategory::Connection
            ),
        }
    }
}

// ============================================================================
// Conversion to VoltageError
// ============================================================================

impl From<BmsError> for VoltageError {
    fn from(err: BmsError) -> Self {
        match err {
            BmsError::ConfigError(msg) => VoltageError::Configuration(msg),
            BmsError::WireTimeout(msg) => VoltageError::Timeout(msg),
            BmsError::WireError(msg) => VoltageError::Modbus(msg),
            e @ BmsError::Exception { .. } => VoltageError::Modbus(e.to_string()),
            BmsError::ConnectionError(msg) => VoltageError::Communication(msg),
            BmsError::DecodeRange(msg) => VoltageError::Validation(msg),
            BmsError::EncodeRange {
                value, min, max, ..
            } => VoltageError::OutOfRange {
                value: value.to_string(),
                min: min.to_string(),
                max: max.to_string(),
            },
            BmsError::ChannelError(msg) => VoltageError::Channel(msg),
            BmsError::IoError(msg) => VoltageError::Communication(msg),
            BmsError::Cancelled => VoltageError::Shutdown("operation cancelled".to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BmsError::timeout("unit 1").is_retryable());
        assert!(BmsError::not_connected().is_retryable());
        assert!(!BmsError::config("bad task").is_retryable());
        assert!(!BmsError::decode("enum 7").is_retryable());

        let busy = BmsError::Exception {
            function: 0x03,
            code: 0x06,
            description: "Slave Device Busy",
        };
        assert!(busy.is_retryable());

        let illegal = BmsError::Exception {
            function: 0x03,
            code: 0x02,
            description: "Illegal Data Address",
        };
        assert!(!illegal.is_retryable());
    }

    #[test]
    fn test_breaks_connection() {
        assert!(BmsError::io("broken pipe").breaks_connection());
        assert!(BmsError::not_connected().breaks_connection());
        assert!(!BmsError::timeout("slow").breaks_connection());
        assert!(!BmsError::wire("bad crc").breaks_connection());
    }

    #[test]
    fn test_encode_range_display_and_conversion() {
        let err = BmsError::EncodeRange {
            channel: "CONTACTOR_CONTROL".to_string(),
            value: 70000.0,
            min: 0.0,
            max: 65535.0,
        };
        assert_eq!(
            err.to_string(),
            "Encode range error: CONTACTOR_CONTROL: 70000 not in [0, 65535]"
        );
        assert_eq!(err.error_code(), "BMS_ENCODE_RANGE");

        let voltage: VoltageError = err.into();
        assert!(matches!(voltage, VoltageError::OutOfRange { .. }));
    }

    #[test]
    fn test_error_ext_context() {
        let res: std::result::Result<(), &str> = Err("boom");
        let err = res.config_error("loading bridges").unwrap_err();
        assert_eq!(err, BmsError::config("loading bridges: boom"));
    }
}
