//! Modbus protocol constants
//!
//! Limits follow from the 253 byte PDU (RS485 ADU of 256 bytes minus slave
//! address and CRC).

// ============================================================================
// Function codes
// ============================================================================

pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Frame Size Constants
// ============================================================================

/// MBAP header bytes preceding the unit id
/// Transaction ID(2) + Protocol ID(2) + Length(2)
pub const MBAP_HEADER_LEN: usize = 6;

/// Maximum PDU (Protocol Data Unit) size
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (Unit ID + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Largest RTU ADU: unit id + PDU + CRC
pub const MAX_RTU_FRAME: usize = 1 + MAX_PDU_SIZE + 2;

// ============================================================================
// Register Operation Limits
// ============================================================================

/// FC03 response: 1 (fc) + 1 (byte count) + N * 2 <= 253
pub const MODBUS_MAX_READ_REGISTERS: usize = 125;

/// FC16 request: 1 (fc) + 2 (addr) + 2 (qty) + 1 (byte count) + N * 2 <= 253
pub const MODBUS_MAX_WRITE_REGISTERS: usize = 123;

/// Human-readable function code
pub fn function_code_description(fc: u8) -> &'static str {
    match fc & !EXCEPTION_FLAG {
        FC_READ_HOLDING_REGISTERS => "Read Holding Registers",
        FC_WRITE_SINGLE_REGISTER => "Write Single Register",
        FC_WRITE_MULTIPLE_REGISTERS => "Write Multiple Registers",
        _ => "Unsupported Function",
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_register_limits_fit_pdu() {
        assert!(1 + 1 + MODBUS_MAX_READ_REGISTERS * 2 <= MAX_PDU_SIZE);
        assert!(1 + 2 + 2 + 1 + MODBUS_MAX_WRITE_REGISTERS * 2 <= MAX_PDU_SIZE);
        assert_eq!(MAX_MBAP_LENGTH, 254);
        assert_eq!(MAX_RTU_FRAME, 256);
    }

    #[test]
    fn test_function_code_description_ignores_exception_bit() {
        assert_eq!(function_code_description(0x83), "Read Holding Registers");
        assert_eq!(function_code_description(0x10), "Write Multiple Registers");
        assert_eq!(function_code_description(0x01), "Unsupported Function");
    }
}
