//! Modbus transport framing
//!
//! Frame building and parsing for both TCP (MBAP header) and RTU (CRC-16)
//! transport modes.

use tracing::trace;

use super::constants::{
    EXCEPTION_FLAG, FC_READ_HOLDING_REGISTERS, FC_WRITE_MULTIPLE_REGISTERS,
    FC_WRITE_SINGLE_REGISTER, MAX_MBAP_LENGTH, MBAP_HEADER_LEN,
};
use super::pdu::ModbusPdu;
use crate::error::{BmsError, Result};

/// Modbus transport mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModbusMode {
    /// TCP mode (using MBAP header)
    Tcp,
    /// RTU mode (using CRC check)
    Rtu,
}

/// Modbus TCP MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Unit id + PDU bytes
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    /// Parse the 7 header bytes (including the unit id)
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < MBAP_HEADER_LEN + 1 {
            return Err(BmsError::wire("TCP frame too short"));
        }
        let header = Self {
            transaction_id: u16::from_be_bytes([data[0], data[1]]),
            protocol_id: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
            unit_id: data[6],
        };
        if header.protocol_id != 0 {
            return Err(BmsError::wire(format!(
                "Invalid MBAP protocol id {}",
                header.protocol_id
            )));
        }
        if header.length < 2 || usize::from(header.length) > MAX_MBAP_LENGTH {
            return Err(BmsError::wire(format!(
                "Invalid MBAP length {}",
                header.length
            )));
        }
        Ok(header)
    }

    /// PDU bytes following the header
    pub fn pdu_len(&self) -> usize {
        usize::from(self.length) - 1
    }
}

/// Frame a parsed response came in
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFrame {
    /// Only set in TCP mode
    pub transaction_id: Option<u16>,
    pub unit_id: u8,
    pub pdu: ModbusPdu,
}

/// Modbus frame processor
#[derive(Debug)]
pub struct ModbusFrameProcessor {
    mode: ModbusMode,
    next_transaction_id: u16,
}

impl ModbusFrameProcessor {
    pub fn new(mode: ModbusMode) -> Self {
        Self {
            mode,
            next_transaction_id: 1,
        }
    }

    pub fn mode(&self) -> ModbusMode {
        self.mode
    }

    /// Next transaction ID (TCP mode only), never 0
    pub fn next_transaction_id(&mut self) -> u16 {
        let id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
        if self.next_transaction_id == 0 {
            self.next_transaction_id = 1;
        }
        id
    }

    /// Build a complete request frame; returns the transaction id in TCP mode
    pub fn build_frame(&mut self, unit_id: u8, pdu: &ModbusPdu) -> (Vec<u8>, Option<u16>) {
        match self.mode {
            ModbusMode::Tcp => {
                let transaction_id = self.next_transaction_id();
                (
                    build_tcp_frame(transaction_id, unit_id, pdu.as_slice()),
                    Some(transaction_id),
                )
            },
            ModbusMode::Rtu => (build_rtu_frame(unit_id, pdu.as_slice()), None),
        }
    }

    pub fn parse_frame(&self, data: &[u8]) -> Result<ParsedFrame> {
        match self.mode {
            ModbusMode::Tcp => parse_tcp_frame(data),
            ModbusMode::Rtu => parse_rtu_frame(data),
        }
    }

    /// Exception description
    pub fn exception_description(exception_code: u8) -> &'static str {
        match exception_code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Slave Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Slave Device Busy",
            0x07 => "Negative Acknowledge",
            0x08 => "Memory Parity Error",
            0x0A => "Gateway Path Unavailable",
            0x0B => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        }
    }

    /// Turn an exception response into [`BmsError::Exception`]
    pub fn check_exception(pdu: &ModbusPdu) -> Result<()> {
        if !pdu.is_exception() {
            return Ok(());
        }
        let function = pdu.function_code().unwrap_or(EXCEPTION_FLAG) & !EXCEPTION_FLAG;
        let code = pdu
            .exception_code()
            .ok_or_else(|| BmsError::wire("Invalid exception response"))?;
        Err(BmsError::Exception {
            function,
            code,
            description: Self::exception_description(code),
        })
    }
}

/// Total length of an RTU response, given its first bytes
///
/// Returns `None` until enough bytes are known to decide.
pub fn expected_rtu_length(partial: &[u8]) -> Option<usize> {
    let fc = *partial.get(1)?;
    if fc & EXCEPTION_FLAG != 0 {
        return Some(5);
    }
    match fc {
        FC_READ_HOLDING_REGISTERS => partial.get(2).map(|&n| 3 + usize::from(n) + 2),
        FC_WRITE_SINGLE_REGISTER | FC_WRITE_MULTIPLE_REGISTERS => Some(8),
        // Unknown function: caller falls back to the inter-frame silence
        _ => None,
    }
}

fn build_tcp_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let length = (pdu.len() + 1) as u16;
    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + 1 + pdu.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    frame
}

fn build_rtu_frame(unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + pdu.len() + 2);
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    let crc = calculate_crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

fn parse_tcp_frame(data: &[u8]) -> Result<ParsedFrame> {
    let header = MbapHeader::parse(data)?;
    if data.len() != MBAP_HEADER_LEN + usize::from(header.length) {
        return Err(BmsError::wire("Invalid TCP frame length"));
    }
    let pdu = ModbusPdu::from_slice(&data[MBAP_HEADER_LEN + 1..])?;

    trace!(
        "Parsed TCP frame: trans_id={:04X}, unit_id={}, pdu_len={}",
        header.transaction_id,
        header.unit_id,
        pdu.len()
    );

    Ok(ParsedFrame {
        transaction_id: Some(header.transaction_id),
        unit_id: header.unit_id,
        pdu,
    })
}

fn parse_rtu_frame(data: &[u8]) -> Result<ParsedFrame> {
    if data.len() < 4 {
        return Err(BmsError::wire("RTU frame too short"));
    }

    let frame_len = data.len();
    let received_crc = u16::from_le_bytes([data[frame_len - 2], data[frame_len - 1]]);
    let calculated_crc = calculate_crc16(&data[..frame_len - 2]);
    if received_crc != calculated_crc {
        return Err(BmsError::wire(format!(
            "CRC mismatch: expected 0x{calculated_crc:04X}, got 0x{received_crc:04X}"
        )));
    }

    Ok(ParsedFrame {
        transaction_id: None,
        unit_id: data[0],
        pdu: ModbusPdu::from_slice(&data[1..frame_len - 2])?,
    })
}

/// CRC16 checksum (Modbus RTU, polynomial 0xA001)
pub fn calculate_crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc >>= 1;
                crc ^= 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}
