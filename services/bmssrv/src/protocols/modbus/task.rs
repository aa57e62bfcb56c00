//! Modbus tasks
//!
//! A task is one Modbus transaction template: a start address, an ordered list
//! of contiguous register elements, an operation and a priority. Read tasks
//! produce decoded channel values; write tasks turn pending channel values into
//! one request per contiguous run.

use std::fmt;

use tracing::warn;

use super::codec::{ElementKind, RegisterElement};
use super::constants::{
    FC_READ_HOLDING_REGISTERS, FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_REGISTER,
    MODBUS_MAX_READ_REGISTERS, MODBUS_MAX_WRITE_REGISTERS,
};
use super::pdu::{ModbusPdu, PduBuilder};
use crate::core::channel::{ChannelId, ChannelStore, Decoded};
use crate::error::{BmsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    /// Executed every cycle
    High,
    /// Executed round-robin, a bounded number per cycle
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// FC3
    ReadHolding,
    /// FC6
    WriteSingle,
    /// FC16
    WriteMultiple,
}

impl Operation {
    pub fn function_code(self) -> u8 {
        match self {
            Operation::ReadHolding => FC_READ_HOLDING_REGISTERS,
            Operation::WriteSingle => FC_WRITE_SINGLE_REGISTER,
            Operation::WriteMultiple => FC_WRITE_MULTIPLE_REGISTERS,
        }
    }

    pub fn is_write(self) -> bool {
        !matches!(self, Operation::ReadHolding)
    }
}

/// Words of one write request and the channels they carry
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRun {
    pub start: u16,
    pub words: Vec<u16>,
    pub channels: Vec<ChannelId>,
}

#[derive(Debug, Clone)]
pub struct Task {
    start: u16,
    operation: Operation,
    priority: Priority,
    elements: Vec<RegisterElement>,
}

impl Task {
    pub fn read(start: u16, priority: Priority, elements: Vec<RegisterElement>) -> Self {
        Self {
            start,
            operation: Operation::ReadHolding,
            priority,
            elements,
        }
    }

    pub fn write_single(element: RegisterElement, priority: Priority) -> Self {
        Self {
            start: element.address(),
            operation: Operation::WriteSingle,
            priority,
            elements: vec![element],
        }
    }

    pub fn write_multiple(start: u16, priority: Priority, elements: Vec<RegisterElement>) -> Self {
        Self {
            start,
            operation: Operation::WriteMultiple,
            priority,
            elements,
        }
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn elements(&self) -> &[RegisterElement] {
        &self.elements
    }

    pub fn is_write(&self) -> bool {
        self.operation.is_write()
    }

    /// Total number of registers covered
    pub fn span(&self) -> u32 {
        self.elements.iter().map(|e| u32::from(e.width())).sum()
    }

    /// Every channel bound by the task's elements
    pub fn channels(&self) -> Vec<ChannelId> {
        self.elements.iter().flat_map(RegisterElement::channels).collect()
    }

    // ========================================================================
    // Validation
    // ========================================================================

    /// Check the task definition against the device's channel store
    pub fn validate(&self, store: &ChannelStore) -> Result<()> {
        let first = self
            .elements
            .first()
            .ok_or_else(|| BmsError::config(format!("{}: no elements", self)))?;

        if first.address() != self.start {
            return Err(BmsError::config(format!(
                "{}: first element at 0x{:04X} does not match start address",
                self,
                first.address()
            )));
        }

        let mut expected = u32::from(self.start);
        for element in &self.elements {
            if u32::from(element.address()) != expected {
                return Err(BmsError::config(format!(
                    "{}: element at 0x{:04X} is not contiguous (expected 0x{:04X})",
                    self,
                    element.address(),
                    expected
                )));
            }
            if element.width() == 0 {
                return Err(BmsError::config(format!(
                    "{}: empty element at 0x{:04X}",
                    self,
                    element.address()
                )));
            }
            expected = element.end();
            self.validate_element(element, store)?;
        }

        if expected > 0x1_0000 {
            return Err(BmsError::config(format!(
                "{}: address range exceeds 0xFFFF",
                self
            )));
        }

        let span = self.span() as usize;
        match self.operation {
            Operation::ReadHolding if span > MODBUS_MAX_READ_REGISTERS => Err(BmsError::config(
                format!("{}: read span {} exceeds {}", self, span, MODBUS_MAX_READ_REGISTERS),
            )),
            Operation::WriteMultiple if span > MODBUS_MAX_WRITE_REGISTERS => {
                Err(BmsError::config(format!(
                    "{}: write span {} exceeds {}",
                    self, span, MODBUS_MAX_WRITE_REGISTERS
                )))
            },
            Operation::WriteSingle if span != 1 || self.elements.len() != 1 => Err(
                BmsError::config(format!("{}: FC6 must span exactly one word", self)),
            ),
            _ => Ok(()),
        }
    }

    fn validate_element(&self, element: &RegisterElement, store: &ChannelStore) -> Result<()> {
        let at = element.address();
        match element.kind() {
            ElementKind::Dummy { .. } if self.is_write() => Err(BmsError::config(format!(
                "{}: dummy element at 0x{:04X} in a write task",
                self, at
            ))),
            ElementKind::Bits(_) if self.is_write() => Err(BmsError::config(format!(
                "{}: bit field at 0x{:04X} in a write task",
                self, at
            ))),
            ElementKind::Dummy { .. } => Ok(()),
            ElementKind::Bits(map) => {
                for &(index, channel) in map {
                    if index >= 16 {
                        return Err(BmsError::config(format!(
                            "{}: bit {} out of range at 0x{:04X}",
                            self, index, at
                        )));
                    }
                    store.get(channel).map_err(|e| BmsError::config(e.to_string()))?;
                }
                Ok(())
            },
            _ => {
                let channel = element.channel().ok_or_else(|| {
                    BmsError::config(format!("{}: element at 0x{:04X} has no channel", self, at))
                })?;
                let access = store
                    .get(channel)
                    .map_err(|e| BmsError::config(e.to_string()))?
                    .access();
                if self.is_write() && !access.is_writable() {
                    return Err(BmsError::config(format!(
                        "{}: channel {} at 0x{:04X} is not writable",
                        self, channel, at
                    )));
                }
                if !self.is_write() && !access.is_readable() {
                    return Err(BmsError::config(format!(
                        "{}: channel {} at 0x{:04X} is not readable",
                        self, channel, at
                    )));
                }
                Ok(())
            },
        }
    }

    /// Record element scales and write ranges on the bound channels
    pub fn bind(&self, store: &mut ChannelStore) -> Result<()> {
        for element in &self.elements {
            let Some(channel) = element.channel() else {
                continue;
            };
            if self.is_write() {
                if let Some(range) = element.write_range() {
                    store.bind_write_range(channel, range)?;
                }
            } else if element.is_value() {
                store.set_scale(channel, element.scale_exponent())?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Read
    // ========================================================================

    pub fn read_request(&self) -> Result<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(FC_READ_HOLDING_REGISTERS)?
            .address(self.start)?
            .quantity(self.span() as u16)?
            .build())
    }

    /// Decode an FC3 response into channel updates
    ///
    /// A response that is not a well-formed FC3 reply is a wire error and
    /// nothing is decoded. A short but well-formed reply decodes the elements
    /// it covers; the remaining channels come back invalid.
    pub fn decode_response(&self, pdu: &ModbusPdu, store: &ChannelStore) -> Result<Vec<Decoded>> {
        let data = pdu.as_slice();
        if pdu.function_code() != Some(FC_READ_HOLDING_REGISTERS) {
            return Err(BmsError::wire(format!(
                "{}: unexpected function code {:?}",
                self,
                pdu.function_code()
            )));
        }
        let byte_count = *data
            .get(1)
            .ok_or_else(|| BmsError::wire(format!("{}: response without byte count", self)))?
            as usize;
        if data.len() != 2 + byte_count || byte_count % 2 != 0 {
            return Err(BmsError::wire(format!(
                "{}: byte count {} does not match payload of {} bytes",
                self,
                byte_count,
                data.len().saturating_sub(2)
            )));
        }
        if byte_count > self.span() as usize * 2 {
            return Err(BmsError::wire(format!(
                "{}: {} registers returned, {} requested",
                self,
                byte_count / 2,
                self.span()
            )));
        }

        let words: Vec<u16> = data[2..]
            .chunks_exact(2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .collect();

        let mut decoded = Vec::with_capacity(self.elements.len());
        for element in &self.elements {
            let offset = usize::from(element.address().saturating_sub(self.start));
            let end = (offset + usize::from(element.width())).min(words.len());
            let slice = words.get(offset..end).unwrap_or(&[]);
            if let Err(e) = element.decode_into(slice, store, &mut decoded) {
                warn!("{}: {}", self, e);
            }
        }
        Ok(decoded)
    }

    // ========================================================================
    // Write
    // ========================================================================

    pub fn has_pending_writes(&self, store: &ChannelStore) -> bool {
        self.is_write()
            && self.elements.iter().any(|e| {
                e.channel()
                    .and_then(|ch| store.get(ch).ok())
                    .map(|c| c.has_pending_write())
                    .unwrap_or(false)
            })
    }

    /// Encode pending values into requests
    ///
    /// FC16 tasks send each maximal run of contiguous pending elements as one
    /// request. Values that cannot be encoded are returned separately and never
    /// reach the wire.
    pub fn prepare_writes(
        &self,
        store: &ChannelStore,
    ) -> (Vec<WriteRun>, Vec<(ChannelId, BmsError)>) {
        let mut runs: Vec<WriteRun> = Vec::new();
        let mut rejected = Vec::new();
        let mut open = false;

        for element in &self.elements {
            let pending = element
                .channel()
                .and_then(|ch| store.get(ch).ok().map(|c| (ch, c)))
                .and_then(|(ch, c)| c.next_write().map(|v| (ch, c.name(), v)));

            let Some((channel, name, value)) = pending else {
                open = false;
                continue;
            };

            match element.encode(value, name) {
                Ok(words) => match runs.last_mut() {
                    Some(run) if open => {
                        run.words.extend(words);
                        run.channels.push(channel);
                    },
                    _ => {
                        runs.push(WriteRun {
                            start: element.address(),
                            words,
                            channels: vec![channel],
                        });
                        open = self.operation == Operation::WriteMultiple;
                    },
                },
                Err(e) => {
                    rejected.push((channel, e));
                    open = false;
                },
            }
        }

        (runs, rejected)
    }

    pub fn write_request(&self, run: &WriteRun) -> Result<ModbusPdu> {
        match self.operation {
            Operation::WriteSingle => {
                let word = run
                    .words
                    .first()
                    .copied()
                    .ok_or_else(|| BmsError::wire(format!("{}: empty write", self)))?;
                Ok(PduBuilder::new()
                    .function_code(FC_WRITE_SINGLE_REGISTER)?
                    .address(run.start)?
                    .quantity(word)?
                    .build())
            },
            Operation::WriteMultiple => Ok(PduBuilder::new()
                .function_code(FC_WRITE_MULTIPLE_REGISTERS)?
                .address(run.start)?
                .quantity(run.words.len() as u16)?
                .byte((run.words.len() * 2) as u8)?
                .words(&run.words)?
                .build()),
            Operation::ReadHolding => Err(BmsError::config(format!("{}: not a write task", self))),
        }
    }

    /// Check the echo of a write response
    pub fn check_write_response(&self, run: &WriteRun, pdu: &ModbusPdu) -> Result<()> {
        let fc = self.operation.function_code();
        let echoed = match self.operation {
            Operation::WriteSingle => run.words.first().copied(),
            _ => Some(run.words.len() as u16),
        };
        if pdu.function_code() != Some(fc)
            || pdu.u16_at(1) != Some(run.start)
            || pdu.u16_at(3) != echoed
        {
            return Err(BmsError::wire(format!(
                "{}: write response does not echo the request: {:02X?}",
                self,
                pdu.as_slice()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FC{:02} 0x{:04X}+{}",
            self.operation.function_code(),
            self.start,
            self.span()
        )
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::channel::{AccessMode, ChannelDoc, ChannelType, Value};
    use crate::protocols::modbus::codec::WordOrder;

    fn rw(store: &mut ChannelStore, name: &'static str) -> ChannelId {
        store
            .add(ChannelDoc::new(name, ChannelType::Integer, AccessMode::ReadWrite))
            .unwrap()
    }

    fn read_only(store: &mut ChannelStore, name: &'static str) -> ChannelId {
        store.add(ChannelDoc::read(name, ChannelType::Integer)).unwrap()
    }

    #[test]
    fn test_validate_accepts_contiguous_read() {
        let mut store = ChannelStore::new();
        let a = read_only(&mut store, "A");
        let b = read_only(&mut store, "B");
        let task = Task::read(
            0x2100,
            Priority::High,
            vec![
                RegisterElement::unsigned_word(0x2100).map(a),
                RegisterElement::dummy(0x2101, 0x2102),
                RegisterElement::signed_double_word(0x2103, WordOrder::HighWordFirst).map(b),
            ],
        );
        task.validate(&store).unwrap();
        assert_eq!(task.span(), 5);
        assert_eq!(task.channels(), vec![a, b]);
    }

    #[test]
    fn test_validate_rejects_gap() {
        let mut store = ChannelStore::new();
        let a = read_only(&mut store, "A");
        let b = read_only(&mut store, "B");
        let task = Task::read(
            0x0000,
            Priority::Low,
            vec![
                RegisterElement::unsigned_word(0x0000).map(a),
                RegisterElement::unsigned_word(0x0002).map(b),
            ],
        );
        assert!(matches!(task.validate(&store), Err(BmsError::ConfigError(_))));
    }

    #[test]
    fn test_validate_rejects_oversized_read() {
        let store = ChannelStore::new();
        let task = Task::read(0, Priority::Low, vec![RegisterElement::dummy(0, 125)]);
        assert!(task.validate(&store).is_err());

        let ok = Task::read(0, Priority::Low, vec![RegisterElement::dummy(0, 124)]);
        assert!(ok.validate(&store).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_write_tasks() {
        let mut store = ChannelStore::new();
        let ro = read_only(&mut store, "RO");
        let a = rw(&mut store, "A");

        let to_read_only = Task::write_single(RegisterElement::unsigned_word(0x10).map(ro), Priority::High);
        assert!(to_read_only.validate(&store).is_err());

        let double_fc6 = Task::write_single(
            RegisterElement::unsigned_double_word(0x10, WordOrder::LowWordFirst).map(a),
            Priority::High,
        );
        assert!(double_fc6.validate(&store).is_err());

        let with_dummy = Task::write_multiple(
            0x10,
            Priority::High,
            vec![
                RegisterElement::unsigned_word(0x10).map(a),
                RegisterElement::dummy(0x11, 0x11),
            ],
        );
        assert!(with_dummy.validate(&store).is_err());

        let with_bits = Task::write_multiple(0x10, Priority::High, vec![RegisterElement::bits(0x10).bit(0, a)]);
        assert!(with_bits.validate(&store).is_err());
    }

    #[test]
    fn test_decode_response_short_reply_invalidates_tail() {
        let mut store = ChannelStore::new();
        let a = read_only(&mut store, "A");
        let b = read_only(&mut store, "B");
        let task = Task::read(
            0x0000,
            Priority::High,
            vec![
                RegisterElement::unsigned_word(0x0000).map(a),
                RegisterElement::unsigned_word(0x0001).map(b),
            ],
        );
        let pdu = ModbusPdu::from_slice(&[0x03, 0x02, 0x00, 0x2A]).unwrap();
        let decoded = task.decode_response(&pdu, &store).unwrap();
        assert_eq!(
            decoded,
            vec![Decoded::Value(a, Value::Int(42)), Decoded::Invalid(b)]
        );
    }

    #[test]
    fn test_decode_response_rejects_malformed() {
        let mut store = ChannelStore::new();
        let a = read_only(&mut store, "A");
        let task = Task::read(0, Priority::High, vec![RegisterElement::unsigned_word(0).map(a)]);

        let wrong_fc = ModbusPdu::from_slice(&[0x04, 0x02, 0x00, 0x01]).unwrap();
        assert!(matches!(task.decode_response(&wrong_fc, &store), Err(BmsError::WireError(_))));

        let bad_count = ModbusPdu::from_slice(&[0x03, 0x04, 0x00, 0x01]).unwrap();
        assert!(task.decode_response(&bad_count, &store).is_err());

        let too_long = ModbusPdu::from_slice(&[0x03, 0x04, 0x00, 0x01, 0x00, 0x02]).unwrap();
        assert!(task.decode_response(&too_long, &store).is_err());
    }

    #[test]
    fn test_prepare_writes_splits_contiguous_runs() {
        let mut store = ChannelStore::new();
        let a = rw(&mut store, "A");
        let b = rw(&mut store, "B");
        let c = rw(&mut store, "C");
        let task = Task::write_multiple(
            0x1017,
            Priority::High,
            vec![
                RegisterElement::unsigned_word(0x1017).map(a),
                RegisterElement::unsigned_word(0x1018).map(b),
                RegisterElement::unsigned_word(0x1019).map(c),
            ],
        );
        task.validate(&store).unwrap();
        task.bind(&mut store).unwrap();

        store.set_next_write(a, Value::Int(1)).unwrap();
        store.set_next_write(c, Value::Int(0)).unwrap();

        let (runs, rejected) = task.prepare_writes(&store);
        assert!(rejected.is_empty());
        assert_eq!(
            runs,
            vec![
                WriteRun { start: 0x1017, words: vec![1], channels: vec![a] },
                WriteRun { start: 0x1019, words: vec![0], channels: vec![c] },
            ]
        );

        store.set_next_write(b, Value::Int(1)).unwrap();
        let (runs, _) = task.prepare_writes(&store);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].words, vec![1, 1, 0]);

        let request = task.write_request(&runs[0]).unwrap();
        assert_eq!(
            request.as_slice(),
            &[0x10, 0x10, 0x17, 0x00, 0x03, 0x06, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00]
        );
        let echo = ModbusPdu::from_slice(&[0x10, 0x10, 0x17, 0x00, 0x03]).unwrap();
        task.check_write_response(&runs[0], &echo).unwrap();
    }

    #[test]
    fn test_write_single_request_and_echo() {
        let mut store = ChannelStore::new();
        let a = rw(&mut store, "CONTACTOR");
        let task = Task::write_single(RegisterElement::unsigned_word(0x2010).map(a), Priority::High);
        task.validate(&store).unwrap();
        assert!(!task.has_pending_writes(&store));

        store.set_next_write(a, Value::Int(1)).unwrap();
        assert!(task.has_pending_writes(&store));

        let (runs, _) = task.prepare_writes(&store);
        let request = task.write_request(&runs[0]).unwrap();
        assert_eq!(request.as_slice(), &[0x06, 0x20, 0x10, 0x00, 0x01]);
        task.check_write_response(&runs[0], &request).unwrap();

        let wrong = ModbusPdu::from_slice(&[0x06, 0x20, 0x10, 0x00, 0x00]).unwrap();
        assert!(task.check_write_response(&runs[0], &wrong).is_err());
    }
}
