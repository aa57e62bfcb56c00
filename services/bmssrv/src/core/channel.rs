//! Channel model
//!
//! A channel is a named, typed cell owned by exactly one device. It carries the
//! last decoded value, an optional pending write ("next") value and a validity
//! flag. Channels are created once when the device model is built and are
//! addressed by [`ChannelId`], an index into the owning [`ChannelStore`].

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::error::{BmsError, Result};
use crate::protocols::modbus::codec::unscale;

/// Index of a channel inside its device's [`ChannelStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChannelId(pub u16);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Channel access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    #[inline]
    pub fn is_writable(self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite)
    }

    #[inline]
    pub fn is_readable(self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }
}

/// Allowed discriminants of an enum-typed channel
pub type EnumOptions = &'static [(i64, &'static str)];

/// Semantic type of a channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChannelType {
    Integer,
    Decimal,
    Boolean,
    Enum(EnumOptions),
}

impl ChannelType {
    /// Name of the enum option for `value`, if this is an enum and the value is known
    pub fn option_name(&self, value: i64) -> Option<&'static str> {
        match self {
            ChannelType::Enum(options) => options
                .iter()
                .find(|(v, _)| *v == value)
                .map(|(_, name)| *name),
            _ => None,
        }
    }
}

/// Channel value
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Value {
    pub fn as_f64(&self) -> f64 {
        match *self {
            Value::Int(v) => v as f64,
            Value::Float(v) => v,
            Value::Bool(v) => {
                if v {
                    1.0
                } else {
                    0.0
                }
            },
        }
    }

    /// Integer view; decimals are rounded
    pub fn as_i64(&self) -> i64 {
        match *self {
            Value::Int(v) => v,
            Value::Float(v) => v.round() as i64,
            Value::Bool(v) => i64::from(v),
        }
    }

    pub fn as_bool(&self) -> bool {
        match *self {
            Value::Int(v) => v != 0,
            Value::Float(v) => v != 0.0,
            Value::Bool(v) => v,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
        }
    }
}

/// Whether the current value reflects the last bus exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Validity {
    Valid,
    Invalid,
}

/// Static declaration of a channel, as written in device tables
#[derive(Debug, Clone, Copy)]
pub struct ChannelDoc {
    pub name: &'static str,
    pub kind: ChannelType,
    pub access: AccessMode,
    pub unit: Option<&'static str>,
}

impl ChannelDoc {
    pub const fn new(name: &'static str, kind: ChannelType, access: AccessMode) -> Self {
        Self {
            name,
            kind,
            access,
            unit: None,
        }
    }

    pub const fn read(name: &'static str, kind: ChannelType) -> Self {
        Self::new(name, kind, AccessMode::Read)
    }

    pub const fn with_unit(mut self, unit: &'static str) -> Self {
        self.unit = Some(unit);
        self
    }
}

/// Representable range of the write element bound to a channel, in engineering units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WriteRange {
    pub min: f64,
    pub max: f64,
    /// Decimal scale of the element; values are rounded to 10^scale on encode
    pub scale: i8,
}

impl WriteRange {
    /// Whether `value` fits once rounded to the register resolution
    pub fn accepts(&self, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        let raw = |v: f64| unscale(v, self.scale).round();
        let r = raw(value);
        r >= raw(self.min) && r <= raw(self.max)
    }
}

#[derive(Debug, Clone)]
pub struct Channel {
    doc: ChannelDoc,
    current: Option<Value>,
    next: Option<Value>,
    validity: Validity,
    scale: Option<i8>,
    write_range: Option<WriteRange>,
}

impl Channel {
    fn new(doc: ChannelDoc) -> Self {
        Self {
            doc,
            current: None,
            next: None,
            validity: Validity::Invalid,
            scale: None,
            write_range: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.doc.name
    }

    pub fn kind(&self) -> ChannelType {
        self.doc.kind
    }

    pub fn access(&self) -> AccessMode {
        self.doc.access
    }

    pub fn unit(&self) -> Option<&'static str> {
        self.doc.unit
    }

    /// Scale exponent of the register element this channel is read through
    pub fn scale(&self) -> Option<i8> {
        self.scale
    }

    /// Last decoded (or last successfully written) value, regardless of validity
    pub fn current(&self) -> Option<Value> {
        self.current
    }

    /// Current value, only while the channel is valid
    pub fn value(&self) -> Option<Value> {
        match self.validity {
            Validity::Valid => self.current,
            Validity::Invalid => None,
        }
    }

    pub fn next_write(&self) -> Option<Value> {
        self.next
    }

    pub fn has_pending_write(&self) -> bool {
        self.next.is_some()
    }

    pub fn validity(&self) -> Validity {
        self.validity
    }

    pub fn is_valid(&self) -> bool {
        self.validity == Validity::Valid
    }

    pub fn write_range(&self) -> Option<WriteRange> {
        self.write_range
    }
}

/// Serializable view of one channel, published in device snapshots
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSnapshot {
    pub name: &'static str,
    pub value: Option<Value>,
    pub validity: Validity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<Value>,
}

/// Decode outcome for one channel, applied atomically per task
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decoded {
    Value(ChannelId, Value),
    Invalid(ChannelId),
}

/// All channels of one device
#[derive(Debug, Clone, Default)]
pub struct ChannelStore {
    channels: Vec<Channel>,
    by_name: HashMap<&'static str, ChannelId>,
}

impl ChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a channel; names must be unique within a device
    pub fn add(&mut self, doc: ChannelDoc) -> Result<ChannelId> {
        if self.by_name.contains_key(doc.name) {
            return Err(BmsError::config(format!(
                "Duplicate channel name: {}",
                doc.name
            )));
        }
        let index = u16::try_from(self.channels.len())
            .map_err(|_| BmsError::config("Too many channels in one device"))?;
        let id = ChannelId(index);
        self.channels.push(Channel::new(doc));
        self.by_name.insert(doc.name, id);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn get(&self, id: ChannelId) -> Result<&Channel> {
        self.channels
            .get(id.0 as usize)
            .ok_or_else(|| BmsError::channel(format!("Unknown channel {}", id)))
    }

    fn get_mut(&mut self, id: ChannelId) -> Result<&mut Channel> {
        self.channels
            .get_mut(id.0 as usize)
            .ok_or_else(|| BmsError::channel(format!("Unknown channel {}", id)))
    }

    pub fn find(&self, name: &str) -> Option<ChannelId> {
        self.by_name.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChannelId, &Channel)> {
        self.channels
            .iter()
            .enumerate()
            .map(|(i, c)| (ChannelId(i as u16), c))
    }

    /// Valid value of `id`, `None` when unknown, invalid or never read
    pub fn value(&self, id: ChannelId) -> Option<Value> {
        self.get(id).ok().and_then(Channel::value)
    }

    /// Valid boolean value of `id`
    pub fn bool_value(&self, id: ChannelId) -> Option<bool> {
        self.value(id).map(|v| v.as_bool())
    }

    /// Valid integer value of `id`
    pub fn int_value(&self, id: ChannelId) -> Option<i64> {
        self.value(id).map(|v| v.as_i64())
    }

    pub fn is_valid(&self, id: ChannelId) -> bool {
        self.get(id).map(Channel::is_valid).unwrap_or(false)
    }

    /// Set the pending write value of a WRITE or READ_WRITE channel
    ///
    /// Rejected immediately when the channel is read-only, when an enum value is
    /// not one of the declared options, or when the value does not fit the
    /// register element the channel is written through.
    pub fn set_next_write(&mut self, id: ChannelId, value: Value) -> Result<()> {
        let channel = self.get_mut(id)?;

        if !channel.doc.access.is_writable() {
            return Err(BmsError::channel(format!(
                "Channel {} is read-only",
                channel.doc.name
            )));
        }

        if let ChannelType::Enum(options) = channel.doc.kind {
            let raw = value.as_i64();
            if !options.iter().any(|(v, _)| *v == raw) {
                return Err(BmsError::channel(format!(
                    "Value {} is not a valid option for {}",
                    raw, channel.doc.name
                )));
            }
        }

        if let Some(range) = channel.write_range {
            let v = value.as_f64();
            if !range.accepts(v) {
                return Err(BmsError::EncodeRange {
                    channel: channel.doc.name.to_string(),
                    value: v,
                    min: range.min,
                    max: range.max,
                });
            }
        }

        channel.next = Some(value);
        Ok(())
    }

    /// Drop a pending write without sending it
    pub fn clear_pending(&mut self, id: ChannelId) {
        if let Ok(channel) = self.get_mut(id) {
            channel.next = None;
        }
    }

    /// A write of the pending value succeeded on the wire
    pub(crate) fn promote_pending(&mut self, id: ChannelId) {
        if let Ok(channel) = self.get_mut(id) {
            if let Some(next) = channel.next.take() {
                channel.current = Some(next);
                channel.validity = Validity::Valid;
            }
        }
    }

    /// Apply the decode results of one task
    pub(crate) fn apply(&mut self, decoded: &[Decoded]) {
        for item in decoded {
            match *item {
                Decoded::Value(id, value) => {
                    if let Ok(channel) = self.get_mut(id) {
                        channel.current = Some(value);
                        channel.validity = Validity::Valid;
                    }
                },
                Decoded::Invalid(id) => self.invalidate(id),
            }
        }
    }

    /// Mark a channel invalid, keeping its last value
    pub(crate) fn invalidate(&mut self, id: ChannelId) {
        if let Ok(channel) = self.get_mut(id) {
            channel.validity = Validity::Invalid;
        }
    }

    pub(crate) fn set_scale(&mut self, id: ChannelId, scale: i8) -> Result<()> {
        self.get_mut(id)?.scale = Some(scale);
        Ok(())
    }

    /// Record the representable range of the element `id` is written through
    ///
    /// A channel written by several elements keeps the intersection at the
    /// coarser resolution.
    pub(crate) fn bind_write_range(&mut self, id: ChannelId, range: WriteRange) -> Result<()> {
        let channel = self.get_mut(id)?;
        channel.write_range = Some(match channel.write_range {
            Some(existing) => WriteRange {
                min: existing.min.max(range.min),
                max: existing.max.min(range.max),
                scale: existing.scale.max(range.scale),
            },
            None => range,
        });
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<ChannelSnapshot> {
        self.channels
            .iter()
            .map(|c| ChannelSnapshot {
                name: c.doc.name,
                value: c.current,
                validity: c.validity,
                unit: c.doc.unit,
                pending: c.next,
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    const CONTACTOR_OPTIONS: EnumOptions = &[(0, "CUT_OFF"), (1, "CONNECTION_INITIATING"), (3, "ON_GRID")];

    fn store_with_channels() -> (ChannelStore, ChannelId, ChannelId) {
        let mut store = ChannelStore::new();
        let voltage = store
            .add(ChannelDoc::read("VOLTAGE", ChannelType::Decimal).with_unit("V"))
            .unwrap();
        let contactor = store
            .add(ChannelDoc::new(
                "CONTACTOR_CONTROL",
                ChannelType::Enum(CONTACTOR_OPTIONS),
                AccessMode::ReadWrite,
            ))
            .unwrap();
        (store, voltage, contactor)
    }

    #[test]
    fn test_new_channels_are_invalid_and_empty() {
        let (store, voltage, _) = store_with_channels();
        let ch = store.get(voltage).unwrap();
        assert_eq!(ch.validity(), Validity::Invalid);
        assert_eq!(ch.current(), None);
        assert_eq!(store.value(voltage), None);
        assert_eq!(store.find("VOLTAGE"), Some(voltage));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let (mut store, _, _) = store_with_channels();
        let err = store
            .add(ChannelDoc::read("VOLTAGE", ChannelType::Integer))
            .unwrap_err();
        assert!(matches!(err, BmsError::ConfigError(_)));
    }

    #[test]
    fn test_apply_and_invalidate_keeps_last_value() {
        let (mut store, voltage, _) = store_with_channels();
        store.apply(&[Decoded::Value(voltage, Value::Float(51.2))]);
        assert_eq!(store.value(voltage), Some(Value::Float(51.2)));

        store.invalidate(voltage);
        assert_eq!(store.value(voltage), None);
        assert_eq!(store.get(voltage).unwrap().current(), Some(Value::Float(51.2)));
    }

    #[test]
    fn test_set_next_write_rejects_read_only() {
        let (mut store, voltage, _) = store_with_channels();
        let err = store.set_next_write(voltage, Value::Int(1)).unwrap_err();
        assert!(matches!(err, BmsError::ChannelError(_)));
    }

    #[test]
    fn test_set_next_write_rejects_unknown_enum_option() {
        let (mut store, _, contactor) = store_with_channels();
        assert!(store.set_next_write(contactor, Value::Int(2)).is_err());
        assert!(store.set_next_write(contactor, Value::Int(3)).is_ok());
        assert_eq!(
            store.get(contactor).unwrap().next_write(),
            Some(Value::Int(3))
        );
    }

    #[test]
    fn test_set_next_write_checks_bound_range() {
        let mut store = ChannelStore::new();
        let limit = store
            .add(ChannelDoc::new("LIMIT", ChannelType::Decimal, AccessMode::Write))
            .unwrap();
        store
            .bind_write_range(limit, WriteRange { min: 0.0, max: 6553.5, scale: -1 })
            .unwrap();

        let err = store.set_next_write(limit, Value::Float(7000.0)).unwrap_err();
        assert!(matches!(err, BmsError::EncodeRange { .. }));
        assert!(!store.get(limit).unwrap().has_pending_write());

        store.set_next_write(limit, Value::Float(100.5)).unwrap();
        assert!(store.get(limit).unwrap().has_pending_write());

        // Checked after rounding to 0.1, the way the element encodes it
        store.set_next_write(limit, Value::Float(-0.04)).unwrap();
        store.set_next_write(limit, Value::Float(6553.54)).unwrap();
        assert!(store.set_next_write(limit, Value::Float(-0.05)).is_err());
        assert!(store.set_next_write(limit, Value::Float(6553.56)).is_err());
        assert_eq!(
            store.get(limit).unwrap().next_write(),
            Some(Value::Float(6553.54))
        );
    }

    #[test]
    fn test_promote_pending() {
        let (mut store, _, contactor) = store_with_channels();
        store.set_next_write(contactor, Value::Int(1)).unwrap();
        store.promote_pending(contactor);

        let ch = store.get(contactor).unwrap();
        assert!(!ch.has_pending_write());
        assert_eq!(ch.value(), Some(Value::Int(1)));
    }

    #[test]
    fn test_bind_write_range_intersects() {
        let (mut store, _, contactor) = store_with_channels();
        store
            .bind_write_range(contactor, WriteRange { min: 0.0, max: 65535.0, scale: 0 })
            .unwrap();
        store
            .bind_write_range(contactor, WriteRange { min: -10.0, max: 100.0, scale: 0 })
            .unwrap();
        assert_eq!(
            store.get(contactor).unwrap().write_range(),
            Some(WriteRange { min: 0.0, max: 100.0, scale: 0 })
        );
    }

    #[test]
    fn test_enum_option_name() {
        let kind = ChannelType::Enum(CONTACTOR_OPTIONS);
        assert_eq!(kind.option_name(3), Some("ON_GRID"));
        assert_eq!(kind.option_name(2), None);
        assert_eq!(ChannelType::Integer.option_name(0), None);
    }
}
