//! Register element codec
//!
//! A [`RegisterElement`] binds a contiguous span of 16-bit holding registers to
//! one channel (or, for bit fields, to one channel per mapped bit). Decoding
//! turns raw words into typed channel values, encoding turns a pending channel
//! value back into words.
//!
//! ```text
//! words (per word order) -> raw integer (sign-extended) -> * 10^scale -> Value
//! Value -> / 10^scale -> round -> range check -> raw integer -> words
//! ```

use tracing::debug;

use crate::core::channel::{ChannelId, ChannelStore, ChannelType, Decoded, Value, WriteRange};
use crate::error::{BmsError, Result};

/// Order of the two words of a double-word element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordOrder {
    LowWordFirst,
    HighWordFirst,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ElementKind {
    /// One register
    Word { signed: bool },
    /// Two registers
    DoubleWord { signed: bool, order: WordOrder },
    /// One register split into boolean channels by bit index
    Bits(Vec<(u8, ChannelId)>),
    /// Address space that is read but carries nothing of interest
    Dummy { words: u16 },
}

/// One element of a task's address range
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterElement {
    address: u16,
    kind: ElementKind,
    channel: Option<ChannelId>,
    scale: i8,
}

impl RegisterElement {
    fn with_kind(address: u16, kind: ElementKind) -> Self {
        Self {
            address,
            kind,
            channel: None,
            scale: 0,
        }
    }

    pub fn unsigned_word(address: u16) -> Self {
        Self::with_kind(address, ElementKind::Word { signed: false })
    }

    pub fn signed_word(address: u16) -> Self {
        Self::with_kind(address, ElementKind::Word { signed: true })
    }

    pub fn unsigned_double_word(address: u16, order: WordOrder) -> Self {
        Self::with_kind(
            address,
            ElementKind::DoubleWord {
                signed: false,
                order,
            },
        )
    }

    pub fn signed_double_word(address: u16, order: WordOrder) -> Self {
        Self::with_kind(address, ElementKind::DoubleWord { signed: true, order })
    }

    /// Bit field over one register; map bits with [`RegisterElement::bit`]
    pub fn bits(address: u16) -> Self {
        Self::with_kind(address, ElementKind::Bits(Vec::new()))
    }

    /// Padding covering `from..=to`
    pub fn dummy(from: u16, to: u16) -> Self {
        let words = to.saturating_sub(from).saturating_add(1);
        Self::with_kind(from, ElementKind::Dummy { words })
    }

    /// Bind the channel this word element decodes into
    pub fn map(mut self, channel: ChannelId) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Decimal scale exponent: engineering value = raw * 10^scale
    pub fn scale(mut self, scale: i8) -> Self {
        self.scale = scale;
        self
    }

    /// Map one bit of a bit-field element; ignored on other kinds
    pub fn bit(mut self, index: u8, channel: ChannelId) -> Self {
        if let ElementKind::Bits(ref mut map) = self.kind {
            map.push((index, channel));
        }
        self
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn kind(&self) -> &ElementKind {
        &self.kind
    }

    pub fn channel(&self) -> Option<ChannelId> {
        self.channel
    }

    pub fn scale_exponent(&self) -> i8 {
        self.scale
    }

    /// Number of registers the element spans
    pub fn width(&self) -> u16 {
        match self.kind {
            ElementKind::Word { .. } | ElementKind::Bits(_) => 1,
            ElementKind::DoubleWord { .. } => 2,
            ElementKind::Dummy { words } => words,
        }
    }

    /// Address one past the last register of the element
    pub fn end(&self) -> u32 {
        u32::from(self.address) + u32::from(self.width())
    }

    pub fn is_value(&self) -> bool {
        matches!(
            self.kind,
            ElementKind::Word { .. } | ElementKind::DoubleWord { .. }
        )
    }

    /// Every channel this element writes on decode
    pub fn channels(&self) -> Vec<ChannelId> {
        match &self.kind {
            ElementKind::Bits(map) => map.iter().map(|(_, ch)| *ch).collect(),
            ElementKind::Dummy { .. } => Vec::new(),
            _ => self.channel.into_iter().collect(),
        }
    }

    /// Representable raw integer range
    fn raw_range(&self) -> Option<(i64, i64)> {
        match self.kind {
            ElementKind::Word { signed: false } => Some((0, i64::from(u16::MAX))),
            ElementKind::Word { signed: true } => {
                Some((i64::from(i16::MIN), i64::from(i16::MAX)))
            },
            ElementKind::DoubleWord { signed: false, .. } => Some((0, i64::from(u32::MAX))),
            ElementKind::DoubleWord { signed: true, .. } => {
                Some((i64::from(i32::MIN), i64::from(i32::MAX)))
            },
            ElementKind::Bits(_) | ElementKind::Dummy { .. } => None,
        }
    }

    /// Representable range in engineering units
    pub fn write_range(&self) -> Option<WriteRange> {
        self.raw_range().map(|(min, max)| WriteRange {
            min: apply_scale(min, self.scale),
            max: apply_scale(max, self.scale),
            scale: self.scale,
        })
    }

    // ========================================================================
    // Decode
    // ========================================================================

    /// Combine the element's words into a sign-extended raw integer
    pub fn raw_value(&self, words: &[u16]) -> Result<i64> {
        let needed = self.width() as usize;
        if words.len() < needed {
            return Err(BmsError::decode(format!(
                "Element 0x{:04X} needs {} words, got {}",
                self.address,
                needed,
                words.len()
            )));
        }

        match self.kind {
            ElementKind::Word { signed } => {
                let w = words[0];
                Ok(if signed {
                    i64::from(w as i16)
                } else {
                    i64::from(w)
                })
            },
            ElementKind::DoubleWord { signed, order } => {
                let (hi, lo) = match order {
                    WordOrder::HighWordFirst => (words[0], words[1]),
                    WordOrder::LowWordFirst => (words[1], words[0]),
                };
                let combined = (u32::from(hi) << 16) | u32::from(lo);
                Ok(if signed {
                    i64::from(combined as i32)
                } else {
                    i64::from(combined)
                })
            },
            _ => Err(BmsError::decode(format!(
                "Element 0x{:04X} carries no value",
                self.address
            ))),
        }
    }

    /// Decode a word element into a value of the given channel type
    pub fn decode_value(&self, words: &[u16], kind: ChannelType) -> Result<Value> {
        let raw = self.raw_value(words)?;
        match kind {
            ChannelType::Boolean => Ok(Value::Bool(raw != 0)),
            ChannelType::Enum(options) => {
                if options.iter().any(|(v, _)| *v == raw) {
                    Ok(Value::Int(raw))
                } else {
                    Err(BmsError::decode(format!(
                        "Element 0x{:04X}: {} is not a known option",
                        self.address, raw
                    )))
                }
            },
            ChannelType::Integer if self.scale >= 0 => 10i64
                .checked_pow(self.scale as u32)
                .and_then(|factor| raw.checked_mul(factor))
                .map(Value::Int)
                .ok_or_else(|| {
                    BmsError::decode(format!(
                        "Element 0x{:04X}: {} * 10^{} overflows",
                        self.address, raw, self.scale
                    ))
                }),
            ChannelType::Integer | ChannelType::Decimal => {
                Ok(Value::Float(apply_scale(raw, self.scale)))
            },
        }
    }

    /// Decode the element's words and append the results to `out`
    ///
    /// On a decode range failure every channel of the element is appended as
    /// [`Decoded::Invalid`] and the error is returned for logging.
    pub fn decode_into(
        &self,
        words: &[u16],
        store: &ChannelStore,
        out: &mut Vec<Decoded>,
    ) -> Result<()> {
        match &self.kind {
            ElementKind::Dummy { .. } => Ok(()),
            ElementKind::Bits(map) => match words.first() {
                Some(&word) => {
                    for &(index, channel) in map {
                        let set = index < 16 && (word >> index) & 1 == 1;
                        out.push(Decoded::Value(channel, Value::Bool(set)));
                    }
                    Ok(())
                },
                None => {
                    out.extend(map.iter().map(|(_, ch)| Decoded::Invalid(*ch)));
                    Err(BmsError::decode(format!(
                        "Bit field 0x{:04X}: no data",
                        self.address
                    )))
                },
            },
            _ => {
                let Some(channel) = self.channel else {
                    return Ok(());
                };
                let kind = store.get(channel)?.kind();
                match self.decode_value(words, kind) {
                    Ok(value) => {
                        out.push(Decoded::Value(channel, value));
                        Ok(())
                    },
                    Err(e) => {
                        debug!("Decode failed for channel {}: {}", channel, e);
                        out.push(Decoded::Invalid(channel));
                        Err(e)
                    },
                }
            },
        }
    }

    // ========================================================================
    // Encode
    // ========================================================================

    /// Encode `value` into the element's words
    pub fn encode(&self, value: Value, channel_name: &str) -> Result<Vec<u16>> {
        let (min, max) = self.raw_range().ok_or_else(|| {
            BmsError::config(format!(
                "Element 0x{:04X} cannot be written",
                self.address
            ))
        })?;

        let out_of_range = |v: f64| BmsError::EncodeRange {
            channel: channel_name.to_string(),
            value: v,
            min: apply_scale(min, self.scale),
            max: apply_scale(max, self.scale),
        };

        let raw = match value {
            Value::Bool(b) => i64::from(b),
            Value::Int(v) if self.scale == 0 => v,
            other => {
                let scaled = unscale(other.as_f64(), self.scale);
                if !scaled.is_finite() {
                    return Err(out_of_range(other.as_f64()));
                }
                scaled.round() as i64
            },
        };

        if raw < min || raw > max {
            return Err(out_of_range(value.as_f64()));
        }

        let bits = raw as u32;
        Ok(match self.kind {
            ElementKind::DoubleWord { order, .. } => {
                let hi = (bits >> 16) as u16;
                let lo = (bits & 0xFFFF) as u16;
                match order {
                    WordOrder::HighWordFirst => vec![hi, lo],
                    WordOrder::LowWordFirst => vec![lo, hi],
                }
            },
            _ => vec![(bits & 0xFFFF) as u16],
        })
    }
}

/// raw * 10^scale as a float; negative scales divide to keep results exact
fn apply_scale(raw: i64, scale: i8) -> f64 {
    let factor = 10f64.powi(i32::from(scale.unsigned_abs()));
    if scale < 0 {
        raw as f64 / factor
    } else {
        raw as f64 * factor
    }
}

/// value / 10^scale
pub(crate) fn unscale(value: f64, scale: i8) -> f64 {
    let factor = 10f64.powi(i32::from(scale.unsigned_abs()));
    if scale < 0 {
        value * factor
    } else {
        value / factor
    }
}
