//! Conversion between register words and typed values.
//!
//! Both directions are pure functions of a [`RegisterDescriptor`]; nothing
//! here touches the wire or any shared state.

pub mod decimal;
pub mod periods;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

pub use decimal::Decimal;
pub use periods::{CapacityControlPeriod, ChargeFlag, Days, FixedChargePeriod, TouPeriod};

use crate::error::{Error, Result};
use crate::registers::{Access, DataType, Layout, RegisterDescriptor};

/// Decoded content of a structured register.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Structured {
    Timestamp(DateTime<Utc>),
    TimeOfUse(Vec<TouPeriod>),
    FixedCharge(Vec<FixedChargePeriod>),
    CapacityControl(Vec<CapacityControlPeriod>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// Wide enough for unsigned 64-bit registers.
    Integer(i128),
    Decimal(Decimal),
    Flags { raw: u32, names: Vec<&'static str> },
    Text(String),
    Structured(Structured),
}

impl Value {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => i64::try_from(*v).ok(),
            Value::Decimal(d) => d.rescale(1).ok().and_then(|v| i64::try_from(v).ok()),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Integer(v) => Some(Decimal::new(*v, 1)),
            Value::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Integer(_) => "integer",
            Value::Decimal(_) => "decimal",
            Value::Flags { .. } => "flags",
            Value::Text(_) => "text",
            Value::Structured(_) => "structured",
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v as i128)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Integer(v as i128)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{v}"),
            Value::Decimal(d) => write!(f, "{d}"),
            Value::Flags { names, .. } => write!(f, "[{}]", names.join(", ")),
            Value::Text(s) => f.write_str(s),
            Value::Structured(Structured::Timestamp(t)) => write!(f, "{}", t.to_rfc3339()),
            Value::Structured(Structured::TimeOfUse(p)) => {
                f.write_str(&periods::format_tou_periods(p))
            }
            Value::Structured(Structured::FixedCharge(p)) => {
                f.write_str(&periods::format_fixed_charge_periods(p))
            }
            Value::Structured(Structured::CapacityControl(p)) => {
                f.write_str(&periods::format_capacity_control_periods(p))
            }
        }
    }
}

/// A decoded quantity, stamped with the time of the read that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisterValue {
    pub name: &'static str,
    pub value: Value,
    pub unit: Option<&'static str>,
    pub read_at: DateTime<Utc>,
}

/// Concatenate big-endian words into one unsigned integer.
fn join_words(words: &[u16]) -> u64 {
    words.iter().fold(0u64, |acc, w| acc << 16 | *w as u64)
}

fn split_words(raw: u64, length: u16) -> Vec<u16> {
    (0..length)
        .rev()
        .map(|i| (raw >> (16 * i as u32)) as u16)
        .collect()
}

fn bit_width(desc: &RegisterDescriptor) -> u32 {
    16 * desc.length as u32
}

/// Numeric registers span one to four words.
fn integer_width(desc: &RegisterDescriptor) -> Result<u32> {
    match desc.length {
        1..=4 => Ok(bit_width(desc)),
        n => Err(Error::invalid(format!(
            "{} spans {n} registers, integers take 1 to 4",
            desc.name
        ))),
    }
}

fn scaled(raw: i128, scale: u32) -> Value {
    if scale <= 1 {
        Value::Integer(raw)
    } else {
        Value::Decimal(Decimal::new(raw, scale))
    }
}

/// Decode the words read from `desc`'s span.
pub fn decode(desc: &RegisterDescriptor, words: &[u16]) -> Result<Value> {
    if words.len() != desc.length as usize {
        return Err(Error::Protocol(format!(
            "{} expects {} registers, got {}",
            desc.name,
            desc.length,
            words.len()
        )));
    }

    let value = match desc.data_type {
        DataType::UInt => {
            integer_width(desc)?;
            scaled(join_words(words) as i128, desc.scale)
        }
        DataType::Int => {
            let shift = 128 - integer_width(desc)?;
            // sign-extend from the register width
            let signed = ((join_words(words) as i128) << shift) >> shift;
            scaled(signed, desc.scale)
        }
        DataType::Bitfield(table) => {
            let raw = join_words(words) as u32;
            Value::Flags {
                raw,
                names: table
                    .iter()
                    .filter(|flag| raw & flag.mask == flag.mask)
                    .map(|flag| flag.name)
                    .collect(),
            }
        }
        DataType::Text => {
            let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
            let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
            Value::Text(String::from_utf8_lossy(&bytes[..end]).into_owned())
        }
        DataType::Structured(layout) => Value::Structured(match layout {
            Layout::EpochSeconds => {
                let secs = join_words(words) as i64;
                let at = DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(|| {
                    Error::Protocol(format!("{}: timestamp {secs} out of range", desc.name))
                })?;
                Structured::Timestamp(at)
            }
            Layout::TimeOfUse => Structured::TimeOfUse(periods::decode_tou(words)?),
            Layout::FixedCharge => Structured::FixedCharge(periods::decode_fixed_charge(words)?),
            Layout::CapacityControl => {
                Structured::CapacityControl(periods::decode_capacity_control(words)?)
            }
        }),
    };
    Ok(value)
}

/// Encode `value` for a write to `desc`.
///
/// Checks run in order: access, value kind, precision, range.
pub fn encode(desc: &RegisterDescriptor, value: &Value) -> Result<Vec<u16>> {
    if desc.access == Access::Read {
        return Err(Error::ReadOnlyViolation(desc.name.to_string()));
    }

    let mismatch = || {
        Error::invalid(format!(
            "{} cannot hold a {} value",
            desc.name,
            value.kind()
        ))
    };

    match desc.data_type {
        DataType::UInt | DataType::Int => {
            let number = value.as_decimal().ok_or_else(mismatch)?;
            let width = integer_width(desc)?;
            let raw = number.rescale(desc.scale)?;
            let (min, max) = if desc.data_type == DataType::Int {
                (-(1i128 << (width - 1)), (1i128 << (width - 1)) - 1)
            } else {
                (0, (1i128 << width) - 1)
            };
            if raw < min || raw > max {
                return Err(Error::out_of_range(
                    desc.name,
                    format!("{number} does not fit {width} bits at scale {}", desc.scale),
                ));
            }
            Ok(split_words(raw as u64, desc.length))
        }
        DataType::Bitfield(_) => match value {
            Value::Flags { raw, .. } => {
                if bit_width(desc) < 32 && *raw >> bit_width(desc) != 0 {
                    return Err(Error::out_of_range(desc.name, format!("flags 0x{raw:X}")));
                }
                Ok(split_words(*raw as u64, desc.length))
            }
            _ => Err(mismatch()),
        },
        DataType::Text => match value {
            Value::Text(text) => {
                let capacity = desc.length as usize * 2;
                if text.len() > capacity {
                    return Err(Error::out_of_range(
                        desc.name,
                        format!("{} bytes, room for {capacity}", text.len()),
                    ));
                }
                let mut bytes = text.as_bytes().to_vec();
                bytes.resize(capacity, 0);
                Ok(bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect())
            }
            _ => Err(mismatch()),
        },
        DataType::Structured(layout) => {
            let Value::Structured(structured) = value else {
                return Err(mismatch());
            };
            let length = desc.length as usize;
            match (layout, structured) {
                (Layout::EpochSeconds, Structured::Timestamp(at)) => {
                    let secs = u32::try_from(at.timestamp()).map_err(|_| {
                        Error::out_of_range(desc.name, format!("{at} is outside the u32 epoch"))
                    })?;
                    Ok(split_words(secs as u64, desc.length))
                }
                (Layout::TimeOfUse, Structured::TimeOfUse(p)) => periods::encode_tou(p, length),
                (Layout::FixedCharge, Structured::FixedCharge(p)) => {
                    periods::encode_fixed_charge(p, length)
                }
                (Layout::CapacityControl, Structured::CapacityControl(p)) => {
                    periods::encode_capacity_control(p, length)
                }
                _ => Err(mismatch()),
            }
        }
    }
}
