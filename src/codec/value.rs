//! Tagged values
//!
//! Every stored value carries a one-byte type tag, so an encoded value is
//! never empty. The log relies on that: a zero-length value is a tombstone.

use bytes::Bytes;

use super::{zigzag_decode, zigzag_encode, CodedReader, CodedWriter, DecodeError};
use crate::buffer::Buffer;

/// Deepest `Nested` chain accepted on encode or decode
pub const MAX_NESTING_DEPTH: usize = 64;

/// Type tag stored in front of every value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueTag {
    Bool = 0x01,
    Int = 0x02,
    UInt = 0x03,
    Float = 0x04,
    Double = 0x05,
    String = 0x06,
    Bytes = 0x07,
    Nested = 0x08,
}

impl TryFrom<u8> for ValueTag {
    type Error = DecodeError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0x01 => Ok(ValueTag::Bool),
            0x02 => Ok(ValueTag::Int),
            0x03 => Ok(ValueTag::UInt),
            0x04 => Ok(ValueTag::Float),
            0x05 => Ok(ValueTag::Double),
            0x06 => Ok(ValueTag::String),
            0x07 => Ok(ValueTag::Bytes),
            0x08 => Ok(ValueTag::Nested),
            _ => Err(DecodeError::Malformed(format!(
                "unknown value tag: 0x{:02x}",
                byte
            ))),
        }
    }
}

/// A stored value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Bytes),
    /// Ordered list of values (string sets, vectors, records)
    Nested(Vec<Value>),
}

impl Value {
    pub fn tag(&self) -> ValueTag {
        match self {
            Value::Bool(_) => ValueTag::Bool,
            Value::Int(_) => ValueTag::Int,
            Value::UInt(_) => ValueTag::UInt,
            Value::Float(_) => ValueTag::Float,
            Value::Double(_) => ValueTag::Double,
            Value::String(_) => ValueTag::String,
            Value::Bytes(_) => ValueTag::Bytes,
            Value::Nested(_) => ValueTag::Nested,
        }
    }

    /// Number of `Nested` layers on the deepest path (0 for scalars)
    pub fn nesting_depth(&self) -> usize {
        let mut deepest = 0;
        let mut stack = vec![(self, 0usize)];
        while let Some((value, depth)) = stack.pop() {
            if let Value::Nested(items) = value {
                deepest = deepest.max(depth + 1);
                stack.extend(items.iter().map(|item| (item, depth + 1)));
            }
        }
        deepest
    }

    /// Reject values nested deeper than [`MAX_NESTING_DEPTH`]
    pub fn check_depth(&self) -> Result<(), DecodeError> {
        let depth = self.nesting_depth();
        if depth > MAX_NESTING_DEPTH {
            return Err(DecodeError::Malformed(format!(
                "value nested {} levels deep, limit is {}",
                depth, MAX_NESTING_DEPTH
            )));
        }
        Ok(())
    }

    /// Append the tagged encoding of this value.
    /// Recurses once per `Nested` layer; see [`Value::check_depth`].
    pub fn encode_into(&self, writer: &mut CodedWriter<'_>) {
        writer.write_raw_byte(self.tag() as u8);
        match self {
            Value::Bool(b) => writer.write_raw_byte(*b as u8),
            Value::Int(i) => writer.write_varint(zigzag_encode(*i)),
            Value::UInt(u) => writer.write_varint(*u),
            Value::Float(f) => writer.write_fixed32(f.to_bits()),
            Value::Double(d) => writer.write_fixed64(d.to_bits()),
            Value::String(s) => writer.write_string(s),
            Value::Bytes(b) => writer.write_bytes(b),
            Value::Nested(items) => {
                writer.write_varint(items.len() as u64);
                let mut scratch = Buffer::new();
                for item in items {
                    scratch.clear();
                    item.encode_into(&mut CodedWriter::new(&mut scratch));
                    writer.write_bytes(scratch.as_slice());
                }
            }
        }
    }

    pub fn encode(&self) -> Buffer {
        let mut buf = Buffer::new();
        self.encode_into(&mut CodedWriter::new(&mut buf));
        buf
    }

    /// Decode a value occupying exactly `data`
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        Self::decode_at_depth(data, 0)
    }

    fn decode_at_depth(data: &[u8], depth: usize) -> Result<Self, DecodeError> {
        let mut reader = CodedReader::new(data);
        let value = Self::decode_from(&mut reader, depth)?;
        if !reader.is_at_end() {
            return Err(DecodeError::Malformed(format!(
                "{} trailing bytes after value",
                reader.remaining()
            )));
        }
        Ok(value)
    }

    fn decode_from(reader: &mut CodedReader<'_>, depth: usize) -> Result<Self, DecodeError> {
        let tag = ValueTag::try_from(reader.read_raw_byte()?)?;
        let value = match tag {
            ValueTag::Bool => match reader.read_raw_byte()? {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => {
                    return Err(DecodeError::Malformed(format!(
                        "invalid bool byte: {}",
                        other
                    )))
                }
            },
            ValueTag::Int => Value::Int(zigzag_decode(reader.read_varint()?)),
            ValueTag::UInt => Value::UInt(reader.read_varint()?),
            ValueTag::Float => Value::Float(f32::from_bits(reader.read_fixed32()?)),
            ValueTag::Double => Value::Double(f64::from_bits(reader.read_fixed64()?)),
            ValueTag::String => Value::String(reader.read_string()?.to_owned()),
            ValueTag::Bytes => Value::Bytes(Bytes::copy_from_slice(reader.read_bytes()?)),
            ValueTag::Nested => {
                if depth >= MAX_NESTING_DEPTH {
                    return Err(DecodeError::Malformed(format!(
                        "value nested more than {} levels deep",
                        MAX_NESTING_DEPTH
                    )));
                }
                let count = reader.read_varint()?;
                // Each element needs at least a length byte and a tag byte
                if count > (reader.remaining() / 2) as u64 {
                    return Err(DecodeError::Truncated {
                        needed: count as usize * 2,
                        remaining: reader.remaining(),
                    });
                }
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    items.push(Value::decode_at_depth(reader.read_bytes()?, depth + 1)?);
                }
                Value::Nested(items)
            }
        };
        Ok(value)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view; unsigned values that fit are converted
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Value::UInt(u) => Some(*u),
            Value::Int(i) => u64::try_from(*i).ok(),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Floating view; floats widen to doubles
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(*d),
            Value::Float(f) => Some(*f as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_nested(&self) -> Option<&[Value]> {
        match self {
            Value::Nested(items) => Some(items),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<u32> for Value {
    fn from(u: u32) -> Self {
        Value::UInt(u as u64)
    }
}

impl From<u64> for Value {
    fn from(u: u64) -> Self {
        Value::UInt(u)
    }
}

impl From<f32> for Value {
    fn from(f: f32) -> Self {
        Value::Float(f)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(Bytes::copy_from_slice(b))
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(Bytes::from(b))
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Nested(items)
    }
}
