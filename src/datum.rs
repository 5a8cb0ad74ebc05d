//! Database data types and values.
//!
//! This module defines the canonical type system and value representation
//! for the table engine. [`Type`] provides type-safe handling of column
//! types, and [`Datum`] represents a single typed column value with
//! serialization support.
//!
//! Variable-length datums (`Text`, `Bytes`) keep their payload in a
//! reference-counted out-of-line buffer. A plain [`Clone`] shares the
//! buffer; [`Datum::deep_clone`] allocates a fresh one. The table uses the
//! deep copy when a caller-supplied tuple is persisted, and the shallow copy
//! when an undo record preserves a pre-image: the payload then stays alive
//! exactly as long as either the slot or the undo record still references it.

use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};

/// Errors from datum serialization/deserialization.
#[derive(Debug)]
pub enum SerializationError {
    /// Buffer ran out of data mid-value.
    Truncated {
        /// Bytes required.
        required: usize,
        /// Bytes available.
        available: usize,
    },
    /// Invalid data format.
    InvalidFormat(String),
}

impl fmt::Display for SerializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializationError::Truncated {
                required,
                available,
            } => {
                write!(
                    f,
                    "truncated value: need {} bytes, have {}",
                    required, available
                )
            }
            SerializationError::InvalidFormat(msg) => {
                write!(f, "invalid format: {}", msg)
            }
        }
    }
}

impl std::error::Error for SerializationError {}

/// Returns `SerializationError::Truncated` if the buffer holds fewer bytes.
macro_rules! ensure_remaining {
    ($buf:expr, $required:expr) => {
        if $buf.remaining() < $required {
            return Err($crate::datum::SerializationError::Truncated {
                required: $required,
                available: $buf.remaining(),
            });
        }
    };
}

pub(crate) use ensure_remaining;

/// Database column type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    /// Boolean type.
    Bool,
    /// 2-byte integer.
    Int16,
    /// 4-byte integer.
    Int32,
    /// 8-byte integer.
    Int64,
    /// Single-precision floating-point.
    Float32,
    /// Double-precision floating-point.
    Float64,
    /// Variable-length string.
    Text,
    /// Variable-length binary string.
    Bytes,
}

impl Type {
    /// Returns the SQL display name for this type (e.g., `"BOOLEAN"`, `"BIGINT"`).
    pub const fn display_name(self) -> &'static str {
        match self {
            Type::Bool => "BOOLEAN",
            Type::Int16 => "SMALLINT",
            Type::Int32 => "INTEGER",
            Type::Int64 => "BIGINT",
            Type::Float32 => "REAL",
            Type::Float64 => "DOUBLE PRECISION",
            Type::Text => "TEXT",
            Type::Bytes => "BYTEA",
        }
    }

    /// Returns the fixed byte size for fixed-length types, or `None` for
    /// variable-length types.
    pub const fn fixed_size(self) -> Option<usize> {
        match self {
            Type::Bool => Some(1),
            Type::Int16 => Some(2),
            Type::Int32 => Some(4),
            Type::Int64 => Some(8),
            Type::Float32 => Some(4),
            Type::Float64 => Some(8),
            Type::Text | Type::Bytes => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// A typed column value.
///
/// Variable-length variants share their payload through an `Arc`; see the
/// module docs for the deep/shallow copy contract.
#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub enum Datum {
    /// SQL NULL (type is unknown/any).
    Null,
    /// Boolean (true/false).
    Bool(bool),
    /// 16-bit signed integer.
    Int16(i16),
    /// 32-bit signed integer.
    Int32(i32),
    /// 64-bit signed integer.
    Int64(i64),
    /// 32-bit floating point.
    Float32(f32),
    /// 64-bit floating point.
    Float64(f64),
    /// Variable-length text.
    Text(Arc<str>),
    /// Variable-length binary.
    Bytes(Arc<[u8]>),
}

impl Datum {
    /// Returns true if this datum is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    /// Returns the concrete type, or `None` for NULL.
    pub fn ty(&self) -> Option<Type> {
        match self {
            Datum::Null => None,
            Datum::Bool(_) => Some(Type::Bool),
            Datum::Int16(_) => Some(Type::Int16),
            Datum::Int32(_) => Some(Type::Int32),
            Datum::Int64(_) => Some(Type::Int64),
            Datum::Float32(_) => Some(Type::Float32),
            Datum::Float64(_) => Some(Type::Float64),
            Datum::Text(_) => Some(Type::Text),
            Datum::Bytes(_) => Some(Type::Bytes),
        }
    }

    /// Creates a text datum from a string slice.
    pub fn text(s: &str) -> Self {
        Datum::Text(Arc::from(s))
    }

    /// Creates a binary datum from a byte slice.
    pub fn bytes(b: &[u8]) -> Self {
        Datum::Bytes(Arc::from(b))
    }

    /// Copies this datum, allocating fresh out-of-line storage for
    /// variable-length payloads.
    ///
    /// A plain [`Clone`] shares the payload buffer instead.
    pub fn deep_clone(&self) -> Self {
        match self {
            Datum::Text(s) => Datum::Text(Arc::from(&**s)),
            Datum::Bytes(b) => Datum::Bytes(Arc::from(&**b)),
            other => other.clone(),
        }
    }

    /// Returns the serialized size in bytes.
    ///
    /// For NULL, this returns 0 (NULL values are indicated by the null
    /// bitmap at the record level). For variable-length types, this includes
    /// the 4-byte length prefix.
    pub fn serialized_size(&self) -> usize {
        match self {
            Datum::Null => 0,
            Datum::Bool(_) => 1,
            Datum::Int16(_) => 2,
            Datum::Int32(_) => 4,
            Datum::Int64(_) => 8,
            Datum::Float32(_) => 4,
            Datum::Float64(_) => 8,
            Datum::Text(s) => 4 + s.len(),
            Datum::Bytes(b) => 4 + b.len(),
        }
    }

    /// Serializes this datum into the buffer. NULL writes 0 bytes.
    pub fn serialize(&self, out: &mut BytesMut) {
        match self {
            Datum::Null => {}
            Datum::Bool(b) => out.put_u8(u8::from(*b)),
            Datum::Int16(n) => out.put_i16_le(*n),
            Datum::Int32(n) => out.put_i32_le(*n),
            Datum::Int64(n) => out.put_i64_le(*n),
            Datum::Float32(n) => out.put_f32_le(*n),
            Datum::Float64(n) => out.put_f64_le(*n),
            Datum::Text(s) => {
                out.put_u32_le(s.len() as u32);
                out.put_slice(s.as_bytes());
            }
            Datum::Bytes(b) => {
                out.put_u32_le(b.len() as u32);
                out.put_slice(b);
            }
        }
    }

    /// Deserializes a datum of the given type from the buffer.
    ///
    /// # Errors
    ///
    /// Returns `SerializationError::Truncated` if the buffer is too short,
    /// or `InvalidFormat` for malformed variable-length data.
    pub fn deserialize(buf: &mut impl Buf, ty: Type) -> Result<Self, SerializationError> {
        match ty {
            Type::Bool => {
                ensure_remaining!(buf, 1);
                Ok(Datum::Bool(buf.get_u8() != 0))
            }
            Type::Int16 => {
                ensure_remaining!(buf, 2);
                Ok(Datum::Int16(buf.get_i16_le()))
            }
            Type::Int32 => {
                ensure_remaining!(buf, 4);
                Ok(Datum::Int32(buf.get_i32_le()))
            }
            Type::Int64 => {
                ensure_remaining!(buf, 8);
                Ok(Datum::Int64(buf.get_i64_le()))
            }
            Type::Float32 => {
                ensure_remaining!(buf, 4);
                Ok(Datum::Float32(buf.get_f32_le()))
            }
            Type::Float64 => {
                ensure_remaining!(buf, 8);
                Ok(Datum::Float64(buf.get_f64_le()))
            }
            Type::Text => {
                ensure_remaining!(buf, 4);
                let len = buf.get_u32_le() as usize;
                ensure_remaining!(buf, len);
                let raw = buf.copy_to_bytes(len);
                let s = std::str::from_utf8(&raw)
                    .map_err(|e| SerializationError::InvalidFormat(e.to_string()))?;
                Ok(Datum::Text(Arc::from(s)))
            }
            Type::Bytes => {
                ensure_remaining!(buf, 4);
                let len = buf.get_u32_le() as usize;
                ensure_remaining!(buf, len);
                let raw = buf.copy_to_bytes(len);
                Ok(Datum::Bytes(Arc::from(&raw[..])))
            }
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => f.write_str("NULL"),
            Datum::Bool(b) => write!(f, "{}", b),
            Datum::Int16(n) => write!(f, "{}", n),
            Datum::Int32(n) => write!(f, "{}", n),
            Datum::Int64(n) => write!(f, "{}", n),
            Datum::Float32(n) => write!(f, "{}", n),
            Datum::Float64(n) => write!(f, "{}", n),
            Datum::Text(s) => write!(f, "'{}'", s),
            Datum::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}
