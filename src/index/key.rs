//! Order-preserving index key encoding.
//!
//! Index keys are encoded into byte strings whose `memcmp` order matches the
//! value order of the underlying datums, so ordered and hash index variants
//! share one key representation. Encoding rules:
//!
//! - Every datum starts with a type tag; NULL's tag is lowest so NULL keys
//!   sort first.
//! - Integers widen to i64 and flip the sign bit, then big-endian.
//! - Floats widen to f64 and reorder IEEE 754 bits (negative values flip all
//!   bits, positive values flip the sign bit).
//! - Text and binary escape `0x00` as `0x00 0xff` and terminate with
//!   `0x00 0x00`, so no key is a byte-prefix of another.
//!
//! Keys are never decoded; an index entry's address resolves back to the
//! heap for the datums.

use crate::tuple::Tuple;

const TAG_NULL: u8 = 0x00;
const TAG_BOOLEAN: u8 = 0x01;
const TAG_INTEGER: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_STRING: u8 = 0x04;
const TAG_BYTES: u8 = 0x05;

/// An encoded index key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexKey(Vec<u8>);

impl IndexKey {
    /// Extracts and encodes the keyed columns of a tuple.
    pub fn from_tuple(tuple: &Tuple, columns: &[usize]) -> Self {
        let mut out = Vec::with_capacity(columns.len() * 10);
        for &column in columns {
            encode_datum(&mut out, tuple.get(column));
        }
        Self(out)
    }

    /// Encodes a standalone datum sequence (probe keys built from values
    /// that do not live in a tuple).
    pub fn from_datums(datums: &[crate::datum::Datum]) -> Self {
        let mut out = Vec::with_capacity(datums.len() * 10);
        for datum in datums {
            encode_datum(&mut out, datum);
        }
        Self(out)
    }

    /// Returns the encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

fn encode_datum(out: &mut Vec<u8>, datum: &crate::datum::Datum) {
    use crate::datum::Datum;

    match datum {
        Datum::Null => out.push(TAG_NULL),
        Datum::Bool(b) => {
            out.push(TAG_BOOLEAN);
            out.push(u8::from(*b));
        }
        Datum::Int16(n) => encode_integer(out, i64::from(*n)),
        Datum::Int32(n) => encode_integer(out, i64::from(*n)),
        Datum::Int64(n) => encode_integer(out, *n),
        Datum::Float32(n) => encode_float(out, f64::from(*n)),
        Datum::Float64(n) => encode_float(out, *n),
        Datum::Text(s) => encode_escaped(out, TAG_STRING, s.as_bytes()),
        Datum::Bytes(b) => encode_escaped(out, TAG_BYTES, b),
    }
}

/// Flip the sign bit so negative values sort before positive.
fn encode_integer(out: &mut Vec<u8>, i: i64) {
    let unsigned = (i as u64) ^ (1u64 << 63);
    out.push(TAG_INTEGER);
    out.extend_from_slice(&unsigned.to_be_bytes());
}

/// Reorder IEEE 754 bits: negatives flip all bits, positives flip the sign
/// bit, giving total order with -inf first and +inf last.
fn encode_float(out: &mut Vec<u8>, f: f64) {
    let bits = f.to_bits();
    let ordered = if bits & (1u64 << 63) != 0 {
        !bits
    } else {
        bits | (1u64 << 63)
    };
    out.push(TAG_FLOAT);
    out.extend_from_slice(&ordered.to_be_bytes());
}

fn encode_escaped(out: &mut Vec<u8>, tag: u8, data: &[u8]) {
    out.push(tag);
    for &b in data {
        out.push(b);
        if b == 0x00 {
            out.push(0xff);
        }
    }
    out.extend_from_slice(&[0x00, 0x00]);
}
