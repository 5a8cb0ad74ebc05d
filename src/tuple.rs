//! Tuple representation: per-slot flags plus column datums.
//!
//! A [`Tuple`] is the unit the heap stores, the indexes key off, and the
//! export/snapshot/recovery streams serialize. It carries a small
//! [`TupleFlags`] mask (active, dirty, evicted) and one [`Datum`] per
//! column.
//!
//! # Record Serialization
//!
//! Tuples serialize with a null bitmap followed by the non-null datums:
//!
//! ```text
//! +---------------------------+
//! | Null Bitmap (ceil(n/8) B) |  bit=1: NOT NULL, bit=0: NULL
//! +---------------------------+
//! | Datum[0] (if not null)    |
//! | Datum[1] (if not null)    |
//! | ...                       |
//! +---------------------------+
//! ```
//!
//! Flags are runtime slot state and are not part of the record bytes; the
//! anti-cache block format carries them in its own per-tuple header.

use bytes::{Buf, BytesMut};

use crate::datum::{ensure_remaining, Datum, SerializationError, Type};

/// Per-slot state flags (8-bit mask).
///
/// `ACTIVE` marks a live tuple; inactive slots sit on the heap free list.
/// `DIRTY` is the copy-on-write coordination bit: the snapshot cursor skips
/// dirty slots because their activation-time image was already captured (or
/// they were born after activation). `EVICTED` marks a tuple whose index
/// entries point at an anti-cache surrogate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TupleFlags(u8);

impl TupleFlags {
    /// Tuple occupies a live slot.
    pub const ACTIVE: u8 = 1 << 0;
    /// Copy-on-write cursor must skip this slot.
    pub const DIRTY: u8 = 1 << 1;
    /// Tuple has been migrated to external block storage.
    pub const EVICTED: u8 = 1 << 2;

    /// Creates an empty mask with no flags set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Rebuilds a mask from its raw bits.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Returns the raw bits.
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Check the active flag.
    pub const fn is_active(&self) -> bool {
        (self.0 & Self::ACTIVE) != 0
    }

    /// Check the dirty flag.
    pub const fn is_dirty(&self) -> bool {
        (self.0 & Self::DIRTY) != 0
    }

    /// Check the evicted flag.
    pub const fn is_evicted(&self) -> bool {
        (self.0 & Self::EVICTED) != 0
    }

    /// Set or clear the active flag.
    pub fn set_active(&mut self, active: bool) {
        self.set(Self::ACTIVE, active);
    }

    /// Set or clear the dirty flag.
    pub fn set_dirty(&mut self, dirty: bool) {
        self.set(Self::DIRTY, dirty);
    }

    /// Set or clear the evicted flag.
    pub fn set_evicted(&mut self, evicted: bool) {
        self.set(Self::EVICTED, evicted);
    }

    fn set(&mut self, bit: u8, on: bool) {
        if on {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

/// One table row: slot flags plus column datums.
///
/// [`Clone`] is shallow (variable-length payloads are shared);
/// [`Tuple::deep_clone`] allocates fresh payload buffers. Equality compares
/// datums only, never flags, because value identity is what lookup and undo
/// care about.
#[derive(Debug, Clone)]
pub struct Tuple {
    flags: TupleFlags,
    values: Box<[Datum]>,
}

impl Tuple {
    /// Creates a tuple with cleared flags.
    pub fn new(values: Vec<Datum>) -> Self {
        Self {
            flags: TupleFlags::empty(),
            values: values.into_boxed_slice(),
        }
    }

    /// Returns the column datums in order.
    pub fn values(&self) -> &[Datum] {
        &self.values
    }

    /// Returns the datum at the given column position.
    pub fn get(&self, column: usize) -> &Datum {
        &self.values[column]
    }

    /// Returns a copy of the flag mask.
    pub fn flags(&self) -> TupleFlags {
        self.flags
    }

    /// Returns a mutable reference to the flag mask.
    pub fn flags_mut(&mut self) -> &mut TupleFlags {
        &mut self.flags
    }

    /// Check the active flag.
    pub fn is_active(&self) -> bool {
        self.flags.is_active()
    }

    /// Check the dirty flag.
    pub fn is_dirty(&self) -> bool {
        self.flags.is_dirty()
    }

    /// Check the evicted flag.
    pub fn is_evicted(&self) -> bool {
        self.flags.is_evicted()
    }

    /// Replaces the column datums, leaving flags untouched.
    ///
    /// The previous datums are dropped; any out-of-line payload they carried
    /// survives only through copies still held elsewhere (an undo record's
    /// pre-image, typically).
    pub fn set_values(&mut self, values: Box<[Datum]>) {
        self.values = values;
    }

    /// Consumes the tuple, returning its datums.
    pub fn into_values(self) -> Box<[Datum]> {
        self.values
    }

    /// Copies the tuple, allocating fresh out-of-line payload buffers.
    pub fn deep_clone(&self) -> Self {
        Self {
            flags: self.flags,
            values: self.values.iter().map(Datum::deep_clone).collect(),
        }
    }

    /// Returns a deep copy of the datums alone.
    pub fn deep_clone_values(&self) -> Box<[Datum]> {
        self.values.iter().map(Datum::deep_clone).collect()
    }

    /// Returns the serialized record size in bytes (null bitmap + datums).
    pub fn serialized_size(&self) -> usize {
        let bitmap = self.values.len().div_ceil(8);
        bitmap + self.values.iter().map(Datum::serialized_size).sum::<usize>()
    }

    /// Serializes the record bytes (no flags) into the buffer.
    pub fn serialize(&self, out: &mut BytesMut) {
        let bitmap_bytes = self.values.len().div_ceil(8);
        let start = out.len();
        out.resize(start + bitmap_bytes, 0);
        for (i, value) in self.values.iter().enumerate() {
            if !value.is_null() {
                out[start + i / 8] |= 1 << (i % 8);
            }
        }
        for value in self.values.iter() {
            value.serialize(out);
        }
    }

    /// Deserializes a record given the column types. Flags come back empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is truncated or a datum is malformed.
    pub fn deserialize(buf: &mut impl Buf, types: &[Type]) -> Result<Self, SerializationError> {
        let bitmap_bytes = types.len().div_ceil(8);
        ensure_remaining!(buf, bitmap_bytes);
        let mut bitmap = vec![0u8; bitmap_bytes];
        buf.copy_to_slice(&mut bitmap);

        let mut values = Vec::with_capacity(types.len());
        for (i, &ty) in types.iter().enumerate() {
            let not_null = (bitmap[i / 8] & (1 << (i % 8))) != 0;
            if not_null {
                values.push(Datum::deserialize(buf, ty)?);
            } else {
                values.push(Datum::Null);
            }
        }
        Ok(Tuple::new(values))
    }
}

impl PartialEq for Tuple {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_mask() {
        let mut flags = TupleFlags::empty();
        assert!(!flags.is_active());
        assert!(!flags.is_dirty());
        assert!(!flags.is_evicted());

        flags.set_active(true);
        flags.set_dirty(true);
        assert!(flags.is_active());
        assert!(flags.is_dirty());

        flags.set_dirty(false);
        assert!(!flags.is_dirty());
        assert!(flags.is_active());

        flags.set_evicted(true);
        assert_eq!(
            flags.bits(),
            TupleFlags::ACTIVE | TupleFlags::EVICTED
        );
        assert_eq!(TupleFlags::from_bits(flags.bits()), flags);
    }

    fn sample() -> Tuple {
        Tuple::new(vec![
            Datum::Int64(42),
            Datum::text("hello"),
            Datum::Null,
            Datum::Bool(true),
        ])
    }

    #[test]
    fn test_record_roundtrip() {
        let tuple = sample();
        let mut buf = BytesMut::new();
        tuple.serialize(&mut buf);
        assert_eq!(buf.len(), tuple.serialized_size());

        let types = [Type::Int64, Type::Text, Type::Int32, Type::Bool];
        let parsed = Tuple::deserialize(&mut buf.freeze(), &types).unwrap();
        assert_eq!(parsed, tuple);
        assert!(parsed.get(2).is_null());
    }

    #[test]
    fn test_null_bitmap_wide_record() {
        // More than 8 columns forces a second bitmap byte.
        let values: Vec<Datum> = (0..11)
            .map(|i| {
                if i % 3 == 0 {
                    Datum::Null
                } else {
                    Datum::Int32(i)
                }
            })
            .collect();
        let tuple = Tuple::new(values);

        let mut buf = BytesMut::new();
        tuple.serialize(&mut buf);

        let types = vec![Type::Int32; 11];
        let parsed = Tuple::deserialize(&mut buf.freeze(), &types).unwrap();
        assert_eq!(parsed, tuple);
    }

    #[test]
    fn test_equality_ignores_flags() {
        let a = sample();
        let mut b = sample();
        b.flags_mut().set_active(true);
        b.flags_mut().set_dirty(true);
        assert_eq!(a, b);
    }

    #[test]
    fn test_truncated_record() {
        let tuple = sample();
        let mut buf = BytesMut::new();
        tuple.serialize(&mut buf);
        buf.truncate(buf.len() - 1);

        let types = [Type::Int64, Type::Text, Type::Int32, Type::Bool];
        assert!(Tuple::deserialize(&mut buf.freeze(), &types).is_err());
    }
}
