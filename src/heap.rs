//! Tuple heap: block-structured slot storage with a free list.
//!
//! The heap owns every live tuple of one table. Storage grows in
//! fixed-capacity blocks; released slots chain onto a free list and are
//! reused before the bump pointer advances. A slot's [`SlotAddr`] is the
//! tuple's identity: indexes store it, and anything that moves a tuple must
//! rewrite every index entry.
//!
//! Heap order (block index, then slot offset) is stable in the absence of
//! mutation. It is meaningful only to scans; callers must not attach
//! semantics to it.

use std::fmt;

use crate::tuple::Tuple;

/// Tuples per heap block.
pub const BLOCK_CAPACITY: u32 = 1024;

/// Stable handle for one tuple slot: block index in the upper half, slot
/// offset in the lower half.
///
/// Bit 63 namespaces slots that live in an anti-cache surrogate table, so an
/// index entry can point into either heap without ambiguity.
///
/// ```
/// use stonetable::heap::SlotAddr;
///
/// let addr = SlotAddr::new(5, 100);
/// assert_eq!(addr.block(), 5);
/// assert_eq!(addr.offset(), 100);
/// assert!(!addr.is_surrogate());
/// assert_eq!(format!("{}", addr), "(5, 100)");
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotAddr(u64);

impl SlotAddr {
    const SURROGATE_BIT: u64 = 1 << 63;

    /// Creates a main-heap slot address.
    pub const fn new(block: u32, offset: u32) -> Self {
        Self(((block as u64) << 32) | offset as u64)
    }

    /// Creates a surrogate-table slot address.
    pub const fn surrogate(block: u32, offset: u32) -> Self {
        Self(Self::new(block, offset).0 | Self::SURROGATE_BIT)
    }

    /// Returns the block index.
    pub const fn block(&self) -> u32 {
        ((self.0 & !Self::SURROGATE_BIT) >> 32) as u32
    }

    /// Returns the slot offset within the block.
    pub const fn offset(&self) -> u32 {
        self.0 as u32
    }

    /// Returns true if this address points into a surrogate table.
    pub const fn is_surrogate(&self) -> bool {
        (self.0 & Self::SURROGATE_BIT) != 0
    }
}

impl fmt::Debug for SlotAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for SlotAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_surrogate() {
            write!(f, "evicted({}, {})", self.block(), self.offset())
        } else {
            write!(f, "({}, {})", self.block(), self.offset())
        }
    }
}

/// Block-structured tuple storage with slot reuse.
pub struct TupleHeap {
    blocks: Vec<Vec<Option<Tuple>>>,
    free: Vec<SlotAddr>,
    active: usize,
    surrogate: bool,
}

impl TupleHeap {
    /// Creates an empty heap addressing the main namespace.
    pub fn new() -> Self {
        Self::with_namespace(false)
    }

    /// Creates an empty heap addressing the surrogate namespace.
    #[cfg(feature = "anticache")]
    pub(crate) fn surrogate_namespace() -> Self {
        Self::with_namespace(true)
    }

    fn with_namespace(surrogate: bool) -> Self {
        Self {
            blocks: Vec::new(),
            free: Vec::new(),
            active: 0,
            surrogate,
        }
    }

    fn addr(&self, block: u32, offset: u32) -> SlotAddr {
        if self.surrogate {
            SlotAddr::surrogate(block, offset)
        } else {
            SlotAddr::new(block, offset)
        }
    }

    /// Places a tuple into the next free slot and returns its address.
    ///
    /// Pops the free list when non-empty, otherwise bump-allocates at the
    /// end of the last block, extending the heap with a new block when full.
    /// The stored tuple comes back active with dirty and evicted cleared
    /// except for whatever the caller pre-set on `tuple` (the anti-cache
    /// merge path reinserts with flags already shaped).
    pub fn allocate(&mut self, mut tuple: Tuple) -> SlotAddr {
        tuple.flags_mut().set_active(true);
        let addr = match self.free.pop() {
            Some(addr) => addr,
            None => {
                let last_full = self
                    .blocks
                    .last()
                    .map_or(true, |b| b.len() >= BLOCK_CAPACITY as usize);
                if last_full {
                    self.blocks.push(Vec::with_capacity(BLOCK_CAPACITY as usize));
                }
                let block = (self.blocks.len() - 1) as u32;
                let last = self.blocks.last_mut().expect("block just ensured");
                let offset = last.len() as u32;
                last.push(None);
                self.addr(block, offset)
            }
        };
        self.blocks[addr.block() as usize][addr.offset() as usize] = Some(tuple);
        self.active += 1;
        addr
    }

    /// Releases a slot back to the free list.
    ///
    /// The slot's datums are dropped here; out-of-line payload survives only
    /// through references held elsewhere (an undo record, typically). The
    /// caller guarantees the slot has already been deindexed.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not active; releasing twice is heap corruption.
    pub fn release(&mut self, addr: SlotAddr) {
        let slot = self
            .blocks
            .get_mut(addr.block() as usize)
            .and_then(|b| b.get_mut(addr.offset() as usize))
            .unwrap_or_else(|| panic!("release of out-of-range slot {}", addr));
        assert!(
            slot.as_ref().is_some_and(Tuple::is_active),
            "release of inactive slot {}",
            addr
        );
        *slot = None;
        self.free.push(addr);
        self.active -= 1;
    }

    /// Returns the tuple at the address, or `None` for an inactive slot.
    pub fn get(&self, addr: SlotAddr) -> Option<&Tuple> {
        self.blocks
            .get(addr.block() as usize)
            .and_then(|b| b.get(addr.offset() as usize))
            .and_then(Option::as_ref)
    }

    /// Returns the tuple at the address mutably, or `None` for an inactive
    /// slot.
    pub fn get_mut(&mut self, addr: SlotAddr) -> Option<&mut Tuple> {
        self.blocks
            .get_mut(addr.block() as usize)
            .and_then(|b| b.get_mut(addr.offset() as usize))
            .and_then(Option::as_mut)
    }

    /// Returns the number of active tuples.
    pub fn active_count(&self) -> usize {
        self.active
    }

    /// Returns true if the heap holds no active tuples.
    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    /// Iterates every active tuple in heap order.
    pub fn iter(&self) -> impl Iterator<Item = (SlotAddr, &Tuple)> {
        self.blocks.iter().enumerate().flat_map(move |(b, block)| {
            block.iter().enumerate().filter_map(move |(o, slot)| {
                slot.as_ref()
                    .map(|t| (self.addr(b as u32, o as u32), t))
            })
        })
    }

    /// Number of allocated blocks (the snapshot cursor walks block bounds).
    pub(crate) fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Number of used slots in a block, including released ones.
    pub(crate) fn block_len(&self, block: u32) -> usize {
        self.blocks.get(block as usize).map_or(0, Vec::len)
    }
}

impl Default for TupleHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datum::Datum;

    fn row(id: i64) -> Tuple {
        Tuple::new(vec![Datum::Int64(id), Datum::text("payload")])
    }

    #[test]
    fn test_slot_addr_packing() {
        let addr = SlotAddr::new(0x0000_0001, 0x0000_0002);
        assert_eq!(addr.block(), 1);
        assert_eq!(addr.offset(), 2);

        let surrogate = SlotAddr::surrogate(7, 8);
        assert!(surrogate.is_surrogate());
        assert_eq!(surrogate.block(), 7);
        assert_eq!(surrogate.offset(), 8);
        assert_ne!(surrogate, SlotAddr::new(7, 8));
        assert_eq!(format!("{:?}", surrogate), "evicted(7, 8)");
    }

    #[test]
    fn test_allocate_and_get() {
        let mut heap = TupleHeap::new();
        let addr = heap.allocate(row(1));
        assert_eq!(addr, SlotAddr::new(0, 0));
        assert_eq!(heap.active_count(), 1);

        let stored = heap.get(addr).unwrap();
        assert!(stored.is_active());
        assert_eq!(stored.get(0), &Datum::Int64(1));
    }

    #[test]
    fn test_release_and_reuse() {
        let mut heap = TupleHeap::new();
        let a = heap.allocate(row(1));
        let b = heap.allocate(row(2));
        assert_eq!(heap.active_count(), 2);

        heap.release(a);
        assert_eq!(heap.active_count(), 1);
        assert!(heap.get(a).is_none());
        assert!(heap.get(b).is_some());

        // Free list reuse before bump allocation.
        let c = heap.allocate(row(3));
        assert_eq!(c, a);
        assert_eq!(heap.get(c).unwrap().get(0), &Datum::Int64(3));
    }

    #[test]
    #[should_panic(expected = "release of inactive slot")]
    fn test_double_release_panics() {
        let mut heap = TupleHeap::new();
        let a = heap.allocate(row(1));
        heap.release(a);
        heap.release(a);
    }

    #[test]
    fn test_block_extension() {
        let mut heap = TupleHeap::new();
        for i in 0..(BLOCK_CAPACITY as i64 + 3) {
            heap.allocate(row(i));
        }
        assert_eq!(heap.block_count(), 2);
        assert_eq!(heap.block_len(0), BLOCK_CAPACITY as usize);
        assert_eq!(heap.block_len(1), 3);

        let overflow = SlotAddr::new(1, 0);
        assert_eq!(
            heap.get(overflow).unwrap().get(0),
            &Datum::Int64(BLOCK_CAPACITY as i64)
        );
    }

    #[test]
    fn test_iter_heap_order_skips_released() {
        let mut heap = TupleHeap::new();
        let addrs: Vec<_> = (0..5).map(|i| heap.allocate(row(i))).collect();
        heap.release(addrs[1]);
        heap.release(addrs[3]);

        let ids: Vec<i64> = heap
            .iter()
            .map(|(_, t)| match t.get(0) {
                Datum::Int64(v) => *v,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ids, vec![0, 2, 4]);
    }

    #[cfg(feature = "anticache")]
    #[test]
    fn test_surrogate_namespace_addresses() {
        let mut heap = TupleHeap::surrogate_namespace();
        let addr = heap.allocate(row(1));
        assert!(addr.is_surrogate());
        assert!(heap.get(addr).is_some());
    }
}
