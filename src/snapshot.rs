//! Copy-on-write snapshot of a table under live mutation.
//!
//! Activating a snapshot freezes a logical view of the table: the consumer
//! of [`CopyOnWriteContext::serialize_more`] sees exactly the multiset of
//! tuples active at activation time, once each, no matter what the writer
//! does in between pulls.
//!
//! The contract with the writer is the slot dirty flag:
//!
//! - Before mutating a slot the cursor has not reached yet, the writer calls
//!   [`mark_dirty`](CopyOnWriteContext::mark_dirty). For a pre-existing
//!   tuple the activation-time image is copied into the snapshot's private
//!   shadow queue; either way the dirty flag is set so the cursor skips the
//!   slot when it arrives.
//! - Slots the cursor already passed are left clean; their image was
//!   already emitted (or they were never part of the snapshot).
//!
//! The cursor clears each dirty flag as it walks past, so a completed
//! snapshot leaves no dirty flags behind.

use std::collections::VecDeque;

use bytes::{BufMut, BytesMut};
use tracing::{debug, trace};

use crate::heap::{SlotAddr, TupleHeap};
use crate::tuple::Tuple;

/// Tuples emitted per [`CopyOnWriteContext::serialize_more`] pull.
pub const SNAPSHOT_CHUNK_TUPLES: usize = 64;

/// Outcome of a snapshot activation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CowActivation {
    /// Snapshot engaged; pull with `serialize_snapshot`.
    Activated,
    /// A snapshot is already streaming; activation rejected.
    AlreadyActive,
    /// Empty tables decline activation; there is nothing to stream.
    EmptyTable,
}

/// Snapshot cursor plus the shadow copies of overwritten tuples.
pub struct CopyOnWriteContext {
    partition_id: i32,
    cursor_block: u32,
    cursor_offset: u32,
    heap_done: bool,
    shadow: VecDeque<Tuple>,
}

impl CopyOnWriteContext {
    /// Creates a context positioned at the start of the heap.
    pub(crate) fn new(partition_id: i32) -> Self {
        debug!(partition_id, "copy-on-write snapshot activated");
        Self {
            partition_id,
            cursor_block: 0,
            cursor_offset: 0,
            heap_done: false,
            shadow: VecDeque::new(),
        }
    }

    /// Returns the partition this snapshot serves.
    pub fn partition_id(&self) -> i32 {
        self.partition_id
    }

    fn cursor(&self) -> SlotAddr {
        SlotAddr::new(self.cursor_block, self.cursor_offset)
    }

    /// Coordinates a pending mutation of `addr` with the snapshot.
    ///
    /// `is_new` distinguishes a tuple born after activation (insert, or a
    /// reinsert replayed by undo) from a pre-existing tuple about to be
    /// updated or deleted. Only pre-existing tuples are copied into the
    /// shadow; new tuples merely get skipped by the cursor.
    pub(crate) fn mark_dirty(&mut self, heap: &mut TupleHeap, addr: SlotAddr, is_new: bool) {
        let pending = !self.heap_done && addr >= self.cursor();
        let Some(tuple) = heap.get_mut(addr) else {
            panic!("copy-on-write mark on inactive slot {}", addr);
        };
        if !pending {
            tuple.flags_mut().set_dirty(false);
            return;
        }
        if !is_new && !tuple.is_dirty() {
            // First mutation of a not-yet-visited tuple: its current image
            // is the activation-time image. Shallow copy; payload is shared.
            self.shadow.push_back(tuple.clone());
            trace!(%addr, "pre-image copied to snapshot shadow");
        }
        tuple.flags_mut().set_dirty(true);
    }

    /// Writes the next chunk of the snapshot into `out` as length-prefixed
    /// records. Returns true while more remains; the caller tears the
    /// context down once it returns false.
    pub(crate) fn serialize_more(&mut self, heap: &mut TupleHeap, out: &mut BytesMut) -> bool {
        let mut emitted = 0;
        while emitted < SNAPSHOT_CHUNK_TUPLES {
            if self.heap_done {
                match self.shadow.pop_front() {
                    Some(tuple) => {
                        write_record(out, &tuple);
                        emitted += 1;
                    }
                    None => return false,
                }
                continue;
            }

            if self.cursor_block as usize >= heap.block_count() {
                self.heap_done = true;
                continue;
            }
            if self.cursor_offset as usize >= heap.block_len(self.cursor_block) {
                self.cursor_block += 1;
                self.cursor_offset = 0;
                continue;
            }

            let addr = self.cursor();
            self.cursor_offset += 1;
            match heap.get_mut(addr) {
                Some(tuple) if tuple.is_dirty() => {
                    // Skipped: image already shadowed or born after
                    // activation. The cursor has passed; clear the flag.
                    tuple.flags_mut().set_dirty(false);
                }
                Some(tuple) => {
                    write_record(out, tuple);
                    emitted += 1;
                }
                None => {}
            }
        }
        true
    }
}

fn write_record(out: &mut BytesMut, tuple: &Tuple) {
    out.put_u32_le(tuple.serialized_size() as u32);
    tuple.serialize(out);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datum::{Datum, Type};
    use bytes::Buf;

    fn row(id: i64) -> Tuple {
        Tuple::new(vec![Datum::Int64(id)])
    }

    fn drain(ctx: &mut CopyOnWriteContext, heap: &mut TupleHeap) -> Vec<i64> {
        let mut out = BytesMut::new();
        while ctx.serialize_more(heap, &mut out) {}
        let mut buf = out.freeze();
        let mut ids = Vec::new();
        while buf.has_remaining() {
            let len = buf.get_u32_le() as usize;
            let mut record = buf.copy_to_bytes(len);
            let tuple = Tuple::deserialize(&mut record, &[Type::Int64]).unwrap();
            match tuple.get(0) {
                Datum::Int64(v) => ids.push(*v),
                _ => unreachable!(),
            }
        }
        ids.sort_unstable();
        ids
    }

    #[test]
    fn test_quiescent_snapshot_emits_everything_once() {
        let mut heap = TupleHeap::new();
        for i in 0..10 {
            heap.allocate(row(i));
        }
        let mut ctx = CopyOnWriteContext::new(0);
        assert_eq!(drain(&mut ctx, &mut heap), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_insert_after_activation_is_invisible() {
        let mut heap = TupleHeap::new();
        for i in 0..5 {
            heap.allocate(row(i));
        }
        let mut ctx = CopyOnWriteContext::new(0);

        let addr = heap.allocate(row(100));
        ctx.mark_dirty(&mut heap, addr, true);

        assert_eq!(drain(&mut ctx, &mut heap), (0..5).collect::<Vec<_>>());
        // Cursor cleared the skip flag as it passed.
        assert!(!heap.get(addr).unwrap().is_dirty());
    }

    #[test]
    fn test_update_before_visit_serves_pre_image() {
        let mut heap = TupleHeap::new();
        let addrs: Vec<_> = (0..5).map(|i| heap.allocate(row(i))).collect();
        let mut ctx = CopyOnWriteContext::new(0);

        // Overwrite id=2 with id=200 before the cursor reaches it.
        ctx.mark_dirty(&mut heap, addrs[2], false);
        heap.get_mut(addrs[2])
            .unwrap()
            .set_values(row(200).deep_clone_values());

        assert_eq!(drain(&mut ctx, &mut heap), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_delete_before_visit_serves_pre_image() {
        let mut heap = TupleHeap::new();
        let addrs: Vec<_> = (0..5).map(|i| heap.allocate(row(i))).collect();
        let mut ctx = CopyOnWriteContext::new(0);

        ctx.mark_dirty(&mut heap, addrs[4], false);
        heap.release(addrs[4]);

        // Freed slot reused by a post-activation insert.
        let reused = heap.allocate(row(400));
        assert_eq!(reused, addrs[4]);
        ctx.mark_dirty(&mut heap, reused, true);

        assert_eq!(drain(&mut ctx, &mut heap), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_double_update_shadows_once() {
        let mut heap = TupleHeap::new();
        let addr = heap.allocate(row(7));
        heap.allocate(row(8));
        let mut ctx = CopyOnWriteContext::new(0);

        ctx.mark_dirty(&mut heap, addr, false);
        heap.get_mut(addr)
            .unwrap()
            .set_values(row(70).deep_clone_values());
        ctx.mark_dirty(&mut heap, addr, false);
        heap.get_mut(addr)
            .unwrap()
            .set_values(row(700).deep_clone_values());

        assert_eq!(drain(&mut ctx, &mut heap), vec![7, 8]);
    }

    #[test]
    fn test_mutation_behind_cursor_is_ignored() {
        let mut heap = TupleHeap::new();
        let addrs: Vec<_> = (0..3).map(|i| heap.allocate(row(i))).collect();
        let mut ctx = CopyOnWriteContext::new(0);

        // Pull everything, then mutate: nothing further is emitted.
        let mut out = BytesMut::new();
        while ctx.serialize_more(&mut heap, &mut out) {}

        ctx.mark_dirty(&mut heap, addrs[0], false);
        assert!(!heap.get(addrs[0]).unwrap().is_dirty());
        assert!(!ctx.serialize_more(&mut heap, &mut out));
    }

    #[test]
    fn test_chunked_pull() {
        let mut heap = TupleHeap::new();
        for i in 0..(SNAPSHOT_CHUNK_TUPLES as i64 * 2 + 5) {
            heap.allocate(row(i));
        }
        let mut ctx = CopyOnWriteContext::new(0);

        let mut out = BytesMut::new();
        assert!(ctx.serialize_more(&mut heap, &mut out));
        let first_chunk = out.len();
        assert!(first_chunk > 0);

        while ctx.serialize_more(&mut heap, &mut out) {}
        assert!(out.len() > first_chunk);
    }
}
