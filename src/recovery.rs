//! Recovery stream: replaying table contents to a catching-up replica.
//!
//! A [`RecoveryContext`] is a one-shot cursor that serializes the table's
//! tuples into typed messages. The receiving side feeds each message to
//! `PersistentTable::process_recovery_message`, which bulk-loads the tuples
//! without view or export events unless the caller asks for them.
//!
//! # Message layout (SCAN_TUPLES)
//!
//! ```text
//! +-----------------------+
//! | kind             u8   |  1 = SCAN_TUPLES
//! | table_id         u32  |
//! | total_tuples     u32  |  active count at streaming time
//! | chunk_tuples     u32  |  records in this message
//! | records          ...  |  u32 length prefix + record bytes, each
//! +-----------------------+
//! ```

use bytes::{BufMut, BytesMut};
use tracing::debug;

use crate::context::TableId;
use crate::heap::TupleHeap;
use crate::tuple::Tuple;

/// Message kind: a chunk of tuples from a full table scan.
pub const RECOVERY_MSG_SCAN_TUPLES: u8 = 1;

/// Tuples per recovery message.
pub const RECOVERY_CHUNK_TUPLES: usize = 64;

/// One-shot streaming cursor over a table's tuples.
pub struct RecoveryContext {
    table_id: TableId,
    cursor_block: u32,
    cursor_offset: u32,
    done: bool,
}

impl RecoveryContext {
    /// Creates a context positioned at the start of the heap.
    pub(crate) fn new(table_id: TableId) -> Self {
        debug!(%table_id, "recovery stream activated");
        Self {
            table_id,
            cursor_block: 0,
            cursor_offset: 0,
            done: false,
        }
    }

    /// Returns the table this stream describes.
    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    /// Writes the next message into `out`. Returns true while more messages
    /// remain; the caller tears the context down once it returns false.
    ///
    /// The writer must not mutate the table between pulls; recovery streams
    /// run while the partition is quiesced for the peer.
    pub(crate) fn next_message(&mut self, heap: &TupleHeap, out: &mut BytesMut) -> bool {
        if self.done {
            return false;
        }

        out.put_u8(RECOVERY_MSG_SCAN_TUPLES);
        out.put_u32_le(self.table_id.as_u32());
        out.put_u32_le(heap.active_count() as u32);
        let count_at = out.len();
        out.put_u32_le(0);

        let mut chunk = 0u32;
        while chunk < RECOVERY_CHUNK_TUPLES as u32 {
            if self.cursor_block as usize >= heap.block_count() {
                self.done = true;
                break;
            }
            if self.cursor_offset as usize >= heap.block_len(self.cursor_block) {
                self.cursor_block += 1;
                self.cursor_offset = 0;
                continue;
            }
            let addr = crate::heap::SlotAddr::new(self.cursor_block, self.cursor_offset);
            self.cursor_offset += 1;
            if let Some(tuple) = heap.get(addr) {
                out.put_u32_le(tuple.serialized_size() as u32);
                tuple.serialize(out);
                chunk += 1;
            }
        }
        out[count_at..count_at + 4].copy_from_slice(&chunk.to_le_bytes());

        !self.done
    }
}

/// A decoded SCAN_TUPLES message.
pub(crate) struct ScanTuplesMessage {
    pub table_id: TableId,
    pub total_tuples: u32,
    pub tuples: Vec<Tuple>,
}

impl ScanTuplesMessage {
    /// Decodes a recovery message.
    ///
    /// # Panics
    ///
    /// An unknown message kind or a malformed payload is corruption of the
    /// recovery channel and fatal.
    pub(crate) fn decode(msg: &[u8], types: &[crate::datum::Type]) -> Self {
        use bytes::Buf;

        let mut buf = msg;
        assert!(buf.remaining() >= 13, "recovery message header truncated");
        let kind = buf.get_u8();
        assert_eq!(
            kind, RECOVERY_MSG_SCAN_TUPLES,
            "recovery message of unknown kind {}",
            kind
        );
        let table_id = TableId::new(buf.get_u32_le());
        let total_tuples = buf.get_u32_le();
        let chunk = buf.get_u32_le();

        let mut tuples = Vec::with_capacity(chunk as usize);
        for _ in 0..chunk {
            assert!(buf.remaining() >= 4, "recovery record truncated");
            let len = buf.get_u32_le() as usize;
            assert!(buf.remaining() >= len, "recovery record truncated");
            let mut record = &buf[..len];
            let tuple = Tuple::deserialize(&mut record, types)
                .unwrap_or_else(|e| panic!("malformed recovery record: {}", e));
            buf.advance(len);
            tuples.push(tuple);
        }
        Self {
            table_id,
            total_tuples,
            tuples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datum::{Datum, Type};

    fn row(id: i64) -> Tuple {
        Tuple::new(vec![Datum::Int64(id)])
    }

    #[test]
    fn test_stream_and_decode() {
        let mut heap = TupleHeap::new();
        for i in 0..150 {
            heap.allocate(row(i));
        }

        let mut ctx = RecoveryContext::new(TableId::new(9));
        let mut ids = Vec::new();
        let mut messages = 0;
        loop {
            let mut out = BytesMut::new();
            let more = ctx.next_message(&heap, &mut out);
            messages += 1;
            let msg = ScanTuplesMessage::decode(&out, &[Type::Int64]);
            assert_eq!(msg.table_id, TableId::new(9));
            assert_eq!(msg.total_tuples, 150);
            for t in &msg.tuples {
                match t.get(0) {
                    Datum::Int64(v) => ids.push(*v),
                    _ => unreachable!(),
                }
            }
            if !more {
                break;
            }
        }

        assert!(messages >= 3);
        assert_eq!(ids, (0..150).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_heap_single_empty_message() {
        let heap = TupleHeap::new();
        let mut ctx = RecoveryContext::new(TableId::new(1));
        let mut out = BytesMut::new();
        assert!(!ctx.next_message(&heap, &mut out));
        let msg = ScanTuplesMessage::decode(&out, &[Type::Int64]);
        assert_eq!(msg.total_tuples, 0);
        assert!(msg.tuples.is_empty());
    }

    #[test]
    #[should_panic(expected = "unknown kind")]
    fn test_unknown_kind_is_fatal() {
        let mut out = BytesMut::new();
        out.put_u8(0xee);
        out.put_u32_le(0);
        out.put_u32_le(0);
        out.put_u32_le(0);
        ScanTuplesMessage::decode(&out, &[Type::Int64]);
    }
}
