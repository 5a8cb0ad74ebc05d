//! Export stream: append-only, rollback-capable log of row-level changes.
//!
//! Every user-initiated mutation appends change records here when export is
//! enabled on the table. Each append returns a *mark*, the absolute byte
//! offset the record starts at. Undo records capture the mark so a rollback
//! can truncate the stream back to the state before the mutation.
//!
//! # Record layout
//!
//! ```text
//! +------------------------+
//! | last_committed_txn i64 |
//! | current_txn        i64 |
//! | seq_no             i64 |
//! | timestamp          i64 |
//! | kind               u8  |  0 = INSERT, 1 = DELETE
//! | tuple_len          u32 |
//! | tuple bytes        ... |
//! +------------------------+
//! ```
//!
//! Offsets are absolute over the stream's lifetime: releasing consumed bytes
//! advances a base offset instead of renumbering, so marks held by undo
//! records stay valid.

use bytes::{BufMut, BytesMut};
use tracing::trace;

use crate::context::TxnId;
use crate::tuple::Tuple;

/// Change record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRecordKind {
    /// Row inserted.
    Insert,
    /// Row deleted.
    Delete,
}

impl StreamRecordKind {
    /// Wire value.
    pub const fn as_u8(self) -> u8 {
        match self {
            StreamRecordKind::Insert => 0,
            StreamRecordKind::Delete => 1,
        }
    }
}

/// Append-and-rollback wrapper over the downstream change log.
pub struct ExportStream {
    buf: BytesMut,
    /// Absolute offset of `buf[0]`.
    base: u64,
    /// (absolute start offset, appending txn) per record still buffered.
    records: Vec<(u64, TxnId)>,
    /// Absolute committed watermark; bytes below it survived a flush.
    committed: u64,
    /// Absolute poll cursor for the downstream consumer.
    poll: u64,
}

impl ExportStream {
    /// Creates an empty stream.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            base: 0,
            records: Vec::new(),
            committed: 0,
            poll: 0,
        }
    }

    /// Absolute end offset of the stream.
    pub fn end_offset(&self) -> u64 {
        self.base + self.buf.len() as u64
    }

    /// Appends one change record and returns its mark.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &mut self,
        last_committed_txn: TxnId,
        current_txn: TxnId,
        seq_no: i64,
        timestamp: i64,
        tuple: &Tuple,
        kind: StreamRecordKind,
    ) -> u64 {
        let mark = self.end_offset();
        self.records.push((mark, current_txn));

        self.buf.put_i64_le(last_committed_txn.as_i64());
        self.buf.put_i64_le(current_txn.as_i64());
        self.buf.put_i64_le(seq_no);
        self.buf.put_i64_le(timestamp);
        self.buf.put_u8(kind.as_u8());
        self.buf.put_u32_le(tuple.serialized_size() as u32);
        tuple.serialize(&mut self.buf);

        trace!(mark, seq_no, kind = ?kind, "export append");
        mark
    }

    /// Truncates the stream, discarding the record at the mark and
    /// everything appended after it.
    ///
    /// # Panics
    ///
    /// A mark below the committed watermark is corruption: committed bytes
    /// may already have been consumed downstream.
    pub fn rollback_to(&mut self, mark: u64) {
        assert!(
            mark >= self.committed,
            "export rollback to {} below committed watermark {}",
            mark,
            self.committed
        );
        self.buf.truncate((mark - self.base) as usize);
        self.records.retain(|&(offset, _)| offset < mark);
    }

    /// Advances the committed watermark past every record whose transaction
    /// is at or below `last_committed_txn`.
    ///
    /// The host calls this on its tick; `_time_millis` is the host clock,
    /// where a negative value requests an immediate flush. The watermark
    /// walk here is cheap enough to run unconditionally.
    pub fn periodic_flush(&mut self, _time_millis: i64, last_committed_txn: TxnId) {
        for &(offset, txn) in &self.records {
            if txn > last_committed_txn {
                self.committed = self.committed.max(offset);
                return;
            }
        }
        // Every buffered record is committed.
        self.committed = self.end_offset();
    }

    /// Returns the committed, unreleased bytes.
    pub fn committed_bytes(&self) -> &[u8] {
        &self.buf[..(self.committed - self.base) as usize]
    }

    /// Releases (drops) stream bytes below the given absolute offset.
    ///
    /// Returns false if the offset exceeds the committed watermark.
    pub fn release_bytes(&mut self, release_offset: u64) -> bool {
        if release_offset > self.committed || release_offset < self.base {
            return false;
        }
        let cut = (release_offset - self.base) as usize;
        let _ = self.buf.split_to(cut);
        self.base = release_offset;
        self.records.retain(|&(offset, _)| offset >= release_offset);
        self.poll = self.poll.max(self.base);
        true
    }

    /// Resets the downstream poll cursor back to the oldest retained byte.
    pub fn reset_poll_marker(&mut self) {
        self.poll = self.base;
    }

    /// Returns the downstream poll cursor.
    pub fn poll_marker(&self) -> u64 {
        self.poll
    }

    /// Advances the downstream poll cursor.
    pub fn set_poll_marker(&mut self, offset: u64) {
        self.poll = offset.clamp(self.base, self.end_offset());
    }
}

impl Default for ExportStream {
    fn default() -> Self {
        Self::new()
    }
}
