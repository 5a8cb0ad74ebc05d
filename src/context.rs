//! Execution context shared by the tables of one partition.
//!
//! [`ExecutorContext`] carries the partition/site identity, the transaction
//! bookkeeping the export stream stamps onto records, and the current
//! [`UndoQuantum`]. Tables hold an `Arc` to the context; the per-transaction
//! state sits behind a `parking_lot::Mutex` because the context is the one
//! piece of state handed across component boundaries.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::undo::UndoQuantum;

/// Transaction identifier (64-bit, engine-assigned, monotonic per partition).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId(i64);

impl TxnId {
    /// Sentinel for "no transaction" (0).
    pub const NONE: Self = Self(0);

    /// Creates a transaction ID.
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw i64 value.
    pub const fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Table identifier, unique within the hosting engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(u32);

impl TableId {
    /// Creates a table ID.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw u32 value.
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct TxnState {
    current_txn: TxnId,
    last_committed_txn: TxnId,
    txn_timestamp: i64,
    last_tick_time: i64,
    quantum: UndoQuantum,
}

/// Shared execution state for one partition.
pub struct ExecutorContext {
    partition_id: i32,
    site_id: i32,
    state: Mutex<TxnState>,
}

impl ExecutorContext {
    /// Creates a context in auto-commit mode (dummy undo quantum installed).
    pub fn new(partition_id: i32, site_id: i32) -> Arc<Self> {
        Arc::new(Self {
            partition_id,
            site_id,
            state: Mutex::new(TxnState {
                current_txn: TxnId::NONE,
                last_committed_txn: TxnId::NONE,
                txn_timestamp: 0,
                last_tick_time: 0,
                quantum: UndoQuantum::dummy(),
            }),
        })
    }

    /// Returns the partition ID.
    pub fn partition_id(&self) -> i32 {
        self.partition_id
    }

    /// Returns the site ID.
    pub fn site_id(&self) -> i32 {
        self.site_id
    }

    /// Returns the current transaction ID.
    pub fn current_txn(&self) -> TxnId {
        self.state.lock().current_txn
    }

    /// Returns the last committed transaction ID.
    pub fn last_committed_txn(&self) -> TxnId {
        self.state.lock().last_committed_txn
    }

    /// Returns the current transaction's timestamp.
    pub fn txn_timestamp(&self) -> i64 {
        self.state.lock().txn_timestamp
    }

    /// Returns the last tick time the host reported.
    pub fn last_tick_time(&self) -> i64 {
        self.state.lock().last_tick_time
    }

    /// Records a tick time from the host scheduler.
    pub fn set_last_tick_time(&self, time: i64) {
        self.state.lock().last_tick_time = time;
    }

    /// Opens a transaction: installs a fresh undo quantum and stamps the
    /// transaction identity. Any prior quantum is discarded.
    pub fn begin_transaction(&self, txn: TxnId, timestamp: i64) {
        let mut state = self.state.lock();
        state.current_txn = txn;
        state.txn_timestamp = timestamp;
        state.quantum = UndoQuantum::new();
    }

    /// Commits the current transaction: undo actions are discarded and the
    /// committed watermark advances.
    pub fn commit_transaction(&self) {
        let mut state = self.state.lock();
        state.last_committed_txn = state.current_txn;
        state.quantum = UndoQuantum::dummy();
    }

    /// Removes the current undo quantum for rollback, leaving the context in
    /// auto-commit mode. The caller replays the quantum against its tables.
    pub fn take_undo_quantum(&self) -> UndoQuantum {
        let mut state = self.state.lock();
        std::mem::replace(&mut state.quantum, UndoQuantum::dummy())
    }

    /// Runs a closure against the current undo quantum (registration path).
    pub(crate) fn with_quantum<R>(&self, f: impl FnOnce(&mut UndoQuantum) -> R) -> R {
        f(&mut self.state.lock().quantum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txn_lifecycle() {
        let ctx = ExecutorContext::new(3, 1);
        assert_eq!(ctx.partition_id(), 3);
        assert_eq!(ctx.site_id(), 1);
        assert_eq!(ctx.current_txn(), TxnId::NONE);
        assert!(ctx.with_quantum(|uq| uq.is_dummy()));

        ctx.begin_transaction(TxnId::new(7), 1_000);
        assert_eq!(ctx.current_txn(), TxnId::new(7));
        assert_eq!(ctx.txn_timestamp(), 1_000);
        assert!(!ctx.with_quantum(|uq| uq.is_dummy()));

        ctx.commit_transaction();
        assert_eq!(ctx.last_committed_txn(), TxnId::new(7));
        assert!(ctx.with_quantum(|uq| uq.is_dummy()));
    }

    #[test]
    fn test_take_undo_quantum_resets_to_dummy() {
        let ctx = ExecutorContext::new(0, 0);
        ctx.begin_transaction(TxnId::new(1), 0);
        let quantum = ctx.take_undo_quantum();
        assert!(!quantum.is_dummy());
        assert!(ctx.with_quantum(|uq| uq.is_dummy()));
    }

    #[test]
    fn test_tick_time() {
        let ctx = ExecutorContext::new(0, 0);
        ctx.set_last_tick_time(42);
        assert_eq!(ctx.last_tick_time(), 42);
    }
}
