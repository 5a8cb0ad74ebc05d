//! Transactional undo: per-transaction action log and rollback replay.
//!
//! An [`UndoQuantum`] is the per-transaction arena: it owns every
//! [`UndoAction`] registered during the transaction, along with the
//! pre-image tuples those actions carry (which is what keeps shared
//! out-of-line payload alive until commit or rollback). Commit discards the
//! quantum; rollback replays its actions in reverse registration order.
//!
//! A *dummy* quantum models auto-commit mode: registering an action against
//! it drops the action immediately, so nothing is retained and nothing can
//! be rolled back.
//!
//! Actions reference their table by [`TableId`] only, never by ownership;
//! rollback resolves the ID through a [`TableResolver`] supplied by the
//! enclosing engine.

use std::collections::HashMap;

use tracing::trace;

use crate::context::TableId;
use crate::heap::SlotAddr;
use crate::table::PersistentTable;
use crate::tuple::Tuple;

/// One reversible mutation, with enough captured state to restore the
/// table's invariants exactly.
pub enum UndoAction {
    /// Reverts an insert: deindex the slot, release it together with its
    /// payload, and truncate the export stream to the mark.
    Insert {
        /// Owning table.
        table: TableId,
        /// Slot the insert filled; rollback runs in reverse registration
        /// order, so the slot is still this insert's at replay time.
        addr: SlotAddr,
        /// Export position before the insert's append, if export is on.
        export_mark: Option<u64>,
    },
    /// Reverts a delete: reinsert the preserved tuple into a fresh slot
    /// without reallocating payload, and truncate the export stream.
    Delete {
        /// Owning table.
        table: TableId,
        /// The deleted tuple; this copy is what keeps its payload alive.
        tuple: Tuple,
        /// Export position before the delete's append, if export is on.
        export_mark: Option<u64>,
    },
    /// Reverts an in-place update: copy the pre-image back over the slot,
    /// optionally revert the index entries, and truncate the export stream.
    Update {
        /// Owning table.
        table: TableId,
        /// Slot the update mutated in place.
        addr: SlotAddr,
        /// Pre-image of the tuple (owns the old payload now).
        before: Tuple,
        /// Whether the update reached the index-maintenance step.
        revert_indexes: bool,
        /// The earliest export mark of the update's DELETE+INSERT pair.
        export_mark: Option<u64>,
    },
}

/// Resolves a [`TableId`] to the table it names during rollback.
///
/// # Panics
///
/// Implementations panic on an unknown ID; replaying an undo action against
/// a missing table is unrecoverable.
pub trait TableResolver {
    /// Returns the table registered under the ID.
    fn table_mut(&mut self, id: TableId) -> &mut PersistentTable;
}

impl TableResolver for HashMap<TableId, PersistentTable> {
    fn table_mut(&mut self, id: TableId) -> &mut PersistentTable {
        self.get_mut(&id)
            .unwrap_or_else(|| panic!("undo action references unknown table {}", id))
    }
}

/// Per-transaction arena and registration list for reversible actions.
pub struct UndoQuantum {
    actions: Vec<UndoAction>,
    dummy: bool,
}

impl UndoQuantum {
    /// Creates a quantum that retains registered actions for rollback.
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
            dummy: false,
        }
    }

    /// Creates a dummy quantum (auto-commit): registration drops the action.
    pub fn dummy() -> Self {
        Self {
            actions: Vec::new(),
            dummy: true,
        }
    }

    /// Returns true if this is a dummy quantum.
    pub fn is_dummy(&self) -> bool {
        self.dummy
    }

    /// Returns the number of retained actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns true if no actions are retained.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Takes ownership of an action.
    ///
    /// A dummy quantum drops it on the spot; a real quantum retains it for
    /// rollback.
    pub fn register(&mut self, action: UndoAction) {
        if !self.dummy {
            self.actions.push(action);
        }
    }

    /// Discards the quantum without replaying anything (commit).
    pub fn commit(self) {}

    /// Replays every retained action in reverse registration order.
    ///
    /// Undo-path mutations never raise user-visible violations: the state
    /// was valid before the transaction, so any failure to restore it is
    /// fatal inside the table's undo paths.
    pub fn rollback(self, tables: &mut dyn TableResolver) {
        trace!(actions = self.actions.len(), "rolling back undo quantum");
        for action in self.actions.into_iter().rev() {
            match action {
                UndoAction::Insert {
                    table,
                    addr,
                    export_mark,
                } => tables.table_mut(table).delete_for_undo(addr, export_mark),
                UndoAction::Delete {
                    table,
                    tuple,
                    export_mark,
                } => tables.table_mut(table).insert_for_undo(tuple, export_mark),
                UndoAction::Update {
                    table,
                    addr,
                    before,
                    revert_indexes,
                    export_mark,
                } => tables
                    .table_mut(table)
                    .update_for_undo(addr, before, revert_indexes, export_mark),
            }
        }
    }
}

impl Default for UndoQuantum {
    fn default() -> Self {
        Self::new()
    }
}
