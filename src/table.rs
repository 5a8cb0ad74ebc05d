//! The persistent table facade.
//!
//! [`PersistentTable`] binds the tuple heap, the index set, constraint
//! checking, undo logging, export streaming, view fan-out, the
//! copy-on-write snapshot, the recovery stream, and (behind the `anticache`
//! feature) cold-tuple eviction into one mutation and read API.
//!
//! A mutation flows facade → not-null check → heap → indexes (with rollback
//! on failure) → export append → undo registration → view fan-out. Each
//! mutation runs atomically on the table's executor; the snapshot and
//! recovery readers interleave only at their pull calls.
//!
//! Undo-path variants of the mutations (`*_for_undo`) mirror the forward
//! logic but never emit view or export events, always truncate the export
//! stream to the undo record's mark, and treat any integrity failure as
//! fatal: the state was valid before the transaction, so failing to restore
//! it is corruption.

mod error;

pub use error::ConstraintError;

use std::sync::Arc;

use bytes::BytesMut;
use crc::{Crc, CRC_64_ECMA_182};
use tracing::{debug, trace};

use crate::context::{ExecutorContext, TableId, TxnId};
use crate::export::{ExportStream, StreamRecordKind};
use crate::heap::{SlotAddr, TupleHeap};
use crate::index::{IndexSet, IndexSpec, TableIndex};
use crate::recovery::{RecoveryContext, ScanTuplesMessage};
use crate::schema::Schema;
use crate::snapshot::{CopyOnWriteContext, CowActivation};
use crate::tuple::Tuple;
use crate::undo::{TableResolver, UndoAction};
use crate::view::{MaterializedView, ViewDispatcher};

#[cfg(feature = "anticache")]
use bytes::{Buf, BufMut};
#[cfg(feature = "anticache")]
use tracing::info;

#[cfg(feature = "anticache")]
use crate::anticache::{AntiCacheError, BlockId, BlockStore, EvictedBlock, EvictedTable};
#[cfg(feature = "anticache")]
use crate::datum::Datum;

/// Observable counters for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableStats {
    /// Table name.
    pub name: String,
    /// Live tuples in the heap.
    pub active_tuple_count: usize,
    /// Tuples currently migrated to block storage.
    pub tuples_evicted: u64,
    /// Blocks written to block storage.
    pub blocks_evicted: u64,
    /// Bytes written to block storage.
    pub bytes_evicted: u64,
    /// Per-index entry counts, in registration order.
    pub index_entries: Vec<(String, usize)>,
}

/// Summary of one eviction pass.
#[cfg(feature = "anticache")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionSummary {
    /// Store-assigned id of the written block.
    pub block_id: BlockId,
    /// Tuples migrated into the block.
    pub tuples: u32,
    /// Serialized bytes written.
    pub bytes: u64,
}

/// A schema'd heap of tuples kept consistent with its indexes, undo log,
/// export stream, and registered views.
pub struct PersistentTable {
    id: TableId,
    name: String,
    schema: Schema,
    allow_nulls: Box<[bool]>,
    ctx: Arc<ExecutorContext>,
    heap: TupleHeap,
    indexes: IndexSet,
    views: ViewDispatcher,
    export: Option<ExportStream>,
    export_seq: i64,
    cow: Option<CopyOnWriteContext>,
    recovery: Option<RecoveryContext>,
    tuples_evicted: u64,
    blocks_evicted: u64,
    bytes_evicted: u64,
    #[cfg(feature = "anticache")]
    evicted: Option<EvictedTable>,
    #[cfg(feature = "anticache")]
    staged: BytesMut,
    #[cfg(feature = "anticache")]
    staged_blocks: u64,
}

impl PersistentTable {
    /// Creates an empty table bound to the executor context.
    pub fn new(
        id: TableId,
        name: &str,
        schema: Schema,
        ctx: Arc<ExecutorContext>,
        export_enabled: bool,
    ) -> Self {
        let allow_nulls = schema.allow_null_mask();
        Self {
            id,
            name: name.to_string(),
            schema,
            allow_nulls,
            ctx,
            heap: TupleHeap::new(),
            indexes: IndexSet::new(),
            views: ViewDispatcher::new(),
            export: export_enabled.then(ExportStream::new),
            export_seq: 0,
            cow: None,
            recovery: None,
            tuples_evicted: 0,
            blocks_evicted: 0,
            bytes_evicted: 0,
            #[cfg(feature = "anticache")]
            evicted: None,
            #[cfg(feature = "anticache")]
            staged: BytesMut::new(),
            #[cfg(feature = "anticache")]
            staged_blocks: 0,
        }
    }

    /// Adds an index built from the scheme; `primary` designates the
    /// table's primary-key index.
    ///
    /// # Panics
    ///
    /// Panics if data is already loaded, if a keyed column is out of range,
    /// or on the [`IndexSet::add`] invariants.
    pub fn add_index(&mut self, spec: IndexSpec, primary: bool) {
        assert!(
            self.heap.is_empty(),
            "indexes must be added to table '{}' before data is loaded",
            self.name
        );
        for &column in &spec.columns {
            assert!(
                column < self.schema.column_count(),
                "index '{}' keys column {} but table '{}' has {} columns",
                spec.name,
                column,
                self.name,
                self.schema.column_count()
            );
        }
        self.indexes.add(spec, primary);
    }

    /// Registers a materialized view; the table owns it.
    pub fn add_view(&mut self, view: Box<dyn MaterializedView + Send>) {
        self.views.add(view);
    }

    /// Returns the table ID.
    pub fn table_id(&self) -> TableId {
        self.id
    }

    /// Returns the table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the schema.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Returns the index set.
    pub fn indexes(&self) -> &IndexSet {
        &self.indexes
    }

    /// Returns the named index.
    ///
    /// # Panics
    ///
    /// Panics with the known-index listing on a miss; asking for a
    /// nonexistent index is a host wiring bug.
    pub fn index(&self, name: &str) -> &TableIndex {
        self.indexes.get(name).unwrap_or_else(|| {
            let known: Vec<&str> = self.indexes.iter().map(TableIndex::name).collect();
            panic!(
                "no index '{}' on table '{}' (known indexes: {:?})",
                name, self.name, known
            )
        })
    }

    /// Returns every index name, in registration order.
    pub fn index_names(&self) -> Vec<&str> {
        self.indexes.iter().map(TableIndex::name).collect()
    }

    /// Returns the number of live tuples.
    pub fn active_tuple_count(&self) -> usize {
        self.heap.active_count()
    }

    /// Returns the tuple at an address, or `None` for an inactive slot.
    pub fn get(&self, addr: SlotAddr) -> Option<&Tuple> {
        self.heap.get(addr)
    }

    /// Iterates every live tuple in heap order.
    pub fn iter(&self) -> impl Iterator<Item = (SlotAddr, &Tuple)> {
        self.heap.iter()
    }

    /// Returns the observable counters.
    pub fn stats(&self) -> TableStats {
        TableStats {
            name: self.name.clone(),
            active_tuple_count: self.heap.active_count(),
            tuples_evicted: self.tuples_evicted,
            blocks_evicted: self.blocks_evicted,
            bytes_evicted: self.bytes_evicted,
            index_entries: self
                .indexes
                .iter()
                .map(|i| (i.name().to_string(), i.len()))
                .collect(),
        }
    }

    // ------------------------------------------------------------------
    // Mutation API
    // ------------------------------------------------------------------

    /// Inserts a tuple: copies it into a fresh slot (allocating new
    /// out-of-line payload), indexes it, appends to the export stream,
    /// registers undo, and fires view callbacks.
    ///
    /// # Errors
    ///
    /// [`ConstraintError::NotNull`] if a non-nullable column holds NULL;
    /// [`ConstraintError::Unique`] if any unique index rejects the key. In
    /// both cases the table is left exactly as it was.
    pub fn insert(&mut self, source: &Tuple) -> Result<SlotAddr, ConstraintError> {
        debug_assert!(
            self.schema.first_type_mismatch(source).is_none(),
            "tuple does not conform to schema of table '{}'",
            self.name
        );
        if let Some(column) = self.check_nulls(source) {
            debug!(table = %self.name, column, "insert rejected by not-null constraint");
            return Err(ConstraintError::NotNull {
                table: self.name.clone(),
                column: self.schema.column(column).name.clone(),
            });
        }

        let addr = self
            .heap
            .allocate(Tuple::new(source.deep_clone_values().into_vec()));

        // Inserts never dirty a tuple on their own, but a snapshot cursor
        // still approaching this slot must be told to skip it.
        if let Some(cow) = self.cow.as_mut() {
            cow.mark_dirty(&mut self.heap, addr, true);
        } else if let Some(tuple) = self.heap.get_mut(addr) {
            tuple.flags_mut().set_dirty(false);
        }

        let violation = {
            let tuple = self.heap.get(addr).expect("slot just allocated");
            self.indexes.insert_all(tuple, addr).err()
        };
        if let Some(position) = violation {
            let index = self
                .indexes
                .iter()
                .nth(position)
                .map(|i| i.name().to_string())
                .unwrap_or_default();
            // Slot release drops the freshly allocated payload with it.
            self.heap.release(addr);
            return Err(ConstraintError::Unique {
                table: self.name.clone(),
                index,
            });
        }

        let export_mark = self.append_export(addr, StreamRecordKind::Insert);

        let action = UndoAction::Insert {
            table: self.id,
            addr,
            export_mark,
        };
        self.ctx.with_quantum(|uq| uq.register(action));

        if !self.views.is_empty() {
            let tuple = self.heap.get(addr).expect("active");
            self.views.dispatch_insert(tuple);
        }

        trace!(table = %self.name, %addr, "inserted tuple");
        Ok(addr)
    }

    /// Updates the tuple at `target` in place with `source`'s values,
    /// allocating new out-of-line payload.
    ///
    /// `updates_indexes` is the planner's verdict on whether any keyed
    /// column can change; when false the index maintenance step is skipped
    /// entirely.
    ///
    /// # Errors
    ///
    /// [`ConstraintError::Unique`] if a changed key collides (checked before
    /// any index is touched); [`ConstraintError::NotNull`] if the post-copy
    /// image violates nullability, checked after the copy because the
    /// source may carry garbage in columns the update ignores. On either
    /// error the registered undo record restores the pre-image when the
    /// enclosing quantum rolls back.
    pub fn update(
        &mut self,
        target: SlotAddr,
        source: &Tuple,
        updates_indexes: bool,
    ) -> Result<(), ConstraintError> {
        let before = self
            .heap
            .get(target)
            .unwrap_or_else(|| panic!("update of inactive slot {} in table '{}'", target, self.name))
            .clone();

        // The snapshot must see the pre-image.
        if let Some(cow) = self.cow.as_mut() {
            cow.mark_dirty(&mut self.heap, target, false);
        }

        {
            // The dirty flag set (or cleared) above survives the copy.
            let tuple = self.heap.get_mut(target).expect("active");
            tuple.set_values(source.deep_clone_values());
        }

        let mut revert_indexes = false;
        let mut export_mark = None;

        if updates_indexes {
            let collision = {
                let after = self.heap.get(target).expect("active");
                !self.indexes.try_update_check(&before, after)
            };
            if collision {
                let index = {
                    let after = self.heap.get(target).expect("active");
                    self.indexes
                        .iter()
                        .find(|i| {
                            i.spec().unique && i.key_changed(&before, after) && i.exists(after)
                        })
                        .map(|i| i.name().to_string())
                        .unwrap_or_default()
                };
                // The pre-image is preserved for the quantum's rollback; the
                // indexes were never touched.
                self.register_update_undo(target, before, false, None);
                return Err(ConstraintError::Unique {
                    table: self.name.clone(),
                    index,
                });
            }
            revert_indexes = true;
            {
                let after = self.heap.get(target).expect("active");
                self.indexes.replace_all(&before, after, target);
            }
        }

        if self.export.is_some() {
            // DELETE then INSERT, sharing one sequence number; undo stores
            // the earliest mark so rollback unwinds both records.
            let (last_committed, current, timestamp) = self.export_stamp();
            let seq = self.export_seq;
            self.export_seq += 1;
            let stream = self.export.as_mut().expect("export enabled");
            let mark = stream.append(
                last_committed,
                current,
                seq,
                timestamp,
                &before,
                StreamRecordKind::Delete,
            );
            let after = self.heap.get(target).expect("active");
            stream.append(
                last_committed,
                current,
                seq,
                timestamp,
                after,
                StreamRecordKind::Insert,
            );
            export_mark = Some(mark);
        }

        {
            let after = self.heap.get(target).expect("active");
            self.views.dispatch_update(&before, after);
        }

        let null_violation = {
            let after = self.heap.get(target).expect("active");
            self.check_nulls(after)
        };
        if let Some(column) = null_violation {
            let column = self.schema.column(column).name.clone();
            self.register_update_undo(target, before, revert_indexes, export_mark);
            return Err(ConstraintError::NotNull {
                table: self.name.clone(),
                column,
            });
        }

        self.register_update_undo(target, before, revert_indexes, export_mark);
        trace!(table = %self.name, addr = %target, "updated tuple");
        Ok(())
    }

    /// Deletes the tuple at `target`: deindexes it, registers undo (which
    /// keeps the payload alive), appends to the export stream, fires view
    /// callbacks, and releases the slot.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not active; deleting twice is corruption.
    pub fn delete(&mut self, target: SlotAddr) {
        let tuple = self
            .heap
            .get(target)
            .unwrap_or_else(|| panic!("delete of inactive slot {} in table '{}'", target, self.name))
            .clone();

        // Just like insert, remove this tuple from every index first.
        self.indexes.delete_all(&tuple, target);

        // A user-initiated delete must hand the snapshot its pre-image.
        if let Some(cow) = self.cow.as_mut() {
            cow.mark_dirty(&mut self.heap, target, false);
        }

        self.views.dispatch_delete(&tuple);

        let export_mark = if self.export.is_some() {
            let (last_committed, current, timestamp) = self.export_stamp();
            let seq = self.export_seq;
            self.export_seq += 1;
            let stream = self.export.as_mut().expect("export enabled");
            Some(stream.append(
                last_committed,
                current,
                seq,
                timestamp,
                &tuple,
                StreamRecordKind::Delete,
            ))
        } else {
            None
        };

        let action = UndoAction::Delete {
            table: self.id,
            tuple,
            export_mark,
        };
        self.ctx.with_quantum(|uq| uq.register(action));

        self.heap.release(target);
        trace!(table = %self.name, addr = %target, "deleted tuple");
    }

    /// Deletes every live tuple through the regular delete path.
    pub fn delete_all_tuples(&mut self) {
        let addrs: Vec<SlotAddr> = self.heap.iter().map(|(addr, _)| addr).collect();
        for addr in addrs {
            self.delete(addr);
        }
    }

    /// Finds a tuple by value: primary-key probe when a primary index
    /// exists, heap scan with value equality otherwise.
    pub fn lookup(&self, probe: &Tuple) -> Option<SlotAddr> {
        match self.indexes.primary() {
            Some(pk) => pk.get(probe),
            None => self
                .heap
                .iter()
                .find(|(_, tuple)| *tuple == probe)
                .map(|(addr, _)| addr),
        }
    }

    // ------------------------------------------------------------------
    // Undo paths
    // ------------------------------------------------------------------

    /// Reverts a delete: reinserts the preserved tuple into a fresh slot
    /// without allocating new payload, without view or export events.
    pub(crate) fn insert_for_undo(&mut self, tuple: Tuple, export_mark: Option<u64>) {
        if let Some(column) = self.check_nulls(&tuple) {
            panic!(
                "failed to reinsert tuple into table '{}' for undo: null constraint on column '{}'",
                self.name,
                self.schema.column(column).name
            );
        }

        if let (Some(mark), Some(stream)) = (export_mark, self.export.as_mut()) {
            stream.rollback_to(mark);
        }

        let mut tuple = tuple;
        tuple.flags_mut().set_dirty(false);
        tuple.flags_mut().set_evicted(false);
        let addr = self.heap.allocate(tuple);

        // Even though this tuple is being reintroduced, the snapshot must
        // treat it as new: its pre-image was already captured when the
        // delete ran, and a second copy would double it.
        if let Some(cow) = self.cow.as_mut() {
            cow.mark_dirty(&mut self.heap, addr, true);
        } else if let Some(stored) = self.heap.get_mut(addr) {
            stored.flags_mut().set_dirty(false);
        }

        let ok = {
            let stored = self.heap.get(addr).expect("slot just allocated");
            self.indexes.insert_all(stored, addr).is_ok()
        };
        if !ok {
            self.heap.release(addr);
            panic!(
                "failed to reinsert tuple into table '{}' for undo: unique constraint violation",
                self.name
            );
        }
    }

    /// Reverts an insert: deindexes the slot and releases it together with
    /// its payload. The slot is addressed directly; rollback runs in
    /// reverse registration order, so it still holds this insert's tuple.
    pub(crate) fn delete_for_undo(&mut self, addr: SlotAddr, export_mark: Option<u64>) {
        let stored = self
            .heap
            .get(addr)
            .unwrap_or_else(|| {
                panic!(
                    "failed to delete tuple from table '{}' for undo: slot {} is inactive",
                    self.name, addr
                )
            })
            .clone();

        if let (Some(mark), Some(stream)) = (export_mark, self.export.as_mut()) {
            stream.rollback_to(mark);
        }

        self.indexes.delete_all(&stored, addr);
        self.heap.release(addr);
    }

    /// Reverts an in-place update: copies the pre-image back over the slot
    /// (preserving the dirty flag), reverts index entries if the forward
    /// path reached them, and truncates the export stream.
    pub(crate) fn update_for_undo(
        &mut self,
        addr: SlotAddr,
        before: Tuple,
        revert_indexes: bool,
        export_mark: Option<u64>,
    ) {
        // Back up the updated image first: the indexes need it to find
        // their entries while reverting.
        let backup = self
            .heap
            .get(addr)
            .unwrap_or_else(|| {
                panic!(
                    "failed to revert update in table '{}': slot {} is inactive",
                    self.name, addr
                )
            })
            .clone();

        {
            let tuple = self.heap.get_mut(addr).expect("active");
            let dirty = tuple.is_dirty();
            tuple.set_values(before.into_values());
            tuple.flags_mut().set_dirty(dirty);
        }

        if revert_indexes {
            let ok = {
                let restored = self.heap.get(addr).expect("active");
                self.indexes.try_update_check(&backup, restored)
            };
            if !ok {
                panic!(
                    "failed to revert update in table '{}': unique constraint violation",
                    self.name
                );
            }
            let restored = self.heap.get(addr).expect("active");
            self.indexes.replace_all(&backup, restored, addr);
        }

        if let (Some(mark), Some(stream)) = (export_mark, self.export.as_mut()) {
            stream.rollback_to(mark);
        }
    }

    // ------------------------------------------------------------------
    // Copy-on-write snapshot
    // ------------------------------------------------------------------

    /// Switches the table to copy-on-write mode.
    pub fn activate_copy_on_write(&mut self) -> CowActivation {
        if self.cow.is_some() {
            return CowActivation::AlreadyActive;
        }
        if self.heap.is_empty() {
            return CowActivation::EmptyTable;
        }
        self.cow = Some(CopyOnWriteContext::new(self.ctx.partition_id()));
        CowActivation::Activated
    }

    /// Serializes the next snapshot chunk. Returns true while more remains;
    /// the context tears down once everything has been emitted.
    pub fn serialize_snapshot(&mut self, out: &mut BytesMut) -> bool {
        let Some(cow) = self.cow.as_mut() else {
            return false;
        };
        let more = cow.serialize_more(&mut self.heap, out);
        if !more {
            debug!(table = %self.name, "copy-on-write snapshot complete");
            self.cow = None;
        }
        more
    }

    // ------------------------------------------------------------------
    // Recovery stream
    // ------------------------------------------------------------------

    /// Creates a recovery stream for this table. Returns true if one is
    /// already active.
    pub fn activate_recovery_stream(&mut self) -> bool {
        if self.recovery.is_some() {
            return true;
        }
        self.recovery = Some(RecoveryContext::new(self.id));
        false
    }

    /// Serializes the next recovery message. Returns true while more
    /// messages remain; the context tears down once complete.
    pub fn next_recovery_message(&mut self, out: &mut BytesMut) -> bool {
        let Some(recovery) = self.recovery.as_mut() else {
            return false;
        };
        let more = recovery.next_message(&self.heap, out);
        if !more {
            debug!(table = %self.name, "recovery stream complete");
            self.recovery = None;
        }
        more
    }

    /// Applies a recovery message on the receiving side.
    ///
    /// An empty table pre-sizes every index for the stream's total tuple
    /// count. Loaded tuples skip undo logging, and skip view/export events
    /// unless `fire_events` asks for them.
    pub fn process_recovery_message(&mut self, msg: &[u8], fire_events: bool) {
        let types = self.schema.types();
        let decoded = ScanTuplesMessage::decode(msg, &types);
        debug_assert_eq!(decoded.table_id, self.id, "recovery message routed to wrong table");

        if self.heap.is_empty() {
            self.indexes.ensure_capacity(decoded.total_tuples as usize);
        }
        for tuple in decoded.tuples {
            self.load_tuple(tuple, fire_events);
        }
    }

    /// Bulk-loads one tuple: heap + indexes, no undo.
    fn load_tuple(&mut self, tuple: Tuple, fire_events: bool) {
        let addr = self.heap.allocate(Tuple::new(tuple.into_values().into_vec()));

        if let Some(cow) = self.cow.as_mut() {
            cow.mark_dirty(&mut self.heap, addr, true);
        } else if let Some(stored) = self.heap.get_mut(addr) {
            stored.flags_mut().set_dirty(false);
        }

        let ok = {
            let stored = self.heap.get(addr).expect("slot just allocated");
            self.indexes.insert_all(stored, addr).is_ok()
        };
        if !ok {
            panic!(
                "failed to load tuple into table '{}': unique constraint violation",
                self.name
            );
        }

        if fire_events {
            {
                let stored = self.heap.get(addr).expect("active");
                self.views.dispatch_insert(stored);
            }
            self.append_export(addr, StreamRecordKind::Insert);
        }
    }

    // ------------------------------------------------------------------
    // Export plumbing
    // ------------------------------------------------------------------

    /// Advances the export stream's committed watermark. A negative time
    /// forces a flush in the downstream wrapper.
    pub fn flush_old_tuples(&mut self, time_millis: i64) {
        let last_committed = self.ctx.last_committed_txn();
        if let Some(stream) = self.export.as_mut() {
            stream.periodic_flush(time_millis, last_committed);
        }
    }

    /// Returns the committed, unreleased export bytes, if export is on.
    pub fn committed_export_bytes(&self) -> Option<&[u8]> {
        self.export.as_ref().map(ExportStream::committed_bytes)
    }

    /// Releases consumed export bytes below the absolute offset.
    pub fn release_export_bytes(&mut self, offset: u64) -> bool {
        self.export
            .as_mut()
            .is_some_and(|stream| stream.release_bytes(offset))
    }

    /// Resets the export poll cursor to the oldest retained byte.
    pub fn reset_export_poll_marker(&mut self) {
        if let Some(stream) = self.export.as_mut() {
            stream.reset_poll_marker();
        }
    }

    fn export_stamp(&self) -> (TxnId, TxnId, i64) {
        (
            self.ctx.last_committed_txn(),
            self.ctx.current_txn(),
            self.ctx.txn_timestamp(),
        )
    }

    fn append_export(&mut self, addr: SlotAddr, kind: StreamRecordKind) -> Option<u64> {
        if self.export.is_none() {
            return None;
        }
        let (last_committed, current, timestamp) = self.export_stamp();
        let seq = self.export_seq;
        self.export_seq += 1;
        let tuple = self.heap.get(addr).expect("active");
        let stream = self.export.as_mut().expect("export enabled");
        Some(stream.append(last_committed, current, seq, timestamp, tuple, kind))
    }

    // ------------------------------------------------------------------
    // Content hash
    // ------------------------------------------------------------------

    /// Folds a hash over the table contents in primary-key order.
    ///
    /// Builds a fresh ordered index over the primary-key scheme, walks it in
    /// key order, and chains each tuple's CRC-64 content hash, so the result
    /// depends on the logical contents and never on insertion order.
    ///
    /// # Panics
    ///
    /// Panics if the table has no primary-key index.
    pub fn content_hash(&self) -> u64 {
        let pk = self.indexes.primary().unwrap_or_else(|| {
            panic!(
                "content hash of table '{}' requires a primary-key index",
                self.name
            )
        });
        let mut spec = pk.spec().clone();
        spec.ordered = true;
        let mut ordered = TableIndex::build(spec);
        for (addr, tuple) in self.heap.iter() {
            assert!(
                ordered.add_entry(tuple, addr),
                "duplicate primary key while hashing table '{}'",
                self.name
            );
        }

        let crc64 = Crc::<u64>::new(&CRC_64_ECMA_182);
        let mut hash = 0u64;
        let mut buf = BytesMut::new();
        for addr in ordered.addrs_in_key_order() {
            let tuple = self.heap.get(addr).expect("indexed slot is active");
            buf.clear();
            tuple.serialize(&mut buf);
            hash = hash.rotate_left(13) ^ crc64.checksum(&buf);
        }
        hash
    }

    // ------------------------------------------------------------------
    // Constraint checking
    // ------------------------------------------------------------------

    /// Returns the first column violating the not-null policy, if any.
    fn check_nulls(&self, tuple: &Tuple) -> Option<usize> {
        debug_assert_eq!(tuple.values().len(), self.allow_nulls.len());
        tuple
            .values()
            .iter()
            .enumerate()
            .find_map(|(i, datum)| (datum.is_null() && !self.allow_nulls[i]).then_some(i))
    }

    fn register_update_undo(
        &mut self,
        addr: SlotAddr,
        before: Tuple,
        revert_indexes: bool,
        export_mark: Option<u64>,
    ) {
        let action = UndoAction::Update {
            table: self.id,
            addr,
            before,
            revert_indexes,
            export_mark,
        };
        self.ctx.with_quantum(|uq| uq.register(action));
    }
}

impl TableResolver for PersistentTable {
    fn table_mut(&mut self, id: TableId) -> &mut PersistentTable {
        assert_eq!(
            id, self.id,
            "undo action references table {} but resolver holds '{}' ({})",
            id, self.name, self.id
        );
        self
    }
}

// ------------------------------------------------------------------
// Anti-cache eviction
// ------------------------------------------------------------------

#[cfg(feature = "anticache")]
impl PersistentTable {
    /// Binds the surrogate table, deriving its schema from the primary-key
    /// columns. Must be called before [`evict_block`](Self::evict_block).
    ///
    /// # Panics
    ///
    /// Panics if the table has no primary-key index.
    pub fn bind_evicted_table(&mut self) {
        let pk = self.indexes.primary().unwrap_or_else(|| {
            panic!(
                "table '{}' needs a primary-key index before anti-cache eviction",
                self.name
            )
        });
        info!(table = %self.name, "initialized evicted table");
        self.evicted = Some(EvictedTable::new(&self.schema, &pk.spec().columns));
    }

    /// Returns the bound surrogate table, if any.
    pub fn evicted_table(&self) -> Option<&EvictedTable> {
        self.evicted.as_ref()
    }

    /// Migrates cold tuples into one external block, stopping before the
    /// serialized size would exceed `byte_budget`.
    ///
    /// For each chosen tuple: a surrogate row (primary-key columns plus the
    /// block id) lands in the evicted table, every index entry is rewritten
    /// to the surrogate's address, the raw bytes go into the block, and the
    /// slot is released. The release skips undo and index maintenance:
    /// eviction is not transactional, and the entries already moved.
    ///
    /// # Panics
    ///
    /// Panics if no evicted table is bound.
    pub fn evict_block(
        &mut self,
        store: &mut dyn BlockStore,
        byte_budget: usize,
    ) -> Result<EvictionSummary, AntiCacheError> {
        assert!(
            self.evicted.is_some(),
            "trying to evict a block from table '{}' before its evicted table has been bound",
            self.name
        );
        let key_columns = self
            .indexes
            .primary()
            .expect("evicted table bound implies primary index")
            .spec()
            .columns
            .clone();
        let block_id = store.next_block_id();

        // Choose within budget first; framing is flags byte + length prefix.
        let mut chosen: Vec<SlotAddr> = Vec::new();
        let mut projected = 0usize;
        for (addr, tuple) in self.heap.iter() {
            let framed = 1 + 4 + tuple.serialized_size();
            if projected + framed > byte_budget {
                break;
            }
            projected += framed;
            chosen.push(addr);
        }

        let mut data = BytesMut::with_capacity(projected);
        for &addr in &chosen {
            // Mark before serializing so the block remembers the state.
            self.heap
                .get_mut(addr)
                .expect("chosen slot is active")
                .flags_mut()
                .set_evicted(true);
            let tuple = self.heap.get(addr).expect("active").clone();

            let surrogate_addr = self
                .evicted
                .as_mut()
                .expect("bound")
                .insert_surrogate(&tuple, &key_columns, block_id);
            self.indexes.rewrite_address_all(&tuple, addr, surrogate_addr);

            data.put_u8(tuple.flags().bits());
            data.put_u32_le(tuple.serialized_size() as u32);
            tuple.serialize(&mut data);

            self.heap.release(addr);
        }

        let tuple_count = chosen.len() as u32;
        let bytes = data.len() as u64;
        store.write_block(EvictedBlock {
            table: self.name.clone(),
            block_id,
            tuple_count,
            data: data.freeze(),
        })?;

        self.tuples_evicted += u64::from(tuple_count);
        self.blocks_evicted += 1;
        self.bytes_evicted += bytes;
        info!(
            table = %self.name,
            block_id,
            tuples = tuple_count,
            bytes,
            "evicted block"
        );
        Ok(EvictionSummary {
            block_id,
            tuples: tuple_count,
            bytes,
        })
    }

    /// Fetches an evicted block and stages its tuples in memory for
    /// [`merge_unevicted_tuples`](Self::merge_unevicted_tuples).
    pub fn read_evicted_block(
        &mut self,
        store: &mut dyn BlockStore,
        block_id: BlockId,
    ) -> Result<(), AntiCacheError> {
        let block = store.read_block(&self.name, block_id)?;
        debug!(
            table = %self.name,
            block_id,
            tuples = block.tuple_count,
            bytes = block.data.len(),
            "staged evicted block"
        );
        self.staged.extend_from_slice(&block.data);
        self.staged_blocks += 1;
        Ok(())
    }

    /// Re-integrates every staged tuple: fresh slot, evicted flag cleared,
    /// surrogate row removed, index entries rewritten back to the restored
    /// address, counters decremented. Returns the number of merged tuples.
    pub fn merge_unevicted_tuples(&mut self) -> u32 {
        let staged = std::mem::take(&mut self.staged);
        let staged_bytes = staged.len() as u64;
        let staged_blocks = std::mem::take(&mut self.staged_blocks);
        let mut buf = staged.freeze();

        let types = self.schema.types();
        let key_columns = self
            .indexes
            .primary()
            .expect("merge requires primary index")
            .spec()
            .columns
            .clone();

        let mut merged = 0u32;
        while buf.has_remaining() {
            let flag_bits = buf.get_u8();
            let len = buf.get_u32_le() as usize;
            let mut record = buf.copy_to_bytes(len);
            let tuple = Tuple::deserialize(&mut record, &types).unwrap_or_else(|e| {
                panic!("malformed staged block for table '{}': {}", self.name, e)
            });
            debug_assert!(crate::tuple::TupleFlags::from_bits(flag_bits).is_evicted());

            let key: Vec<Datum> = key_columns.iter().map(|&i| tuple.get(i).clone()).collect();
            let (surrogate_addr, _block) = self
                .evicted
                .as_ref()
                .expect("bound")
                .find(&key)
                .unwrap_or_else(|| {
                    panic!("no surrogate for staged tuple in table '{}'", self.name)
                });

            let addr = self.heap.allocate(tuple);
            if let Some(cow) = self.cow.as_mut() {
                cow.mark_dirty(&mut self.heap, addr, true);
            }
            {
                let stored = self.heap.get(addr).expect("slot just allocated");
                self.indexes.rewrite_address_all(stored, surrogate_addr, addr);
            }
            self.evicted.as_mut().expect("bound").remove(surrogate_addr);
            merged += 1;
        }

        self.tuples_evicted = self.tuples_evicted.saturating_sub(u64::from(merged));
        self.bytes_evicted = self.bytes_evicted.saturating_sub(staged_bytes);
        self.blocks_evicted = self.blocks_evicted.saturating_sub(staged_blocks);
        info!(table = %self.name, merged, "merged unevicted tuples");
        merged
    }
}
