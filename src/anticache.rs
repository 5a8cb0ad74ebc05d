//! Anti-cache: migrating cold tuples to external block storage.
//!
//! Eviction serializes a batch of cold tuples into a block, hands the block
//! to a [`BlockStore`], and replaces each tuple with a surrogate row in the
//! table's [`EvictedTable`]. Index entries are rewritten to point at the
//! surrogate's address, so a primary-key probe can still tell *that* the row
//! exists and *which* block holds it. Un-eviction fetches blocks back,
//! stages them in memory, and merges the tuples into the heap under fresh
//! addresses.
//!
//! Eviction is not transactional: it neither registers undo actions nor
//! fires view/export events.
//!
//! # Block layout
//!
//! Per tuple: `flags u8`, `len u32`, record bytes. The store prepends its
//! own framing; [`EvictedBlock`] carries the source table name, the block
//! id, the tuple count, and the serialized bytes.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;

use bytes::Bytes;

use crate::datum::{Datum, Type};
use crate::heap::{SlotAddr, TupleHeap};
use crate::schema::{Column, Schema};
use crate::tuple::Tuple;

/// External block identifier.
///
/// 32 bits: wide enough that a long-lived partition cannot wrap it the way
/// a 16-bit id would.
pub type BlockId = u32;

/// A serialized batch of evicted tuples plus its metadata.
#[derive(Debug, Clone)]
pub struct EvictedBlock {
    /// Source table name.
    pub table: String,
    /// Store-assigned block id.
    pub block_id: BlockId,
    /// Number of tuples serialized into `data`.
    pub tuple_count: u32,
    /// Per-tuple framed records.
    pub data: Bytes,
}

/// Errors from the external block store.
#[derive(Debug)]
pub enum AntiCacheError {
    /// The store has no such block.
    BlockMissing {
        /// Table the block was requested for.
        table: String,
        /// Requested block id.
        block_id: BlockId,
    },
    /// Underlying storage I/O failure.
    Io(std::io::Error),
}

impl fmt::Display for AntiCacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AntiCacheError::BlockMissing { table, block_id } => {
                write!(f, "no block {} stored for table '{}'", block_id, table)
            }
            AntiCacheError::Io(err) => write!(f, "block store I/O error: {}", err),
        }
    }
}

impl std::error::Error for AntiCacheError {}

impl From<std::io::Error> for AntiCacheError {
    fn from(err: std::io::Error) -> Self {
        AntiCacheError::Io(err)
    }
}

/// External storage for evicted blocks.
pub trait BlockStore {
    /// Returns a fresh block id, unique per store.
    fn next_block_id(&mut self) -> BlockId;

    /// Persists a block.
    fn write_block(&mut self, block: EvictedBlock) -> Result<(), AntiCacheError>;

    /// Fetches a previously written block.
    fn read_block(&mut self, table: &str, block_id: BlockId) -> Result<EvictedBlock, AntiCacheError>;
}

/// In-memory block store for tests and single-process hosts.
#[derive(Default)]
pub struct MemoryBlockStore {
    next: BlockId,
    blocks: HashMap<(String, BlockId), EvictedBlock>,
}

impl MemoryBlockStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

impl BlockStore for MemoryBlockStore {
    fn next_block_id(&mut self) -> BlockId {
        self.next += 1;
        self.next
    }

    fn write_block(&mut self, block: EvictedBlock) -> Result<(), AntiCacheError> {
        self.blocks
            .insert((block.table.clone(), block.block_id), block);
        Ok(())
    }

    fn read_block(&mut self, table: &str, block_id: BlockId) -> Result<EvictedBlock, AntiCacheError> {
        self.blocks
            .get(&(table.to_string(), block_id))
            .cloned()
            .ok_or_else(|| AntiCacheError::BlockMissing {
                table: table.to_string(),
                block_id,
            })
    }
}

/// File-backed block store: one file per block under a directory.
pub struct FileBlockStore {
    dir: PathBuf,
    next: BlockId,
}

impl FileBlockStore {
    /// Opens a store rooted at the directory, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, AntiCacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, next: 0 })
    }

    fn block_path(&self, table: &str, block_id: BlockId) -> PathBuf {
        self.dir.join(format!("{}-{}.blk", table, block_id))
    }
}

impl BlockStore for FileBlockStore {
    fn next_block_id(&mut self) -> BlockId {
        self.next += 1;
        self.next
    }

    fn write_block(&mut self, block: EvictedBlock) -> Result<(), AntiCacheError> {
        let path = self.block_path(&block.table, block.block_id);
        let mut file = fs::File::create(path)?;
        file.write_all(&block.tuple_count.to_le_bytes())?;
        file.write_all(&block.data)?;
        file.sync_all()?;
        Ok(())
    }

    fn read_block(&mut self, table: &str, block_id: BlockId) -> Result<EvictedBlock, AntiCacheError> {
        let path = self.block_path(table, block_id);
        let mut file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(AntiCacheError::BlockMissing {
                    table: table.to_string(),
                    block_id,
                });
            }
            Err(err) => return Err(err.into()),
        };
        let mut header = [0u8; 4];
        file.read_exact(&mut header)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(EvictedBlock {
            table: table.to_string(),
            block_id,
            tuple_count: u32::from_le_bytes(header),
            data: Bytes::from(data),
        })
    }
}

/// Surrogate table: one row per evicted tuple, carrying the primary-key
/// columns plus the block id holding the real bytes.
pub struct EvictedTable {
    schema: Schema,
    key_width: usize,
    heap: TupleHeap,
}

impl EvictedTable {
    /// Derives the surrogate schema from the parent table: the primary-key
    /// columns in key order, then a `block_id BIGINT` column.
    pub fn new(parent: &Schema, key_columns: &[usize]) -> Self {
        let mut columns: Vec<Column> = key_columns
            .iter()
            .map(|&i| parent.column(i).clone())
            .collect();
        columns.push(Column::not_null("block_id", Type::Int64));
        Self {
            schema: Schema::new(columns),
            key_width: key_columns.len(),
            heap: TupleHeap::surrogate_namespace(),
        }
    }

    /// Returns the surrogate schema.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Returns the number of surrogate rows.
    pub fn active_count(&self) -> usize {
        self.heap.active_count()
    }

    /// Builds and stores the surrogate row for an evicted tuple; returns its
    /// (surrogate-namespaced) address.
    pub(crate) fn insert_surrogate(
        &mut self,
        evicted: &Tuple,
        key_columns: &[usize],
        block_id: BlockId,
    ) -> SlotAddr {
        let mut values: Vec<Datum> = key_columns
            .iter()
            .map(|&i| evicted.get(i).clone())
            .collect();
        values.push(Datum::Int64(i64::from(block_id)));
        let mut surrogate = Tuple::new(values);
        surrogate.flags_mut().set_evicted(true);
        self.heap.allocate(surrogate)
    }

    /// Finds the surrogate row whose key columns equal `key`, returning its
    /// address and block id.
    pub(crate) fn find(&self, key: &[Datum]) -> Option<(SlotAddr, BlockId)> {
        self.heap.iter().find_map(|(addr, tuple)| {
            if &tuple.values()[..self.key_width] == key {
                match tuple.get(self.key_width) {
                    Datum::Int64(block) => Some((addr, *block as BlockId)),
                    _ => None,
                }
            } else {
                None
            }
        })
    }

    /// Removes a surrogate row.
    pub(crate) fn remove(&mut self, addr: SlotAddr) {
        self.heap.release(addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(table: &str, id: BlockId) -> EvictedBlock {
        EvictedBlock {
            table: table.to_string(),
            block_id: id,
            tuple_count: 2,
            data: Bytes::from_static(b"\x01\x02\x03"),
        }
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let mut store = MemoryBlockStore::new();
        let id = store.next_block_id();
        store.write_block(block("t", id)).unwrap();
        assert_eq!(store.block_count(), 1);

        let read = store.read_block("t", id).unwrap();
        assert_eq!(read.tuple_count, 2);
        assert_eq!(&read.data[..], b"\x01\x02\x03");

        assert!(matches!(
            store.read_block("t", 999),
            Err(AntiCacheError::BlockMissing { .. })
        ));
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileBlockStore::open(dir.path()).unwrap();
        let id = store.next_block_id();
        store.write_block(block("orders", id)).unwrap();

        let read = store.read_block("orders", id).unwrap();
        assert_eq!(read.tuple_count, 2);
        assert_eq!(&read.data[..], b"\x01\x02\x03");

        assert!(matches!(
            store.read_block("orders", id + 1),
            Err(AntiCacheError::BlockMissing { .. })
        ));
    }

    #[test]
    fn test_evicted_table_surrogates() {
        let parent = Schema::new(vec![
            Column::not_null("id", Type::Int64),
            Column::nullable("payload", Type::Text),
        ]);
        let mut evicted = EvictedTable::new(&parent, &[0]);
        assert_eq!(evicted.schema().column_count(), 2);
        assert_eq!(evicted.schema().column(1).name, "block_id");

        let tuple = Tuple::new(vec![Datum::Int64(42), Datum::text("cold")]);
        let addr = evicted.insert_surrogate(&tuple, &[0], 7);
        assert!(addr.is_surrogate());
        assert_eq!(evicted.active_count(), 1);

        let (found, block_id) = evicted.find(&[Datum::Int64(42)]).unwrap();
        assert_eq!(found, addr);
        assert_eq!(block_id, 7);
        assert!(evicted.find(&[Datum::Int64(1)]).is_none());

        evicted.remove(addr);
        assert_eq!(evicted.active_count(), 0);
    }
}
