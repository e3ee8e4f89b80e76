//! # Granite Storage Engine
//! The core of a durable, concurrent, indexed key/value store.
//! This crate is responsible for the page-level index structures (an
//! extendible hash table and a B+ tree), tuple-level lock management, and
//! the write-ahead log buffer that sit underneath a transaction layer.

/// The B+ tree index and its range iterator.
pub mod btree;
/// Per-page B+ tree algorithms over leaf and internal nodes.
pub mod btree_page;
/// The buffer pool manager.
pub mod buffer_pool;
/// The crate error taxonomy.
pub mod errors;
/// The concurrent extendible hash table.
pub mod hash_table;
/// The header page mapping index names to root page ids.
pub mod header_page;
/// Fixed-size index key buffers.
pub mod keys;
/// The tuple-level lock manager with Wait-Die avoidance.
pub mod lock_manager;
/// The page layout and the page read-write latch.
pub mod page;
/// The pager for reading and writing pages to disk.
pub mod pager;
/// The LRU victim queue used by the buffer pool.
pub mod replacer;
/// Transactions and the transaction manager.
pub mod transaction;
/// The write-ahead log manager.
pub mod wal;

/// The size of a single page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// A unique identifier for a page in the database file.
pub type PageId = i32;

/// Sentinel page id meaning "no page".
pub const INVALID_PAGE_ID: PageId = -1;

/// The page holding the index-name to root-page-id records.
pub const HEADER_PAGE_ID: PageId = 0;

/// A record identifier: the physical address of a tuple.
///
/// Ordered bytewise (page id first, then slot), which makes it usable as the
/// key of the lock table and as a B+ tree value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Rid {
    pub page_id: PageId,
    pub slot: u32,
}

impl Rid {
    pub fn new(page_id: PageId, slot: u32) -> Self {
        Self { page_id, slot }
    }
}

/// An opaque tuple payload as it appears in log records.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tuple {
    data: Vec<u8>,
}

impl Tuple {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn length(&self) -> usize {
        self.data.len()
    }

    /// Appends the on-disk form, a length prefix followed by the bytes.
    pub fn serialize_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.data.len() as i32).to_le_bytes());
        out.extend_from_slice(&self.data);
    }

    pub fn serialized_size(&self) -> usize {
        4 + self.data.len()
    }
}

pub use btree::{BPlusTree, TreeIterator, TreeOp};
pub use buffer_pool::{BufferPoolManager, Frame};
pub use errors::{EngineError, EngineResult};
pub use hash_table::ExtendibleHashTable;
pub use keys::GenericKey;
pub use lock_manager::LockManager;
pub use page::Page;
pub use pager::Pager;
pub use replacer::LruReplacer;
pub use transaction::{Transaction, TransactionManager, TransactionState};
pub use wal::{LogManager, LogPayload, LogRecord, Lsn, INVALID_LSN};
