//! LSM-tree storage engine implementation.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐
//! │ Active Memtable │    │ Frozen Memtable │
//! │   (SkipList)    │───►│   (flushing)    │
//! └─────────────────┘    └─────────────────┘
//!          │                      │
//!          ▼                      ▼
//!   ┌─────────────┐       ┌──────────────┐
//!   │ wal.log     │       │   Level 0    │  unsorted, newest table wins
//!   │ wal.commit  │       └──────────────┘
//!   └─────────────┘              │ compaction
//!                                ▼
//!                        ┌──────────────┐
//!                        │  Level 1..N  │  sorted, disjoint ranges
//!                        └──────────────┘
//! ```
//!
//! Table pages are served from memory-mapped files through the block cache.
//!
//! # Write Path
//! 1. **Log**: the record is queued to the single log writer and the caller
//!    waits for its value offset.
//! 2. **Memtable**: the operation is applied to the active memtable, tagged
//!    with that offset.
//! 3. **Freeze and flush**: past `max_memtable_size` the memtable is frozen,
//!    written to a level-0 table, and the log commit pointer advanced.
//! 4. **Compaction**: levels over their table limit are merged downwards.
//!
//! # Read Path
//! Active memtable, frozen memtable, then level 0 newest table first, then
//! each sorted level. The first entry found for the key, value or
//! tombstone, is the answer.
//!
//! # Concurrency and Durability
//!
//! - **File Locking**: `trimdb.lock` keeps a directory to one process.
//! - **Log Durability**: with `Durability::Synced` a write returns once its
//!   record is fsynced; concurrent writers share one sync per batch.
//! - **Recovery**: records past the commit pointer are replayed at open.
//! - **Lock-free Reads**: memtables and level file sets are read through
//!   atomically swapped snapshots.

pub mod cache;
pub mod compaction;
pub mod filter;
pub mod flush;
pub mod iterator;
pub mod level;
pub mod memtable;
pub mod metrics;
pub mod recovery;
pub mod sstable;
pub mod state;
pub mod store;
pub mod wal;

#[cfg(test)]
pub(crate) mod test_util;

pub use cache::{BlockCache, PageLease};
pub use level::{SortedLayer, StorageLayer, UnsortedLayer};
pub use memtable::{MemoryTable, SkipListMemtable};
pub use metrics::EngineMetrics;
pub use sstable::{FileIdentifier, SearchResult, TableFile};
pub use state::LsmState;
pub use store::LsmStore;
pub use wal::{LogManager, PutOperation};
