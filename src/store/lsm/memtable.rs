//! In-memory ordered index for recent writes.
//!
//! Writers append to the log first and apply to the memtable second, and two
//! writers can finish those steps in different orders. Each entry therefore
//! remembers the log offset of the write that produced it, and an update only
//! lands if it is newer than what the entry already holds.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_skiplist::SkipMap;

use crate::store::lsm::sstable::{SearchResult, TableEntry};
use crate::store::lsm::wal::PutOperation;

/// Capability the store needs from an in-memory index.
pub trait MemoryTable: Send + Sync {
    /// Applies a put logged at `offset`. Returns whether the entry changed.
    fn put(&self, key: &[u8], value: &[u8], offset: u64) -> bool;

    /// Applies a delete logged at `offset`. Returns whether the entry changed.
    fn delete(&self, key: &[u8], offset: u64) -> bool;

    /// Applies a logged operation whose value offset is `offset`.
    fn apply_operation(&self, op: &PutOperation, offset: u64) -> bool {
        if op.deleted {
            self.delete(&op.key, offset)
        } else {
            self.put(&op.key, &op.value, offset)
        }
    }

    fn try_get(&self, key: &[u8]) -> SearchResult;

    /// Highest log offset applied, `None` while empty.
    fn high_watermark(&self) -> Option<u64>;

    /// Approximate bytes of keys and values applied.
    fn size(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries in key order, deletes as `None`.
    fn entries(&self) -> Box<dyn Iterator<Item = TableEntry> + '_>;
}

#[derive(Debug, Clone)]
struct Versioned {
    offset: u64,
    value: Option<Vec<u8>>,
}

/// Memtable backed by a concurrent skip list.
#[derive(Debug, Default)]
pub struct SkipListMemtable {
    data: SkipMap<Vec<u8>, Versioned>,
    size: AtomicUsize,
    high_watermark: AtomicU64,
}

impl SkipListMemtable {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(&self, key: &[u8], value: Option<&[u8]>, offset: u64) -> bool {
        self.high_watermark.fetch_max(offset, Ordering::AcqRel);

        let versioned = Versioned {
            offset,
            value: value.map(|v| v.to_vec()),
        };
        let entry = self
            .data
            .compare_insert(key.to_vec(), versioned, |current| current.offset < offset);

        let changed = entry.value().offset == offset;
        if changed {
            self.size
                .fetch_add(key.len() + value.map_or(0, |v| v.len()), Ordering::Relaxed);
        }
        changed
    }
}

impl MemoryTable for SkipListMemtable {
    fn put(&self, key: &[u8], value: &[u8], offset: u64) -> bool {
        self.apply(key, Some(value), offset)
    }

    fn delete(&self, key: &[u8], offset: u64) -> bool {
        self.apply(key, None, offset)
    }

    fn try_get(&self, key: &[u8]) -> SearchResult {
        match self.data.get(key) {
            Some(entry) => match &entry.value().value {
                Some(value) => SearchResult::Found(value.clone()),
                None => SearchResult::Deleted,
            },
            None => SearchResult::NotFound,
        }
    }

    fn high_watermark(&self) -> Option<u64> {
        match self.high_watermark.load(Ordering::Acquire) {
            0 => None,
            offset => Some(offset),
        }
    }

    fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn entries(&self) -> Box<dyn Iterator<Item = TableEntry> + '_> {
        Box::new(
            self.data
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().value.clone())),
        )
    }
}
