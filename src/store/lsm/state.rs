use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::{Mutex, MutexGuard, RwLock};

use super::cache::BlockCache;
use super::level::StorageLayer;
use super::memtable::{MemoryTable, SkipListMemtable};
use super::sstable::SearchResult;
use super::wal::LogManager;
use crate::error::Result;
use crate::hasher::key_hash;

/// The in-memory indexes visible to readers, swapped as one unit.
pub struct Memtables {
    pub active: Arc<dyn MemoryTable>,
    /// Memtable being written to level 0, if any.
    pub frozen: Option<Arc<dyn MemoryTable>>,
}

impl Memtables {
    pub fn new(active: Arc<dyn MemoryTable>) -> Self {
        Self {
            active,
            frozen: None,
        }
    }
}

/// Held while a freeze-and-flush runs.
pub type FlushGuard<'a> = MutexGuard<'a, ()>;

/// Held while a compaction round runs.
pub type CompactionGuard<'a> = MutexGuard<'a, ()>;

/// All mutable state of an open store.
pub struct LsmState {
    pub memtables: ArcSwap<Memtables>,

    /// Indexed by level: level 0 first, then the sorted levels.
    pub layers: Vec<Arc<dyn StorageLayer>>,

    pub cache: Arc<dyn BlockCache>,
    pub log: LogManager,

    /// Writers hold it shared from log append to memtable apply, so a
    /// freeze holding it exclusively never strands an in-flight write in
    /// the memtable it just froze.
    pub write_gate: RwLock<()>,

    flush_lock: Mutex<()>,
    compaction_lock: Mutex<()>,
}

impl LsmState {
    pub fn new(
        active: SkipListMemtable,
        layers: Vec<Arc<dyn StorageLayer>>,
        cache: Arc<dyn BlockCache>,
        log: LogManager,
    ) -> Self {
        Self {
            memtables: ArcSwap::from_pointee(Memtables::new(Arc::new(active))),
            layers,
            cache,
            log,
            write_gate: RwLock::new(()),
            flush_lock: Mutex::new(()),
            compaction_lock: Mutex::new(()),
        }
    }

    pub fn layer(&self, level: u32) -> Option<&Arc<dyn StorageLayer>> {
        self.layers.get(level as usize)
    }

    /// Resolves `key` against the newest data first: the active memtable,
    /// the frozen one, then each level from 0 down. The first `Found` or
    /// `Deleted` answer is final.
    pub fn lookup(&self, key: &[u8]) -> Result<SearchResult> {
        {
            let memtables = self.memtables.load();
            let result = memtables.active.try_get(key);
            if result.is_definitive() {
                return Ok(result);
            }
            if let Some(frozen) = &memtables.frozen {
                let result = frozen.try_get(key);
                if result.is_definitive() {
                    return Ok(result);
                }
            }
        }

        let hash = key_hash(key);
        for layer in &self.layers {
            let result = layer.get(key, hash)?;
            if result.is_definitive() {
                return Ok(result);
            }
        }
        Ok(SearchResult::NotFound)
    }

    /// Check if the active memtable has outgrown `max_size`
    pub fn needs_freeze(&self, max_size: usize) -> bool {
        self.memtables.load().active.size() >= max_size
    }

    /// True if some level below `level` holds a table.
    pub fn has_files_below(&self, level: u32) -> bool {
        self.layers
            .iter()
            .skip(level as usize + 1)
            .any(|layer| layer.number_of_tables() > 0)
    }

    /// Wait for any running flush, then claim the flush slot
    pub async fn start_flush(&self) -> FlushGuard<'_> {
        self.flush_lock.lock().await
    }

    /// Claim the flush slot unless a flush is already running
    pub fn try_start_flush(&self) -> Option<FlushGuard<'_>> {
        self.flush_lock.try_lock().ok()
    }

    pub async fn start_compaction(&self) -> CompactionGuard<'_> {
        self.compaction_lock.lock().await
    }

    pub fn try_start_compaction(&self) -> Option<CompactionGuard<'_>> {
        self.compaction_lock.try_lock().ok()
    }
}
