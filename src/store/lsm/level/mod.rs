//! The table files of one level of the tree.
//!
//! A level's file set is an immutable [`FileSet`] behind an [`ArcSwap`].
//! Readers load the current snapshot without locking and keep it for as long
//! as they need it. Mutations build a fresh set from the current one and
//! compare-and-swap it in, recomputing against the newer set whenever another
//! mutation won the race.

mod sorted;
mod unsorted;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

pub use sorted::SortedLayer;
pub use unsorted::UnsortedLayer;

use crate::error::Result;
use crate::store::lsm::cache::BlockCache;
use crate::store::lsm::sstable::{FileIdentifier, SearchResult, TableFile};

/// One published state of a level.
#[derive(Debug, Clone, Default)]
pub struct FileSet {
    tables: Vec<Arc<TableFile>>,
    /// Parallel to `tables`: each table's file index.
    file_indices: Vec<u64>,
    /// No two tables share a key, assuming `tables` is in range order.
    disjoint: bool,
}

impl FileSet {
    fn from_tables(tables: Vec<Arc<TableFile>>) -> Self {
        let file_indices = tables.iter().map(|t| t.id().file_id).collect();
        let disjoint = tables
            .windows(2)
            .all(|pair| pair[0].last_key() < pair[1].first_key());
        Self {
            tables,
            file_indices,
            disjoint,
        }
    }

    pub fn is_disjoint(&self) -> bool {
        self.disjoint
    }

    pub fn tables(&self) -> &[Arc<TableFile>] {
        &self.tables
    }

    pub fn file_indices(&self) -> &[u64] {
        &self.file_indices
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.tables.iter().map(|t| t.size()).sum()
    }

    fn push(&mut self, table: Arc<TableFile>) {
        self.file_indices.push(table.id().file_id);
        self.tables.push(table);
    }

    fn retain(&mut self, mut keep: impl FnMut(&TableFile) -> bool) {
        let mut tables = Vec::with_capacity(self.tables.len());
        for table in self.tables.drain(..) {
            if keep(&table) {
                tables.push(table);
            }
        }
        *self = Self::from_tables(tables);
    }

    fn sort_by_range(&mut self) {
        let mut tables = std::mem::take(&mut self.tables);
        tables.sort_by(|a, b| a.first_key().cmp(b.first_key()));
        *self = Self::from_tables(tables);
    }
}

/// How a level keeps its tables ordered after a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Arrangement {
    /// Oldest first, in the order tables were added.
    Arrival,
    /// Ascending by key range.
    Range,
}

/// State shared by both layer kinds.
pub struct LayerFiles {
    dir: PathBuf,
    level: u32,
    max_files: usize,
    arrangement: Arrangement,
    set: ArcSwap<FileSet>,
    next_index: AtomicU64,
}

impl LayerFiles {
    pub(crate) async fn open(
        dir: &Path,
        level: u32,
        max_files: usize,
        arrangement: Arrangement,
        cache: &Arc<dyn BlockCache>,
    ) -> Result<Self> {
        let tables = discover(dir, level, cache).await?;
        let next_index = tables.last().map_or(1, |t| t.id().file_id + 1);

        let mut set = FileSet::from_tables(tables);
        if arrangement == Arrangement::Range {
            set.sort_by_range();
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            level,
            max_files,
            arrangement,
            set: ArcSwap::from_pointee(set),
            next_index: AtomicU64::new(next_index),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot(&self) -> Arc<FileSet> {
        self.set.load_full()
    }

    fn next_file_name(&self) -> FileIdentifier {
        FileIdentifier::new(self.level, self.next_index.fetch_add(1, Ordering::SeqCst))
    }

    /// Publishes `change` applied to the current set, retrying on conflict.
    fn update(&self, change: impl Fn(&mut FileSet)) {
        self.set.rcu(|current| {
            let mut next = FileSet::clone(current);
            change(&mut next);
            if self.arrangement == Arrangement::Range {
                next.sort_by_range();
            }
            next
        });
    }
}

/// Finds, loads and registers every table of `level` in `dir`, ordered by
/// file index.
async fn discover(dir: &Path, level: u32, cache: &Arc<dyn BlockCache>) -> Result<Vec<Arc<TableFile>>> {
    let prefix = format!("Level{}", level);
    let mut ids = Vec::new();

    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        match FileIdentifier::parse(name) {
            Some(id) if id.level == level => ids.push(id),
            Some(id) if name.starts_with(&prefix) => {
                tracing::warn!(
                    level,
                    file = name,
                    found_level = id.level,
                    "Skipping table file of another level"
                );
            }
            _ => {}
        }
    }
    ids.sort();

    let mut tables = Vec::with_capacity(ids.len());
    for id in ids {
        tables.push(Arc::new(TableFile::open(id, dir, Arc::clone(cache)).await?));
    }
    Ok(tables)
}

/// One level of the tree.
pub trait StorageLayer: Send + Sync {
    fn files(&self) -> &LayerFiles;

    /// Looks `key` up in one snapshot of this level.
    fn search(&self, snapshot: &FileSet, key: &[u8], key_hash: u64) -> Result<SearchResult>;

    fn level(&self) -> u32 {
        self.files().level
    }

    fn is_sorted(&self) -> bool {
        self.files().arrangement == Arrangement::Range
    }

    /// Point lookup. A table disposed under the lookup by a concurrent
    /// compaction is retried against the newer snapshot.
    fn get(&self, key: &[u8], key_hash: u64) -> Result<SearchResult> {
        loop {
            let snapshot = self.files().snapshot();
            match self.search(&snapshot, key, key_hash) {
                Err(err) if err.is_lifetime() && !Arc::ptr_eq(&snapshot, &self.files().snapshot()) => {
                    tracing::trace!(
                        level = self.level(),
                        error = %err,
                        "File set changed under lookup, retrying"
                    );
                }
                result => return result,
            }
        }
    }

    /// Reserves the next file name of this level.
    fn next_file_name(&self) -> FileIdentifier {
        self.files().next_file_name()
    }

    fn table_path(&self, id: FileIdentifier) -> PathBuf {
        id.path_in(self.files().dir())
    }

    fn add_table_file(&self, table: Arc<TableFile>) {
        self.files().update(|set| set.push(Arc::clone(&table)));
    }

    fn remove_table(&self, id: FileIdentifier) {
        self.files().update(|set| set.retain(|t| t.id() != id));
    }

    /// Swaps `superseded` for `new_tables` in a single publish.
    fn add_and_remove_table_files(&self, new_tables: &[Arc<TableFile>], superseded: &[FileIdentifier]) {
        self.files().update(|set| {
            set.retain(|t| !superseded.contains(&t.id()));
            for table in new_tables {
                set.push(Arc::clone(table));
            }
        });
    }

    fn snapshot(&self) -> Arc<FileSet> {
        self.files().snapshot()
    }

    fn number_of_tables(&self) -> usize {
        self.files().snapshot().len()
    }

    /// Soft limit consulted by the compaction policy.
    fn max_files_at_layer(&self) -> usize {
        self.files().max_files
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheKind;
    use crate::hasher::key_hash;
    use crate::store::lsm::cache::new_block_cache;
    use crate::store::lsm::test_util::build_table;
    use crate::tmpfs::TempDir;

    #[tokio::test]
    async fn test_discovery_orders_by_index_and_skips_other_levels() {
        let dir = TempDir::new().unwrap();
        let cache = new_block_cache(CacheKind::Protected);
        for (level, index) in [(1, 12), (1, 3), (10, 1), (1, 7)] {
            let key = format!("key_{}", index);
            build_table(
                dir.path(),
                FileIdentifier::new(level, index),
                &[(key.as_str(), Some("v"))],
                &cache,
            )
            .await;
        }
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let discovery_cache = new_block_cache(CacheKind::Protected);
        let tables = discover(dir.path(), 1, &discovery_cache).await.unwrap();
        let indices: Vec<u64> = tables.iter().map(|t| t.id().file_id).collect();
        assert_eq!(indices, vec![3, 7, 12]);
        assert_eq!(discovery_cache.file_count(), 3);

        let layer = UnsortedLayer::open(dir.path(), 1, 4, &discovery_cache).await;
        assert!(layer.is_err(), "tables are already registered");

        let layer = UnsortedLayer::open(dir.path(), 1, 4, &new_block_cache(CacheKind::Mapped))
            .await
            .unwrap();
        assert_eq!(layer.next_file_name(), FileIdentifier::new(1, 13));
        assert_eq!(layer.next_file_name(), FileIdentifier::new(1, 14));
    }

    #[tokio::test]
    async fn test_corrupt_table_fails_discovery() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Level0_1.trim"), vec![0u8; 8192]).unwrap();

        let result = UnsortedLayer::open(dir.path(), 0, 4, &new_block_cache(CacheKind::Protected)).await;
        assert!(matches!(result, Err(crate::Error::Format(_))));
    }

    #[tokio::test]
    async fn test_snapshot_survives_publish() {
        let dir = TempDir::new().unwrap();
        let cache = new_block_cache(CacheKind::Protected);
        let layer = SortedLayer::open(dir.path(), 1, 10, &cache).await.unwrap();

        let a = build_table(dir.path(), layer.next_file_name(), &[("a", Some("1"))], &cache).await;
        let b = build_table(dir.path(), layer.next_file_name(), &[("b", Some("2"))], &cache).await;
        layer.add_table_file(Arc::clone(&a));
        layer.add_table_file(Arc::clone(&b));

        let before = layer.snapshot();
        let merged = build_table(
            dir.path(),
            layer.next_file_name(),
            &[("a", Some("1")), ("b", Some("2"))],
            &cache,
        )
        .await;
        layer.add_and_remove_table_files(&[Arc::clone(&merged)], &[a.id(), b.id()]);

        assert_eq!(before.len(), 2);
        assert_eq!(before.file_indices(), &[1, 2]);
        let after = layer.snapshot();
        assert_eq!(after.len(), 1);
        assert_eq!(after.file_indices(), &[3]);
        assert_eq!(
            layer.get(b"b", key_hash(b"b")).unwrap(),
            SearchResult::Found(b"2".to_vec())
        );
    }

    #[tokio::test]
    async fn test_concurrent_mutations_all_land() {
        let dir = TempDir::new().unwrap();
        let cache = new_block_cache(CacheKind::Protected);
        let layer = Arc::new(UnsortedLayer::open(dir.path(), 0, 4, &cache).await.unwrap());

        let mut tables = Vec::new();
        for i in 0..16 {
            let key = format!("k{:02}", i);
            tables.push(build_table(dir.path(), layer.next_file_name(), &[(key.as_str(), Some("v"))], &cache).await);
        }

        let handles: Vec<_> = tables
            .into_iter()
            .map(|table| {
                let layer = Arc::clone(&layer);
                std::thread::spawn(move || layer.add_table_file(table))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = layer.snapshot();
        assert_eq!(snapshot.len(), 16);
        assert_eq!(snapshot.tables().len(), snapshot.file_indices().len());
        let mut indices = snapshot.file_indices().to_vec();
        indices.sort();
        assert_eq!(indices, (1..=16).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_remove_table() {
        let dir = TempDir::new().unwrap();
        let cache = new_block_cache(CacheKind::Protected);
        let layer = UnsortedLayer::open(dir.path(), 0, 4, &cache).await.unwrap();
        let table = build_table(dir.path(), layer.next_file_name(), &[("k", Some("v"))], &cache).await;

        layer.add_table_file(Arc::clone(&table));
        assert_eq!(layer.number_of_tables(), 1);
        layer.remove_table(table.id());
        assert_eq!(layer.number_of_tables(), 0);
        assert_eq!(layer.get(b"k", key_hash(b"k")).unwrap(), SearchResult::NotFound);
    }
}
