use std::path::Path;
use std::sync::Arc;

use super::{Arrangement, FileSet, LayerFiles, StorageLayer};
use crate::error::Result;
use crate::store::lsm::cache::BlockCache;
use crate::store::lsm::sstable::SearchResult;

/// A level below level 0. Its tables hold disjoint key ranges and are kept
/// in ascending range order, so at most one table can hold a given key.
///
/// Tables left overlapping by a compaction that was cut short are still
/// readable: such a set is searched newest file first.
pub struct SortedLayer {
    files: LayerFiles,
}

impl SortedLayer {
    pub async fn open(
        dir: &Path,
        level: u32,
        max_files: usize,
        cache: &Arc<dyn BlockCache>,
    ) -> Result<Self> {
        let files = LayerFiles::open(dir, level, max_files, Arrangement::Range, cache).await?;
        let snapshot = files.snapshot();
        if !snapshot.is_disjoint() {
            tracing::warn!(
                level,
                tables = snapshot.len(),
                "Level holds overlapping tables, lookups fall back to newest-first order"
            );
        }
        Ok(Self { files })
    }
}

impl StorageLayer for SortedLayer {
    fn files(&self) -> &LayerFiles {
        &self.files
    }

    fn search(&self, snapshot: &FileSet, key: &[u8], key_hash: u64) -> Result<SearchResult> {
        let tables = snapshot.tables();

        if !snapshot.is_disjoint() {
            let mut candidates: Vec<_> = tables.iter().filter(|t| t.metadata().covers(key)).collect();
            candidates.sort_by_key(|t| std::cmp::Reverse(t.id().file_id));
            for table in candidates {
                let result = table.get(key, key_hash)?;
                if result.is_definitive() {
                    return Ok(result);
                }
            }
            return Ok(SearchResult::NotFound);
        }

        let index = tables.partition_point(|t| t.last_key() < key);
        match tables.get(index) {
            Some(table) if table.first_key() <= key => table.get(key, key_hash),
            _ => Ok(SearchResult::NotFound),
        }
    }
}
