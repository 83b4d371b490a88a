use std::path::Path;
use std::sync::Arc;

use super::{Arrangement, FileSet, LayerFiles, StorageLayer};
use crate::error::Result;
use crate::store::lsm::cache::BlockCache;
use crate::store::lsm::sstable::SearchResult;

/// Level 0: freshly flushed tables whose key ranges may overlap. Newer
/// tables shadow older ones, so lookups run from the newest table back.
pub struct UnsortedLayer {
    files: LayerFiles,
}

impl UnsortedLayer {
    pub async fn open(
        dir: &Path,
        level: u32,
        max_files: usize,
        cache: &Arc<dyn BlockCache>,
    ) -> Result<Self> {
        let files = LayerFiles::open(dir, level, max_files, Arrangement::Arrival, cache).await?;
        Ok(Self { files })
    }
}

impl StorageLayer for UnsortedLayer {
    fn files(&self) -> &LayerFiles {
        &self.files
    }

    fn search(&self, snapshot: &FileSet, key: &[u8], key_hash: u64) -> Result<SearchResult> {
        for table in snapshot.tables().iter().rev() {
            let result = table.get(key, key_hash)?;
            if result.is_definitive() {
                return Ok(result);
            }
        }
        Ok(SearchResult::NotFound)
    }
}
