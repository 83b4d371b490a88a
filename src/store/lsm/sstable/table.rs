//! Read side of one immutable table file.
//!
//! Pages are served by the block cache, so a lookup costs a few page-sized
//! memory reads: a binary search over the pages' first keys, then a binary
//! search over the slots of the one page that can hold the key.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::metadata::TableMetadata;
use super::page::PageView;
use super::{FileIdentifier, SearchResult};
use crate::error::Result;
use crate::store::lsm::cache::BlockCache;

/// A key and its value, `None` standing for a tombstone.
pub type TableEntry = (Vec<u8>, Option<Vec<u8>>);

pub struct TableFile {
    id: FileIdentifier,
    path: PathBuf,
    size: u64,
    metadata: TableMetadata,
    cache: Arc<dyn BlockCache>,
}

impl fmt::Debug for TableFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableFile")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl TableFile {
    /// Loads the metadata of `id` from `dir` and registers its pages with
    /// `cache`.
    pub async fn open(id: FileIdentifier, dir: &Path, cache: Arc<dyn BlockCache>) -> Result<Self> {
        let path = id.path_in(dir);
        let metadata = TableMetadata::load_from_file(&path).await?;
        let size = tokio::fs::metadata(&path).await?.len();
        cache.register_file(id, &path, metadata.block_count())?;

        Ok(Self {
            id,
            path,
            size,
            metadata,
            cache,
        })
    }

    pub fn id(&self) -> FileIdentifier {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn metadata(&self) -> &TableMetadata {
        &self.metadata
    }

    pub fn first_key(&self) -> &[u8] {
        self.metadata.first_key()
    }

    pub fn last_key(&self) -> &[u8] {
        self.metadata.last_key()
    }

    pub fn block_count(&self) -> usize {
        self.metadata.block_count()
    }

    /// True if the key ranges of `self` and `[first, last]` intersect.
    pub fn overlaps(&self, first: &[u8], last: &[u8]) -> bool {
        self.first_key() <= last && first <= self.last_key()
    }

    /// Point lookup. Keys outside `[first_key, last_key]` or rejected by the
    /// filter are answered without reading a page.
    pub fn get(&self, key: &[u8], key_hash: u64) -> Result<SearchResult> {
        if !self.metadata.may_contain(key, key_hash) {
            return Ok(SearchResult::NotFound);
        }

        // First page whose first key sorts after `key`.
        let (mut low, mut high) = (0, self.block_count());
        while low < high {
            let mid = low + (high - low) / 2;
            let lease = self.cache.get_block(self.id, mid)?;
            let page = PageView::new(&lease)?;
            match page.first_key()? {
                Some(first) if first > key => high = mid,
                _ => low = mid + 1,
            }
        }
        if low == 0 {
            return Ok(SearchResult::NotFound);
        }

        let lease = self.cache.get_block(self.id, low - 1)?;
        PageView::new(&lease)?.get(key)
    }

    /// All entries in key order, tombstones included.
    pub fn iter(self: &Arc<Self>) -> TableIterator {
        TableIterator {
            table: Arc::clone(self),
            next_block: 0,
            buffered: VecDeque::new(),
        }
    }
}

/// Walks a table page by page. Each page is copied out of its lease before
/// any entry is yielded, so no lease is held between calls to `next`.
pub struct TableIterator {
    table: Arc<TableFile>,
    next_block: usize,
    buffered: VecDeque<TableEntry>,
}

impl TableIterator {
    fn fill(&mut self) -> Result<()> {
        while self.buffered.is_empty() && self.next_block < self.table.block_count() {
            let lease = self.table.cache.get_block(self.table.id, self.next_block)?;
            let page = PageView::new(&lease)?;
            for i in 0..page.len() {
                let entry = page.entry(i)?;
                self.buffered
                    .push_back((entry.key.to_vec(), entry.value.map(|v| v.to_vec())));
            }
            self.next_block += 1;
        }
        Ok(())
    }
}

impl Iterator for TableIterator {
    type Item = Result<TableEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(err) = self.fill() {
            // Stop after reporting the failure once.
            self.next_block = self.table.block_count();
            return Some(Err(err));
        }
        self.buffered.pop_front().map(Ok)
    }
}
