//! Memory-mapped page cache for table files.
//!
//! Every registered table is mapped once. Readers borrow fixed-size pages
//! through a [`PageLease`]; each lease holds one count on its file's
//! reference counter and gives it back exactly once when dropped.
//!
//! Two variants share that lending contract:
//!
//! - [`ProtectedCache`] bounds-checks block indexes, refuses pages of a file
//!   being removed, and makes `remove_file` wait until every outstanding lease
//!   is returned.
//! - [`MappedCache`] only guards against reading past the mapping.

mod mapped;
mod protected;

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use memmap2::Mmap;

pub use mapped::MappedCache;
pub use protected::ProtectedCache;

use crate::config::CacheKind;
use crate::error::Result;
use crate::store::lsm::sstable::format::PAGE_SIZE;
use crate::store::lsm::sstable::FileIdentifier;
use crate::Error;

/// Serves table pages to readers.
pub trait BlockCache: Send + Sync {
    /// Maps the file at `path` and makes its first `block_count` pages
    /// available under `id`.
    fn register_file(&self, id: FileIdentifier, path: &Path, block_count: usize) -> Result<()>;

    /// Forgets `id`. The mapping is released once no lease refers to it.
    fn remove_file(&self, id: FileIdentifier) -> Result<()>;

    /// Lends page `block` of file `id`. Never blocks.
    fn get_block(&self, id: FileIdentifier, block: usize) -> Result<PageLease>;

    fn file_count(&self) -> usize;
}

pub fn new_block_cache(kind: CacheKind) -> Arc<dyn BlockCache> {
    match kind {
        CacheKind::Protected => Arc::new(ProtectedCache::new()),
        CacheKind::Mapped => Arc::new(MappedCache::new()),
    }
}

/// One mapped table file plus its lease accounting.
pub(crate) struct CacheFile {
    id: FileIdentifier,
    mmap: Mmap,
    block_count: usize,
    refs: AtomicUsize,
    disposed: AtomicBool,
}

impl CacheFile {
    fn open(id: FileIdentifier, path: &Path, block_count: usize) -> Result<Self> {
        let file = File::open(path)?;
        // SAFETY: table files are immutable once renamed into place and are
        // only deleted after the cache has dropped every mapping of them.
        let mmap = unsafe { Mmap::map(&file)? };

        let needed = block_count.saturating_mul(PAGE_SIZE);
        if mmap.len() < needed {
            return Err(Error::Format(format!(
                "{} maps {} bytes but declares {} pages",
                id,
                mmap.len(),
                block_count
            )));
        }

        Ok(Self {
            id,
            mmap,
            block_count,
            refs: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
        })
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Hands out a lease for `block`. The caller has already taken a count.
    fn lease(self: &Arc<Self>, block: usize) -> PageLease {
        PageLease {
            file: Arc::clone(self),
            start: block * PAGE_SIZE,
        }
    }

    fn release(&self) {
        self.refs.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A borrowed `PAGE_SIZE` view into a mapped table file.
pub struct PageLease {
    file: Arc<CacheFile>,
    start: usize,
}

impl PageLease {
    pub fn file_id(&self) -> FileIdentifier {
        self.file.id
    }

    pub fn block(&self) -> usize {
        self.start / PAGE_SIZE
    }
}

impl Deref for PageLease {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.file.mmap[self.start..self.start + PAGE_SIZE]
    }
}

impl Drop for PageLease {
    fn drop(&mut self) {
        self.file.release();
    }
}

impl fmt::Debug for PageLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageLease")
            .field("file", &self.file.id)
            .field("block", &self.block())
            .finish()
    }
}

/// File registry shared by both cache variants.
#[derive(Default)]
pub(crate) struct Registry {
    files: RwLock<HashMap<FileIdentifier, Arc<CacheFile>>>,
}

impl Registry {
    fn insert(&self, id: FileIdentifier, path: &Path, block_count: usize) -> Result<()> {
        let file = Arc::new(CacheFile::open(id, path, block_count)?);
        let mut files = self.files.write()?;
        if files.contains_key(&id) {
            return Err(Error::InvalidState(format!("{} is already registered", id)));
        }
        files.insert(id, file);
        Ok(())
    }

    fn lookup(&self, id: FileIdentifier) -> Result<Arc<CacheFile>> {
        self.files
            .read()?
            .get(&id)
            .cloned()
            .ok_or(Error::FileNotFound(id))
    }

    fn remove(&self, id: FileIdentifier) -> Result<Option<Arc<CacheFile>>> {
        Ok(self.files.write()?.remove(&id))
    }

    fn len(&self) -> usize {
        self.files.read().map(|files| files.len()).unwrap_or(0)
    }
}


#[cfg(test)]
mod tests {
    use super::test_util::write_pattern_file;
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_lease_views_one_page() {
        let dir = TempDir::new().unwrap();
        let path = write_pattern_file(dir.path(), "Level0_1.trim", 3);
        let id = FileIdentifier::new(0, 1);

        for kind in [CacheKind::Protected, CacheKind::Mapped] {
            let cache = new_block_cache(kind);
            cache.register_file(id, &path, 3).unwrap();

            let lease = cache.get_block(id, 2).unwrap();
            assert_eq!(lease.len(), PAGE_SIZE);
            assert!(lease.iter().all(|b| *b == 2));
            assert_eq!(lease.block(), 2);
            assert_eq!(lease.file_id(), id);
        }
    }

    #[test]
    fn test_lease_drop_releases_exactly_once() {
        let dir = TempDir::new().unwrap();
        let path = write_pattern_file(dir.path(), "Level0_1.trim", 2);
        let id = FileIdentifier::new(0, 1);
        let registry = Registry::default();
        registry.insert(id, &path, 2).unwrap();

        let file = registry.lookup(id).unwrap();
        file.refs.fetch_add(2, Ordering::AcqRel);
        let first = file.lease(0);
        let second = file.lease(1);
        assert_eq!(file.outstanding(), 2);

        drop(first);
        assert_eq!(file.outstanding(), 1);
        drop(second);
        assert_eq!(file.outstanding(), 0);
    }

    #[test]
    fn test_short_file_rejected_at_registration() {
        let dir = TempDir::new().unwrap();
        let path = write_pattern_file(dir.path(), "Level0_1.trim", 1);
        let cache = new_block_cache(CacheKind::Protected);

        let result = cache.register_file(FileIdentifier::new(0, 1), &path, 2);
        assert!(matches!(result, Err(Error::Format(_))));
        assert_eq!(cache.file_count(), 0);
    }

    #[test]
    fn test_double_registration_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_pattern_file(dir.path(), "Level0_1.trim", 1);
        let id = FileIdentifier::new(0, 1);
        let cache = new_block_cache(CacheKind::Mapped);

        cache.register_file(id, &path, 1).unwrap();
        assert!(matches!(
            cache.register_file(id, &path, 1),
            Err(Error::InvalidState(_))
        ));
    }
}
