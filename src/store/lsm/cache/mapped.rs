use std::path::Path;
use std::sync::atomic::Ordering;

use super::{BlockCache, PageLease, Registry};
use crate::error::Result;
use crate::store::lsm::sstable::format::PAGE_SIZE;
use crate::store::lsm::sstable::FileIdentifier;
use crate::Error;

/// Baseline cache: no declared-block-count check and no disposal state.
///
/// Removing a file only drops the registry's handle; a lease that is still
/// out keeps the mapping alive until it is dropped.
#[derive(Default)]
pub struct MappedCache {
    registry: Registry,
}

impl MappedCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockCache for MappedCache {
    fn register_file(&self, id: FileIdentifier, path: &Path, block_count: usize) -> Result<()> {
        self.registry.insert(id, path, block_count)
    }

    fn remove_file(&self, id: FileIdentifier) -> Result<()> {
        match self.registry.remove(id)? {
            Some(_) => Ok(()),
            None => Err(Error::FileNotFound(id)),
        }
    }

    fn get_block(&self, id: FileIdentifier, block: usize) -> Result<PageLease> {
        let file = self.registry.lookup(id)?;
        let mapped_pages = file.mmap.len() / PAGE_SIZE;
        if block >= mapped_pages {
            return Err(Error::BlockOutOfRange {
                file: id,
                block,
                block_count: mapped_pages,
            });
        }
        file.refs.fetch_add(1, Ordering::AcqRel);
        Ok(file.lease(block))
    }

    fn file_count(&self) -> usize {
        self.registry.len()
    }
}
