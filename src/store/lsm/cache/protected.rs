use std::path::Path;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use super::{BlockCache, CacheFile, PageLease, Registry};
use crate::error::Result;
use crate::store::lsm::sstable::FileIdentifier;
use crate::Error;

const SPIN_ROUNDS: u32 = 64;
const YIELD_ROUNDS: u32 = 128;
const MAX_SLEEP: Duration = Duration::from_millis(1);

/// Cache that never unmaps a region while a lease into it is alive and
/// never lends a page of a file that is being removed.
#[derive(Default)]
pub struct ProtectedCache {
    registry: Registry,
}

impl ProtectedCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockCache for ProtectedCache {
    fn register_file(&self, id: FileIdentifier, path: &Path, block_count: usize) -> Result<()> {
        self.registry.insert(id, path, block_count)
    }

    /// Marks the file disposed, waits for its leases to come back, then
    /// drops it from the registry. Only the first caller waits; concurrent
    /// callers return as soon as they see the flag already set.
    fn remove_file(&self, id: FileIdentifier) -> Result<()> {
        let file = self.registry.lookup(id)?;
        if file.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        drain(&file);
        self.registry.remove(id)?;
        Ok(())
    }

    fn get_block(&self, id: FileIdentifier, block: usize) -> Result<PageLease> {
        let file = self.registry.lookup(id)?;
        if block >= file.block_count {
            return Err(Error::BlockOutOfRange {
                file: id,
                block,
                block_count: file.block_count,
            });
        }
        if file.is_disposed() {
            return Err(Error::FileDisposed(id));
        }

        file.refs.fetch_add(1, Ordering::AcqRel);
        // Disposal may have started between the check above and the increment.
        if file.is_disposed() {
            file.release();
            return Err(Error::FileDisposed(id));
        }
        Ok(file.lease(block))
    }

    fn file_count(&self) -> usize {
        self.registry.len()
    }
}

/// Spins, then yields, then sleeps with a doubling capped interval until
/// no lease of `file` is outstanding.
fn drain(file: &CacheFile) {
    let started = Instant::now();
    let mut rounds = 0u32;
    let mut sleep = Duration::from_micros(10);

    while file.outstanding() != 0 {
        if rounds < SPIN_ROUNDS {
            std::hint::spin_loop();
        } else if rounds < YIELD_ROUNDS {
            thread::yield_now();
        } else {
            thread::sleep(sleep);
            sleep = (sleep * 2).min(MAX_SLEEP);
        }
        rounds = rounds.saturating_add(1);
    }

    if rounds > 0 {
        tracing::debug!(
            file = %file.id,
            rounds,
            waited_us = started.elapsed().as_micros() as u64,
            "Waited for outstanding page leases before unmapping"
        );
    }
}
