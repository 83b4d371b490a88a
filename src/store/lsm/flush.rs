//! Freezing the active memtable and writing it to level 0.
//!
//! A flush runs in four steps, each visible to readers only once complete:
//!
//! 1. The active memtable becomes the frozen one and a fresh memtable takes
//!    its place. Readers consult both.
//! 2. The frozen entries are written to a new level-0 table.
//! 3. The table is published to level 0 and the frozen memtable dropped.
//! 4. The log commit pointer moves past the frozen memtable's high-watermark.
//!
//! A crash between 3 and 4 replays records that are already in a table.
//! The replayed copy lands in a newer table, so reads are unaffected.
//!
//! When both memtables end up empty the commit pointer covers the whole
//! log, and the log is reset to empty so it does not grow while the store
//! stays open.

use std::sync::Arc;

use super::memtable::{MemoryTable, SkipListMemtable};
use super::sstable::{TableFile, TableWriter};
use super::state::{LsmState, Memtables};
use crate::error::Result;
use crate::Error;

/// Waits for any running flush, then freezes and flushes whatever the
/// active memtable holds. Returns whether a table was written.
pub async fn flush(state: &LsmState) -> Result<bool> {
    let _guard = state.start_flush().await;
    flush_locked(state).await
}

/// Freezes and flushes once the active memtable reaches `max_size`. Returns
/// immediately if another flush is running.
pub async fn maybe_flush(state: &LsmState, max_size: usize) -> Result<bool> {
    if !state.needs_freeze(max_size) {
        return Ok(false);
    }
    let Some(_guard) = state.try_start_flush() else {
        return Ok(false);
    };
    // Whoever held the slot may have flushed already.
    if !state.needs_freeze(max_size) && state.memtables.load().frozen.is_none() {
        return Ok(false);
    }
    flush_locked(state).await
}

async fn flush_locked(state: &LsmState) -> Result<bool> {
    // A memtable left frozen by a failed flush goes out first.
    let mut flushed = flush_frozen(state).await?;
    if freeze_active(state).await? {
        flushed |= flush_frozen(state).await?;
    }
    if flushed {
        reset_log(state).await?;
    }
    Ok(flushed)
}

/// Empties the log if no memtable holds a record from it. Returns whether
/// the log was reset.
pub async fn reset_log(state: &LsmState) -> Result<bool> {
    let _gate = state.write_gate.write().await;

    let memtables = state.memtables.load_full();
    if memtables.frozen.is_some() || !memtables.active.is_empty() {
        return Ok(false);
    }
    state.log.reset_if_committed().await
}

/// Swaps in an empty active memtable. Returns false if there was nothing to
/// freeze or a frozen memtable is still pending.
pub async fn freeze_active(state: &LsmState) -> Result<bool> {
    let _gate = state.write_gate.write().await;

    let current = state.memtables.load_full();
    if current.frozen.is_some() || current.active.is_empty() {
        return Ok(false);
    }

    let active: Arc<dyn MemoryTable> = Arc::new(SkipListMemtable::new());
    state.memtables.store(Arc::new(Memtables {
        active,
        frozen: Some(Arc::clone(&current.active)),
    }));

    tracing::debug!(
        entries = current.active.len(),
        size = current.active.size(),
        "Froze active memtable"
    );
    Ok(true)
}

/// Writes the frozen memtable, if any, to a new level-0 table and advances
/// the log commit pointer past it.
pub async fn flush_frozen(state: &LsmState) -> Result<bool> {
    let Some(frozen) = state.memtables.load().frozen.clone() else {
        return Ok(false);
    };
    let level0 = state
        .layer(0)
        .ok_or_else(|| Error::InvalidState("store has no level 0".to_string()))?;

    let Some(watermark) = frozen.high_watermark() else {
        clear_frozen(state);
        return Ok(false);
    };

    let id = level0.next_file_name();
    let path = level0.table_path(id);
    let memtable = Arc::clone(&frozen);
    let size = tokio::task::spawn_blocking(move || -> Result<u64> {
        let mut writer = TableWriter::create(&path)?;
        for (key, value) in memtable.entries() {
            writer.add(&key, value.as_deref())?;
        }
        writer.finish()
    })
    .await
    .map_err(|e| Error::InvalidState(format!("flush task failed: {}", e)))??;

    let table = TableFile::open(id, level0.files().dir(), Arc::clone(&state.cache)).await?;
    level0.add_table_file(Arc::new(table));
    clear_frozen(state);
    state.log.record_committed(watermark)?;

    tracing::info!(
        file = %id,
        entries = frozen.len(),
        bytes = size,
        committed = watermark,
        "Flushed memtable to level 0"
    );
    Ok(true)
}

fn clear_frozen(state: &LsmState) {
    state.memtables.rcu(|current| Memtables {
        active: Arc::clone(&current.active),
        frozen: None,
    });
}
