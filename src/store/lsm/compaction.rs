//! Merging an over-full level into the level below it.
//!
//! # Policy
//!
//! A level compacts once it holds more tables than its configured limit.
//! The deepest level never compacts: there is nowhere to push its data.
//!
//! - **Level 0** merges all of its tables, since their ranges may overlap.
//! - **Sorted levels** merge their first table by key range.
//!
//! Every table of the target level whose range touches the merged range is
//! pulled into the merge as well, so the target stays free of overlaps.
//!
//! # Mechanics
//!
//! Sources are merged newest first: source tables before target tables,
//! and within a level the higher file index first. The newest version of a
//! key wins. Tombstones are kept unless no deeper level holds a table, in
//! which case there is nothing left for them to shadow.
//!
//! Output is cut into tables of roughly `target_table_pages` pages. The new
//! tables are published to the target level first and the sources removed
//! from their level second, so a reader walking levels top-down always sees
//! every key in at least one of them. Superseded tables are then evicted
//! from the block cache (waiting out in-flight page reads) and deleted.

use std::cmp::Reverse;
use std::fs;
use std::sync::Arc;

use super::iterator::{EntryIterator, MergeIterator};
use super::level::StorageLayer;
use super::sstable::{FileIdentifier, TableFile, TableWriter};
use super::state::LsmState;
use crate::config::CompactionConfig;
use crate::error::Result;
use crate::Error;

/// One merge of a source level into its target.
#[derive(Debug)]
pub struct CompactionTask {
    pub source_level: u32,
    /// Newest first.
    pub sources: Vec<Arc<TableFile>>,
    /// Newest first.
    pub targets: Vec<Arc<TableFile>>,
}

impl CompactionTask {
    pub fn target_level(&self) -> u32 {
        self.source_level + 1
    }
}

/// Check if any level is over its table limit
pub fn needs_compaction(state: &LsmState) -> bool {
    find_compaction_level(state).is_some()
}

/// The shallowest level holding more tables than its limit.
pub fn find_compaction_level(state: &LsmState) -> Option<u32> {
    let last = state.layers.len().checked_sub(1)?;
    state.layers[..last]
        .iter()
        .find(|layer| layer.number_of_tables() > layer.max_files_at_layer())
        .map(|layer| layer.level())
}

/// Chooses the tables to merge out of `level`.
pub fn pick_task(state: &LsmState, level: u32) -> Option<CompactionTask> {
    let source = state.layer(level)?;
    let target = state.layer(level + 1)?;

    let source_set = source.snapshot();
    let sources = if source.is_sorted() {
        let first = source_set.tables().first()?;
        overlap_closure(source_set.tables(), first.first_key(), first.last_key())
    } else {
        let mut tables = source_set.tables().to_vec();
        tables.reverse();
        tables
    };
    if sources.is_empty() {
        return None;
    }

    let first = sources.iter().map(|t| t.first_key()).min()?;
    let last = sources.iter().map(|t| t.last_key()).max()?;
    let targets = overlap_closure(target.snapshot().tables(), first, last);

    Some(CompactionTask {
        source_level: level,
        sources,
        targets,
    })
}

/// Every table of `tables` connected to `[first, last]` through overlapping
/// ranges, newest first.
fn overlap_closure(tables: &[Arc<TableFile>], first: &[u8], last: &[u8]) -> Vec<Arc<TableFile>> {
    let mut low = first.to_vec();
    let mut high = last.to_vec();
    let mut taken = vec![false; tables.len()];

    loop {
        let mut grew = false;
        for (i, table) in tables.iter().enumerate() {
            if taken[i] || !table.overlaps(&low, &high) {
                continue;
            }
            taken[i] = true;
            grew = true;
            if table.first_key() < low.as_slice() {
                low = table.first_key().to_vec();
            }
            if table.last_key() > high.as_slice() {
                high = table.last_key().to_vec();
            }
        }
        if !grew {
            break;
        }
    }

    let mut closure: Vec<Arc<TableFile>> = tables
        .iter()
        .zip(taken)
        .filter(|(_, taken)| *taken)
        .map(|(table, _)| Arc::clone(table))
        .collect();
    closure.sort_by_key(|t| Reverse(t.id().file_id));
    closure
}

/// Waits for any running compaction, then compacts until every level is
/// within its limit. Returns the number of merges run.
pub async fn compact(state: &LsmState, config: &CompactionConfig) -> Result<usize> {
    let _guard = state.start_compaction().await;
    compact_locked(state, config).await
}

/// Like [`compact`], but returns immediately if a compaction is running.
pub async fn maybe_compact(state: &LsmState, config: &CompactionConfig) -> Result<usize> {
    if !needs_compaction(state) {
        return Ok(0);
    }
    let Some(_guard) = state.try_start_compaction() else {
        return Ok(0);
    };
    compact_locked(state, config).await
}

async fn compact_locked(state: &LsmState, config: &CompactionConfig) -> Result<usize> {
    let mut rounds = 0;
    while let Some(level) = find_compaction_level(state) {
        let Some(task) = pick_task(state, level) else {
            break;
        };
        run_task(state, task, config.target_table_pages).await?;
        rounds += 1;
    }
    Ok(rounds)
}

/// Merges, publishes and retires one task.
pub async fn run_task(state: &LsmState, task: CompactionTask, target_table_pages: usize) -> Result<()> {
    let source = Arc::clone(
        state
            .layer(task.source_level)
            .ok_or_else(|| Error::InvalidState(format!("no level {}", task.source_level)))?,
    );
    let target = Arc::clone(
        state
            .layer(task.target_level())
            .ok_or_else(|| Error::InvalidState(format!("no level {}", task.target_level())))?,
    );
    let drop_tombstones = !state.has_files_below(task.target_level());

    tracing::info!(
        source_level = task.source_level,
        target_level = task.target_level(),
        sources = task.sources.len(),
        targets = task.targets.len(),
        drop_tombstones,
        "Starting compaction"
    );

    let iterators: Vec<EntryIterator<'static>> = task
        .sources
        .iter()
        .chain(task.targets.iter())
        .map(|table| Box::new(table.iter()) as EntryIterator<'static>)
        .collect();

    let written = {
        let target = Arc::clone(&target);
        let pages = target_table_pages.max(1);
        tokio::task::spawn_blocking(move || {
            write_outputs(MergeIterator::new(iterators), target.as_ref(), drop_tombstones, pages)
        })
        .await
        .map_err(|e| Error::InvalidState(format!("compaction task failed: {}", e)))??
    };

    let mut outputs = Vec::with_capacity(written.len());
    for id in &written {
        match TableFile::open(*id, target.files().dir(), Arc::clone(&state.cache)).await {
            Ok(table) => outputs.push(Arc::new(table)),
            Err(err) => {
                for table in &outputs {
                    let _ = state.cache.remove_file(table.id());
                }
                discard_files(target.as_ref(), &written);
                return Err(err);
            }
        }
    }

    let target_ids: Vec<FileIdentifier> = task.targets.iter().map(|t| t.id()).collect();
    let source_ids: Vec<FileIdentifier> = task.sources.iter().map(|t| t.id()).collect();
    target.add_and_remove_table_files(&outputs, &target_ids);
    source.add_and_remove_table_files(&[], &source_ids);

    // Target files go first: a crash in between leaves the sources on disk,
    // and they still shadow everything the outputs hold.
    retire(state, &task.targets).await?;
    retire(state, &task.sources).await?;

    tracing::info!(
        source_level = task.source_level,
        target_level = task.target_level(),
        outputs = outputs.len(),
        bytes = outputs.iter().map(|t| t.size()).sum::<u64>(),
        "Finished compaction"
    );
    Ok(())
}

/// Streams `merge` into new tables of `target`. Finished tables are removed
/// again if a later step fails.
fn write_outputs(
    merge: MergeIterator<'_>,
    target: &dyn StorageLayer,
    drop_tombstones: bool,
    pages_per_table: usize,
) -> Result<Vec<FileIdentifier>> {
    let mut written = Vec::new();
    match merge_into(merge, target, drop_tombstones, pages_per_table, &mut written) {
        Ok(()) => Ok(written),
        Err(err) => {
            discard_files(target, &written);
            Err(err)
        }
    }
}

fn merge_into(
    merge: MergeIterator<'_>,
    target: &dyn StorageLayer,
    drop_tombstones: bool,
    pages_per_table: usize,
    written: &mut Vec<FileIdentifier>,
) -> Result<()> {
    let mut current: Option<(FileIdentifier, TableWriter)> = None;

    for entry in merge {
        let (key, value) = entry?;
        if value.is_none() && drop_tombstones {
            continue;
        }

        if current.is_none() {
            let id = target.next_file_name();
            current = Some((id, TableWriter::create(target.table_path(id))?));
        }
        if let Some((_, writer)) = current.as_mut() {
            writer.add(&key, value.as_deref())?;
            if writer.page_count() > pages_per_table {
                if let Some((id, writer)) = current.take() {
                    writer.finish()?;
                    written.push(id);
                }
            }
        }
    }

    if let Some((id, writer)) = current.take() {
        writer.finish()?;
        written.push(id);
    }
    Ok(())
}

fn discard_files(layer: &dyn StorageLayer, ids: &[FileIdentifier]) {
    for id in ids {
        if let Err(err) = fs::remove_file(layer.table_path(*id)) {
            tracing::warn!(file = %id, error = %err, "Failed to remove unpublished compaction output");
        }
    }
}

/// Evicts `tables` from the cache, then deletes their files.
async fn retire(state: &LsmState, tables: &[Arc<TableFile>]) -> Result<()> {
    for table in tables {
        let cache = Arc::clone(&state.cache);
        let id = table.id();
        tokio::task::spawn_blocking(move || cache.remove_file(id))
            .await
            .map_err(|e| Error::InvalidState(format!("cache eviction failed: {}", e)))??;
        tokio::fs::remove_file(table.path()).await?;
        tracing::debug!(file = %id, "Deleted superseded table");
    }
    Ok(())
}
