//! Fixtures shared by the LSM unit tests.

use std::path::Path;
use std::sync::Arc;

use crate::store::lsm::cache::BlockCache;
use crate::store::lsm::sstable::{FileIdentifier, SearchResult, TableFile, TableWriter};
use crate::store::lsm::state::LsmState;
use crate::store::lsm::wal::PutOperation;

/// Writes `entries` (already sorted) as table `id` under `dir` and opens it.
/// A `None` value writes a tombstone.
pub async fn build_table(
    dir: &Path,
    id: FileIdentifier,
    entries: &[(&str, Option<&str>)],
    cache: &Arc<dyn BlockCache>,
) -> Arc<TableFile> {
    let mut writer = TableWriter::create(id.path_in(dir)).expect("Failed to create writer");
    for (key, value) in entries {
        writer
            .add(key.as_bytes(), value.map(str::as_bytes))
            .expect("Failed to add entry");
    }
    writer.finish().expect("Failed to finish table");
    Arc::new(
        TableFile::open(id, dir, Arc::clone(cache))
            .await
            .expect("Failed to open table"),
    )
}

/// Logs one write and applies it to the active memtable, the way the store
/// does. A `None` value writes a delete.
pub async fn apply_write(state: &LsmState, key: &str, value: Option<&str>) {
    let op = match value {
        Some(value) => PutOperation::put(key, value),
        None => PutOperation::delete(key),
    };
    let offset = state
        .log
        .log_entry(&op.key, &op.value, op.deleted)
        .await
        .expect("Failed to log write");
    state.memtables.load().active.apply_operation(&op, offset);
}

/// Reads `key` through every memtable and level.
pub fn lookup(state: &LsmState, key: &str) -> Option<String> {
    match state.lookup(key.as_bytes()).expect("Lookup failed") {
        SearchResult::Found(value) => Some(String::from_utf8(value).expect("Value is not UTF-8")),
        _ => None,
    }
}
