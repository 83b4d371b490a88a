use super::state::LsmState;
use crate::error::Result;

/// Point-in-time view of an open store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineMetrics {
    pub active_memtable_size: usize,
    pub active_memtable_entries: usize,
    /// Size of the memtable being flushed, if any.
    pub frozen_memtable_size: Option<usize>,
    /// Indexed by level.
    pub level_tables: Vec<usize>,
    /// Indexed by level.
    pub level_bytes: Vec<u64>,
    pub cached_files: usize,
    pub log_length: u64,
    pub committed_offset: u64,
}

impl EngineMetrics {
    pub fn total_tables(&self) -> usize {
        self.level_tables.iter().sum()
    }

    pub fn total_table_bytes(&self) -> u64 {
        self.level_bytes.iter().sum()
    }

    /// Bytes held in memory plus bytes in table files.
    pub fn total_size(&self) -> u64 {
        let memory = self.active_memtable_size + self.frozen_memtable_size.unwrap_or(0);
        memory as u64 + self.total_table_bytes()
    }
}

/// Collect metrics from LSM state and log them
pub fn collect_metrics(state: &LsmState) -> Result<EngineMetrics> {
    let (active_memtable_size, active_memtable_entries, frozen_memtable_size) = {
        let memtables = state.memtables.load();
        (
            memtables.active.size(),
            memtables.active.len(),
            memtables.frozen.as_ref().map(|m| m.size()),
        )
    };

    let (level_tables, level_bytes): (Vec<_>, Vec<_>) = state
        .layers
        .iter()
        .map(|layer| {
            let snapshot = layer.snapshot();
            (snapshot.len(), snapshot.total_size())
        })
        .unzip();

    let metrics = EngineMetrics {
        active_memtable_size,
        active_memtable_entries,
        frozen_memtable_size,
        level_tables,
        level_bytes,
        cached_files: state.cache.file_count(),
        log_length: state.log.length(),
        committed_offset: state.log.committed_offset()?,
    };

    tracing::info!(
        active_memtable_size = metrics.active_memtable_size,
        active_memtable_entries = metrics.active_memtable_entries,
        frozen_memtable_size = ?metrics.frozen_memtable_size,
        cached_files = metrics.cached_files,
        log_length = metrics.log_length,
        committed_offset = metrics.committed_offset,
        level_tables = ?metrics.level_tables,
        level_bytes = ?metrics.level_bytes,
        "LSM metrics"
    );

    Ok(metrics)
}
