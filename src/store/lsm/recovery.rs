use std::path::Path;
use std::sync::Arc;

use super::cache::{new_block_cache, BlockCache};
use super::level::{SortedLayer, StorageLayer, UnsortedLayer};
use super::memtable::{MemoryTable, SkipListMemtable};
use super::sstable::FileIdentifier;
use super::state::LsmState;
use super::wal::LogManager;
use crate::config::LsmConfig;
use crate::error::Result;
use crate::Error;

const TEMP_SUFFIX: &str = ".tmp";

/// Rebuild the store state from the files in `config.dir`
///
/// Tables are discovered per level, then every log record past the commit
/// pointer is replayed into a fresh active memtable in log order. The caller
/// must hold the directory lock.
pub(crate) async fn recover_state(config: &LsmConfig) -> Result<LsmState> {
    let dir = &config.dir;
    tokio::fs::create_dir_all(dir).await?;
    scan_directory(dir, config.compaction.max_levels).await?;

    let cache = new_block_cache(config.cache);
    let layers = open_layers(config, &cache).await?;

    let log = LogManager::open(config)?;
    let active = SkipListMemtable::new();
    let replayed = if log.is_fully_committed()? {
        0
    } else {
        replay(&log, &active)?
    };

    let tables: Vec<usize> = layers.iter().map(|l| l.number_of_tables()).collect();
    tracing::info!(
        dir = %dir.display(),
        ?tables,
        replayed,
        log_length = log.length(),
        "Recovered store"
    );

    Ok(LsmState::new(active, layers, cache, log))
}

/// Removes table files a crash left half-written and rejects tables of a
/// level the configuration no longer has.
async fn scan_directory(dir: &Path, max_levels: u32) -> Result<()> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };

        if let Some(table_name) = name.strip_suffix(TEMP_SUFFIX) {
            if FileIdentifier::parse(table_name).is_some() {
                tracing::warn!(file = name, "Removing unfinished table file");
                tokio::fs::remove_file(entry.path()).await?;
            }
            continue;
        }

        if let Some(id) = FileIdentifier::parse(name) {
            if id.level > max_levels {
                return Err(Error::InvalidInput(format!(
                    "table {} is on level {} but only {} levels are configured",
                    id, id.level, max_levels
                )));
            }
        }
    }
    Ok(())
}

async fn open_layers(config: &LsmConfig, cache: &Arc<dyn BlockCache>) -> Result<Vec<Arc<dyn StorageLayer>>> {
    let compaction = &config.compaction;
    let mut layers: Vec<Arc<dyn StorageLayer>> = Vec::with_capacity(compaction.max_levels as usize + 1);

    layers.push(Arc::new(
        UnsortedLayer::open(&config.dir, 0, compaction.max_files_at_layer(0), cache).await?,
    ));
    for level in 1..=compaction.max_levels {
        layers.push(Arc::new(
            SortedLayer::open(&config.dir, level, compaction.max_files_at_layer(level), cache).await?,
        ));
    }
    Ok(layers)
}

fn replay(log: &LogManager, memtable: &dyn MemoryTable) -> Result<usize> {
    let mut count = 0;
    for record in log.uncommitted_operations()? {
        let (offset, op) = record?;
        memtable.apply_operation(&op, offset);
        count += 1;
    }
    Ok(count)
}
