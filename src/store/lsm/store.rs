use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use super::super::{Store, WriteBatch};
use super::metrics::{self, EngineMetrics};
use super::sstable::page::PageBuilder;
use super::sstable::SearchResult;
use super::state::LsmState;
use super::wal::{self, PutOperation};
use super::{compaction, flush, recovery};
use crate::config::LsmConfig;
use crate::error::Result;
use crate::flock::DirLock;
use crate::Error;

/// An open database directory.
///
/// Writes go to the log, then the active memtable. Crossing
/// `max_memtable_size` freezes and flushes the memtable on the writing
/// task, followed by compaction of any level that went over its limit.
pub struct LsmStore {
    pub(crate) config: LsmConfig,
    pub(crate) state: Arc<LsmState>,
    /// Shared with in-flight write tasks so the directory stays locked
    /// until the last of them has finished.
    lock: Arc<DirLock>,
}

impl std::fmt::Debug for LsmStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LsmStore")
            .field("dir", &self.config.dir)
            .finish()
    }
}

impl LsmStore {
    /// Open store with default configuration
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_config(LsmConfig::new(dir)).await
    }

    /// Open store with custom configuration
    pub async fn open_with_config(config: LsmConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.dir).await?;
        let lock = DirLock::acquire(&config.dir)?;
        let state = Arc::new(recovery::recover_state(&config).await?);

        Ok(Self {
            config,
            state,
            lock: Arc::new(lock),
        })
    }

    pub fn config(&self) -> &LsmConfig {
        &self.config
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.state.lookup(key)? {
            SearchResult::Found(value) => Ok(Some(value)),
            SearchResult::Deleted | SearchResult::NotFound => Ok(None),
        }
    }

    pub async fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(PutOperation::put(key, value)).await
    }

    pub async fn remove(&self, key: &[u8]) -> Result<()> {
        self.write(PutOperation::delete(key)).await
    }

    /// Logs `op` and applies it to the active memtable.
    ///
    /// Once the returned future has been polled, the write completes even
    /// if the future is dropped; only the maintenance that follows it is
    /// skipped.
    async fn write(&self, op: PutOperation) -> Result<()> {
        validate(&op)?;
        self.run_write(|state| async move {
            let _gate = state.write_gate.read().await;
            let offset = state.log.log_entry(&op.key, &op.value, op.deleted).await?;
            state.memtables.load().active.apply_operation(&op, offset);
            Ok(())
        })
        .await?;
        self.maintain().await
    }

    /// Queues every operation before waiting on any, so the log writer can
    /// group them into few flushes. Carries on after the future is dropped,
    /// like a single write.
    pub async fn write_batch(&self, ops: Vec<PutOperation>) -> Result<()> {
        for op in &ops {
            validate(op)?;
        }

        self.run_write(|state| async move {
            let _gate = state.write_gate.read().await;
            let mut pending = Vec::with_capacity(ops.len());
            let mut failure = None;
            for op in ops {
                match state.log.submit(op.clone()) {
                    Ok(completion) => pending.push((op, completion)),
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }

            // Whatever was queued reaches the log, so it must reach the
            // memtable too.
            let active = Arc::clone(&state.memtables.load().active);
            for (op, completion) in pending {
                match wal::wait(completion).await {
                    Ok(offset) => {
                        active.apply_operation(&op, offset);
                    }
                    Err(err) => {
                        failure.get_or_insert(err);
                    }
                }
            }
            match failure {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
        .await?;
        self.maintain().await
    }

    /// Runs the log append and memtable apply of a write on its own task.
    /// A record that reaches the log must reach the memtable before the next
    /// freeze, or a later flush would commit past it.
    async fn run_write<F, Fut>(&self, write: F) -> Result<()>
    where
        F: FnOnce(Arc<LsmState>) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let task = write(Arc::clone(&self.state));
        let lock = Arc::clone(&self.lock);
        tokio::spawn(async move {
            let result = task.await;
            drop(lock);
            result
        })
        .await
        .map_err(|e| Error::InvalidState(format!("write task failed: {}", e)))?
    }

    /// Flushes an over-full memtable and compacts over-full levels, unless
    /// another task is already doing so.
    async fn maintain(&self) -> Result<()> {
        if flush::maybe_flush(&self.state, self.config.max_memtable_size).await? {
            compaction::maybe_compact(&self.state, &self.config.compaction).await?;
        }
        Ok(())
    }

    /// Freezes the active memtable and writes it to level 0.
    pub async fn flush(&self) -> Result<bool> {
        flush::flush(&self.state).await
    }

    /// Check if compaction is needed
    pub fn needs_compaction(&self) -> bool {
        compaction::needs_compaction(&self.state)
    }

    /// Compacts until every level is within its limit. Returns the number
    /// of merges run.
    pub async fn compact(&self) -> Result<usize> {
        compaction::compact(&self.state, &self.config.compaction).await
    }

    /// Collect and log metrics
    pub fn collect_metrics(&self) -> Result<EngineMetrics> {
        metrics::collect_metrics(&self.state)
    }
}

fn validate(op: &PutOperation) -> Result<()> {
    let value = (!op.deleted).then_some(op.value.as_slice());
    if !PageBuilder::entry_fits_alone(&op.key, value) {
        return Err(Error::InvalidInput(format!(
            "entry of {} key bytes and {} value bytes does not fit in a table page",
            op.key.len(),
            op.value.len()
        )));
    }
    Ok(())
}

impl Store for LsmStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        LsmStore::get(self, key)
    }

    async fn set(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.write(PutOperation::put(key, value)).await
    }

    async fn remove(&self, key: &[u8]) -> Result<()> {
        LsmStore::remove(self, key).await
    }

    async fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        LsmStore::write_batch(self, batch.into_operations()).await
    }

    async fn flush(&self) -> Result<()> {
        LsmStore::flush(self).await.map(|_| ())
    }

    async fn compact(&self) -> Result<()> {
        LsmStore::compact(self).await.map(|_| ())
    }

    fn metrics(&self) -> Result<EngineMetrics> {
        self.collect_metrics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheKind, CompactionConfig, Durability};
    use crate::tmpfs::TempDir;

    fn small_config(dir: &TempDir) -> LsmConfig {
        LsmConfig::new(dir.path())
            .max_memtable_size(2 * 1024)
            .compaction(
                CompactionConfig::default()
                    .level0_max_files(2)
                    .level1_max_files(2)
                    .level_multiplier(2)
                    .max_levels(3)
                    .target_table_pages(2),
            )
    }

    #[tokio::test]
    async fn test_set_get_remove() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = LsmStore::open(dir.path()).await?;

        store.set(b"k1", b"v1").await?;
        store.set(b"k2", b"v2").await?;
        store.set(b"k1", b"v1b").await?;
        store.remove(b"k2").await?;

        assert_eq!(store.get(b"k1")?, Some(b"v1b".to_vec()));
        assert_eq!(store.get(b"k2")?, None);
        assert_eq!(store.get(b"missing")?, None);
        assert!(store.contains(b"k1")?);
        assert!(!store.contains(b"k2")?);
        Ok(())
    }

    #[tokio::test]
    async fn test_oversized_entry_rejected() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = LsmStore::open(dir.path()).await?;

        let value = vec![7u8; 8 * 1024];
        let result = store.set(b"big", &value).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert_eq!(store.get(b"big")?, None);
        assert_eq!(store.state.log.length(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_tombstone_shadows_older_levels() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = LsmStore::open_with_config(small_config(&dir)).await?;

        store.set(b"shadowed", b"old").await?;
        store.flush().await?;
        for _ in 0..3 {
            store.set(b"filler", b"x").await?;
            store.flush().await?;
        }
        store.compact().await?;
        assert_eq!(store.state.layer(0).map(|l| l.number_of_tables()), Some(0));
        assert_eq!(store.get(b"shadowed")?, Some(b"old".to_vec()));

        // In the memtable, then in level 0, the tombstone must win.
        store.remove(b"shadowed").await?;
        assert_eq!(store.get(b"shadowed")?, None);
        store.flush().await?;
        assert_eq!(store.get(b"shadowed")?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_writes_trigger_flush_and_compaction() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = LsmStore::open_with_config(small_config(&dir)).await?;

        for round in 0..5 {
            for i in 0..200 {
                let key = format!("key_{:04}", i);
                let value = format!("value_{}_{}", round, i);
                store.set(key.as_bytes(), value.as_bytes()).await?;
            }
        }

        let metrics = store.collect_metrics()?;
        assert!(metrics.total_tables() > 0);
        assert!(metrics.level_tables[0] <= 2);
        for i in 0..200 {
            let key = format!("key_{:04}", i);
            let expected = format!("value_4_{}", i);
            assert_eq!(store.get(key.as_bytes())?, Some(expected.into_bytes()), "key {}", key);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_reopen_recovers_unflushed_writes() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        {
            let store = LsmStore::open(dir.path()).await?;
            store.set(b"durable", b"1").await?;
            store.flush().await?;
            store.set(b"in_log", b"2").await?;
            store.remove(b"durable").await?;
        }

        let store = LsmStore::open(dir.path()).await?;
        assert_eq!(store.get(b"in_log")?, Some(b"2".to_vec()));
        assert_eq!(store.get(b"durable")?, None);

        store.flush().await?;
        drop(store);
        let store = LsmStore::open(dir.path()).await?;
        assert_eq!(store.get(b"in_log")?, Some(b"2".to_vec()));
        assert_eq!(store.get(b"durable")?, None);
        assert_eq!(store.state.log.length(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_dropped_write_is_still_applied() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        {
            let store = LsmStore::open(dir.path()).await?;
            {
                // Polled once, then dropped while the record is in flight.
                let write = store.set(b"dropped", b"1");
                tokio::pin!(write);
                let finished = tokio::select! {
                    biased;
                    _ = &mut write => true,
                    _ = std::future::ready(()) => false,
                };
                assert!(!finished);
            }

            store.set(b"later", b"2").await?;
            store.flush().await?;
            assert_eq!(store.get(b"dropped")?, Some(b"1".to_vec()));
            assert_eq!(store.state.log.length(), 0);
        }

        let store = LsmStore::open(dir.path()).await?;
        assert_eq!(store.get(b"dropped")?, Some(b"1".to_vec()));
        assert_eq!(store.get(b"later")?, Some(b"2".to_vec()));
        Ok(())
    }

    #[tokio::test]
    async fn test_log_stays_bounded_while_open() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = LsmStore::open_with_config(LsmConfig::new(dir.path()).max_memtable_size(1024)).await?;

        let mut longest = 0;
        for i in 0..500 {
            let key = format!("key_{:04}", i);
            store.set(key.as_bytes(), b"some value bytes").await?;
            longest = longest.max(store.state.log.length());
        }
        store.flush().await?;

        assert_eq!(store.state.log.length(), 0);
        assert!(longest < 4 * 1024, "log grew to {} bytes", longest);
        assert_eq!(store.get(b"key_0123")?, Some(b"some value bytes".to_vec()));
        Ok(())
    }

    #[tokio::test]
    async fn test_second_open_is_locked_out() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let _store = LsmStore::open(dir.path()).await?;

        let second = LsmStore::open(dir.path()).await;
        assert!(matches!(second, Err(Error::LockError(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_write_batch_applies_in_order() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = LsmStore::open_with_config(LsmConfig::new(dir.path()).wal_batch_size(16)).await?;

        let mut batch = WriteBatch::new();
        for i in 0..50 {
            batch.set(format!("k{:02}", i), format!("v{}", i));
        }
        batch.remove("k10").set("k20", "rewritten");
        Store::write_batch(&store, batch).await?;

        assert_eq!(store.get(b"k00")?, Some(b"v0".to_vec()));
        assert_eq!(store.get(b"k10")?, None);
        assert_eq!(store.get(b"k20")?, Some(b"rewritten".to_vec()));
        assert_eq!(store.get(b"k49")?, Some(b"v49".to_vec()));
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_writers_and_readers() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = small_config(&dir).durability(Durability::Buffered);
        let store = Arc::new(LsmStore::open_with_config(config).await?);

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    for i in 0..150 {
                        let key = format!("w{}_{:03}", w, i);
                        store.set(key.as_bytes(), key.as_bytes()).await?;
                    }
                    Ok::<(), Error>(())
                })
            })
            .collect();
        let reader = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                for _ in 0..200 {
                    // Every read must succeed while files are swapped underneath.
                    store.get(b"w0_000")?;
                    tokio::task::yield_now().await;
                }
                Ok::<(), Error>(())
            })
        };

        for writer in writers {
            writer.await.expect("writer panicked")?;
        }
        reader.await.expect("reader panicked")?;

        for w in 0..4 {
            for i in 0..150 {
                let key = format!("w{}_{:03}", w, i);
                assert_eq!(store.get(key.as_bytes())?, Some(key.clone().into_bytes()));
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_store_trait_surface() -> Result<()> {
        async fn exercise<S: Store>(store: &S) -> Result<()> {
            store.set(b"a", b"1".to_vec()).await?;
            store.set(b"b", b"2".to_vec()).await?;
            store.remove(b"a").await?;
            store.flush().await?;
            store.compact().await?;
            assert!(!store.contains(b"a")?);
            assert_eq!(store.get(b"b")?, Some(b"2".to_vec()));
            assert!(store.size()? > 0);
            assert_eq!(store.metrics()?.level_tables[0], 1);
            Ok(())
        }

        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = LsmStore::open_with_config(LsmConfig::new(dir.path()).cache(CacheKind::Mapped)).await?;
        exercise(&store).await
    }
}
