pub mod lsm;

use std::future::Future;

use crate::error::Result;
use lsm::metrics::EngineMetrics;
use lsm::wal::PutOperation;

/// Surface a key-value adapter drives the engine through. Values cross it
/// as owned buffers; no page of a table file escapes.
pub trait Store: Send + Sync {
    /// Retrieves the value for a given key.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// True if `key` holds a live value.
    fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Inserts or updates a key-value pair.
    fn set(&self, key: &[u8], value: Vec<u8>) -> impl Future<Output = Result<()>> + Send;

    /// Deletes `key`. Removing an absent key is not an error.
    fn remove(&self, key: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Logs every operation of `batch` in one group and applies them in
    /// order. The batch is not atomic across a crash.
    fn write_batch(&self, batch: WriteBatch) -> impl Future<Output = Result<()>> + Send;

    /// Writes everything held in memory to level 0.
    fn flush(&self) -> impl Future<Output = Result<()>> + Send;

    /// Compacts until every level is within its table limit.
    fn compact(&self) -> impl Future<Output = Result<()>> + Send;

    fn metrics(&self) -> Result<EngineMetrics>;

    /// Approximate bytes held in memtables and table files.
    fn size(&self) -> Result<u64> {
        Ok(self.metrics()?.total_size())
    }
}

/// Ordered group of writes submitted together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<PutOperation>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(PutOperation::put(key, value));
        self
    }

    pub fn remove(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(PutOperation::delete(key));
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn operations(&self) -> &[PutOperation] {
        &self.ops
    }

    pub fn into_operations(self) -> Vec<PutOperation> {
        self.ops
    }
}
