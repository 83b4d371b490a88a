//! trimdb: an embeddable log-structured merge key-value engine.
//!
//! ```no_run
//! # async fn demo() -> trimdb::Result<()> {
//! let store = trimdb::LsmStore::open("/tmp/trimdb-demo").await?;
//! store.set(b"key", b"value").await?;
//! assert_eq!(store.get(b"key")?, Some(b"value".to_vec()));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod flock;
pub mod hasher;
pub mod store;

#[cfg(test)]
mod tmpfs;

pub use config::{CacheKind, CompactionConfig, Durability, LsmConfig};
pub use error::{Error, Result};
pub use store::lsm::LsmStore;
pub use store::{Store, WriteBatch};
