//! Immutable sorted table files.
//!
//! A table is built in one forward pass and read backwards from its trailer:
//! the reader needs to know nothing about the file except that its final
//! `PAGE_SIZE` bytes are the footer page.
//!
//! ## File Layout
//!
//! ```text
//! +----------------------+
//! | Data Page 0          |  ← PAGE_SIZE bytes each
//! +----------------------+
//! | ...                  |
//! +----------------------+
//! | Data Page N-1        |
//! +----------------------+
//! | Filter section       |  ← opaque, owned by the membership filter
//! +----------------------+
//! | Block offsets        |  ← count:i32, count × offset:i64
//! +----------------------+
//! | Statistics           |  ← firstKeyLen:i32 firstKey lastKeyLen:i32 lastKey
//! +----------------------+
//! | padding              |
//! +----------------------+
//! | Footer page          |  ← …zero padding | TOC entries | version | tocSize | magic
//! +----------------------+
//! ```
//!
//! All integers are little-endian. Each table-of-contents entry is
//! `offset:i64, length:i32, entryType:i32`; `tocSize` counts the entries plus
//! the 12 trailing bytes, so the entries live in
//! `[pageEnd - tocSize, pageEnd - 12)`.
//!
//! ## Data Page Format
//!
//! ```text
//! +----------+---------------------+---------------------------------------+
//! |count:u16 | slot:u16 × count    | keyLen:u16 valLen:u16 key value ...   |
//! +----------+---------------------+---------------------------------------+
//! ```
//!
//! Slots hold the in-page offset of each entry, in key order. `valLen ==
//! 0xFFFF` marks a tombstone with no value bytes.

pub mod format;
pub mod metadata;
pub mod page;
pub mod table;
pub mod writer;

use std::fmt;
use std::path::{Path, PathBuf};

pub use metadata::TableMetadata;
pub use table::{TableEntry, TableFile, TableIterator};
pub use writer::TableWriter;

/// Extension of every table file in the database directory.
pub const TABLE_EXTENSION: &str = "trim";

/// Names one table file: its level and its per-level file index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileIdentifier {
    pub level: u32,
    pub file_id: u64,
}

impl FileIdentifier {
    pub fn new(level: u32, file_id: u64) -> Self {
        Self { level, file_id }
    }

    /// `Level{N}_{fileIndex}.trim`
    pub fn file_name(&self) -> String {
        format!("{}.{}", self, TABLE_EXTENSION)
    }

    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }

    /// Parses a table file name. Returns `None` for anything that is not a
    /// complete `Level{N}_{fileIndex}.trim` name.
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(TABLE_EXTENSION)?.strip_suffix('.')?;
        let rest = stem.strip_prefix("Level")?;
        let (level, file_id) = rest.split_once('_')?;
        Some(Self {
            level: level.parse().ok()?,
            file_id: file_id.parse().ok()?,
        })
    }
}

impl fmt::Display for FileIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Level{}_{}", self.level, self.file_id)
    }
}

/// Three-way answer of a point lookup against any layer of the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchResult {
    /// This source knows nothing about the key; keep looking in older data.
    NotFound,
    Found(Vec<u8>),
    /// The key was deleted here; older sources must not be consulted.
    Deleted,
}

impl SearchResult {
    /// True for `Found` and `Deleted`, which both end a read.
    pub fn is_definitive(&self) -> bool {
        !matches!(self, SearchResult::NotFound)
    }
}
