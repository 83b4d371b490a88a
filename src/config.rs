use std::path::PathBuf;

/// When a write-ahead log append is acknowledged to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// The record is fsynced before the caller's future resolves.
    Synced,
    /// The record is handed to the OS and acknowledged without fsync.
    Buffered,
}

/// Which block cache variant serves table pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    /// Bounds-checked cache that drains outstanding leases before unmapping.
    Protected,
    /// Baseline cache with no block-count or disposal checks.
    Mapped,
}

/// Configuration for the LSM store
#[derive(Debug, Clone)]
pub struct LsmConfig {
    /// Directory path for the database
    pub dir: PathBuf,

    /// Size at which the active memtable is frozen and flushed (default: 4MB)
    pub max_memtable_size: usize,

    /// Acknowledgement point for log appends (default: Synced)
    pub durability: Durability,

    /// Maximum records the log writer drains per flush (default: 256)
    pub wal_batch_size: usize,

    /// Block cache variant (default: Protected)
    pub cache: CacheKind,

    /// Compaction configuration
    pub compaction: CompactionConfig,
}

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Table count above which level 0 is merged down (default: 4)
    pub level0_max_files: usize,

    /// Table count above which level 1 is merged down (default: 10)
    pub level1_max_files: usize,

    /// Growth factor of the table limit for each level below 1 (default: 10)
    pub level_multiplier: usize,

    /// Number of sorted levels below level 0 (default: 5)
    pub max_levels: u32,

    /// Pages written to one compaction output before starting the next (default: 512)
    pub target_table_pages: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            level0_max_files: 4,
            level1_max_files: 10,
            level_multiplier: 10,
            max_levels: 5,
            target_table_pages: 512,
        }
    }
}

impl Default for LsmConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./trimdb"),
            max_memtable_size: 4 * 1024 * 1024, // 4MB
            durability: Durability::Synced,
            wal_batch_size: 256,
            cache: CacheKind::Protected,
            compaction: CompactionConfig::default(),
        }
    }
}

impl LsmConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set maximum memtable size
    pub fn max_memtable_size(mut self, size: usize) -> Self {
        self.max_memtable_size = size;
        self
    }

    /// Set the log acknowledgement mode
    pub fn durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    /// Set how many records the log writer groups per flush
    pub fn wal_batch_size(mut self, size: usize) -> Self {
        self.wal_batch_size = size.max(1);
        self
    }

    /// Select the block cache variant
    pub fn cache(mut self, kind: CacheKind) -> Self {
        self.cache = kind;
        self
    }

    /// Configure compaction settings
    pub fn compaction(mut self, config: CompactionConfig) -> Self {
        self.compaction = config;
        self
    }
}

impl CompactionConfig {
    /// Set the level 0 table limit
    pub fn level0_max_files(mut self, count: usize) -> Self {
        self.level0_max_files = count;
        self
    }

    /// Set the level 1 table limit
    pub fn level1_max_files(mut self, count: usize) -> Self {
        self.level1_max_files = count;
        self
    }

    /// Set the per-level growth factor
    pub fn level_multiplier(mut self, multiplier: usize) -> Self {
        self.level_multiplier = multiplier.max(1);
        self
    }

    /// Set the number of sorted levels
    pub fn max_levels(mut self, levels: u32) -> Self {
        self.max_levels = levels.max(1);
        self
    }

    /// Set the page budget of a compaction output table
    pub fn target_table_pages(mut self, pages: usize) -> Self {
        self.target_table_pages = pages.max(1);
        self
    }

    /// Soft table-count limit for a level, consumed by the compaction policy.
    pub fn max_files_at_layer(&self, level: u32) -> usize {
        match level {
            0 => self.level0_max_files,
            n => {
                let growth = self
                    .level_multiplier
                    .saturating_pow(n.saturating_sub(1));
                self.level1_max_files.saturating_mul(growth)
            }
        }
    }
}
