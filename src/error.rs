use std::io;
use std::sync::PoisonError;

use crate::store::lsm::sstable::FileIdentifier;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    ReadError(&'static str, io::Error),
    /// Malformed table file: bad magic, inconsistent table of contents or
    /// a block index whose count disagrees with its section length.
    Format(String),
    BlockOutOfRange {
        file: FileIdentifier,
        block: usize,
        block_count: usize,
    },
    /// The file was removed from the block cache before or while the page
    /// was requested. Callers should consult the current layer snapshot.
    FileDisposed(FileIdentifier),
    FileNotFound(FileIdentifier),
    /// The write-ahead log failed a write or sync; no further writes are
    /// accepted until the store is reopened.
    Durability(String),
    CorruptedWal(String),
    MutexPoisoned,
    LockError(io::Error),
    InvalidInput(String),
    InvalidState(String),
}

impl Error {
    /// True when the error means a table file went away under a reader.
    pub fn is_lifetime(&self) -> bool {
        matches!(self, Error::FileDisposed(_) | Error::FileNotFound(_))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::ReadError(context, err) => write!(f, "Failed to read {}: {}", context, err),
            Error::Format(msg) => write!(f, "Invalid table format: {}", msg),
            Error::BlockOutOfRange {
                file,
                block,
                block_count,
            } => write!(
                f,
                "Block {} out of range for {} ({} blocks)",
                block, file, block_count
            ),
            Error::FileDisposed(file) => write!(f, "Table file {} has been disposed", file),
            Error::FileNotFound(file) => write!(f, "Table file {} is not registered", file),
            Error::Durability(msg) => write!(f, "Write-ahead log failure: {}", msg),
            Error::CorruptedWal(msg) => write!(f, "Corrupted WAL: {}", msg),
            Error::MutexPoisoned => write!(f, "Mutex was poisoned"),
            Error::LockError(err) => write!(f, "Lock error: {}", err),
            Error::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) | Error::ReadError(_, err) | Error::LockError(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifetime_classification() {
        let id = FileIdentifier::new(1, 7);
        assert!(Error::FileDisposed(id).is_lifetime());
        assert!(Error::FileNotFound(id).is_lifetime());
        assert!(!Error::Format("bad magic".to_string()).is_lifetime());
    }

    #[test]
    fn test_display_names_file() {
        let err = Error::BlockOutOfRange {
            file: FileIdentifier::new(2, 3),
            block: 9,
            block_count: 4,
        };
        assert_eq!(
            err.to_string(),
            "Block 9 out of range for Level2_3 (4 blocks)"
        );
    }
}
