use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::Result;
use crate::Error;

const COMMIT_RECORD_SIZE: usize = 8;

/// The durable commit pointer: one little-endian `u64` naming the log offset
/// up to which every record has reached a table file.
pub(crate) struct CommitFile {
    file: File,
    committed: u64,
}

impl CommitFile {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let committed = match file.metadata()?.len() {
            0 => 0,
            len if len == COMMIT_RECORD_SIZE as u64 => {
                let mut buf = [0u8; COMMIT_RECORD_SIZE];
                file.read_exact(&mut buf)
                    .map_err(|e| Error::ReadError("commit pointer", e))?;
                LittleEndian::read_u64(&buf)
            }
            len => {
                return Err(Error::CorruptedWal(format!(
                    "commit file is {} bytes, expected {}",
                    len, COMMIT_RECORD_SIZE
                )))
            }
        };

        Ok(Self { file, committed })
    }

    pub(crate) fn committed(&self) -> u64 {
        self.committed
    }

    /// Overwrites the pointer in place and syncs it.
    pub(crate) fn store(&mut self, offset: u64) -> Result<()> {
        let mut buf = [0u8; COMMIT_RECORD_SIZE];
        LittleEndian::write_u64(&mut buf, offset);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&buf)?;
        self.file.sync_data()?;
        self.committed = offset;
        Ok(())
    }
}
