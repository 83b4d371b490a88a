use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};

use super::PutOperation;
use crate::error::Result;
use crate::Error;

/// `valLen` of a logged delete.
pub(crate) const DELETED_VALUE_LEN: i32 = -1;

/// Single pass over the records in `[start, end)` of a log file.
///
/// Yields each record with its value offset. A record cut short by `end`
/// was never acknowledged and ends the iteration without an error.
pub struct ReplayIterator {
    reader: BufReader<File>,
    position: u64,
    end: u64,
    done: bool,
}

impl ReplayIterator {
    pub(crate) fn new(path: &Path, start: u64, end: u64) -> Result<Self> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(start))?;
        Ok(Self {
            reader: BufReader::new(file),
            position: start,
            end,
            done: start >= end,
        })
    }

    /// Offset just past the last complete record read so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    fn remaining(&self, from: u64) -> u64 {
        self.end.saturating_sub(from)
    }

    fn read_record(&mut self) -> Result<Option<(u64, PutOperation)>> {
        let record_start = self.position;
        if self.remaining(record_start) < 4 {
            return Ok(None);
        }
        let key_len = self
            .reader
            .read_i32::<LittleEndian>()
            .map_err(|e| Error::ReadError("log key length", e))?;
        if key_len < 0 {
            return Err(Error::CorruptedWal(format!(
                "negative key length {} at offset {}",
                key_len, record_start
            )));
        }

        let value_offset = record_start + 4 + key_len as u64;
        if self.remaining(value_offset) < 4 {
            return Ok(None);
        }
        let mut key = vec![0u8; key_len as usize];
        self.reader
            .read_exact(&mut key)
            .map_err(|e| Error::ReadError("log key", e))?;

        let value_len = self
            .reader
            .read_i32::<LittleEndian>()
            .map_err(|e| Error::ReadError("log value length", e))?;
        if value_len < DELETED_VALUE_LEN {
            return Err(Error::CorruptedWal(format!(
                "invalid value length {} at offset {}",
                value_len, value_offset
            )));
        }

        let payload = value_len.max(0) as u64;
        if self.remaining(value_offset + 4) < payload {
            return Ok(None);
        }
        let mut value = vec![0u8; payload as usize];
        self.reader
            .read_exact(&mut value)
            .map_err(|e| Error::ReadError("log value", e))?;

        self.position = value_offset + 4 + payload;
        Ok(Some((
            value_offset,
            PutOperation {
                key,
                value,
                deleted: value_len == DELETED_VALUE_LEN,
            },
        )))
    }
}

impl Iterator for ReplayIterator {
    type Item = Result<(u64, PutOperation)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::NamedTempFile;

    fn record(key: &[u8], value: Option<&[u8]>) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(key.len() as i32).to_le_bytes());
        buf.extend_from_slice(key);
        match value {
            Some(v) => {
                buf.extend_from_slice(&(v.len() as i32).to_le_bytes());
                buf.extend_from_slice(v);
            }
            None => buf.extend_from_slice(&DELETED_VALUE_LEN.to_le_bytes()),
        }
        buf
    }

    #[test]
    fn test_records_with_value_offsets() {
        let temp = NamedTempFile::new().unwrap();
        let mut log = record(b"alpha", Some(b"one"));
        log.extend(record(b"beta", None));
        std::fs::write(temp.path(), &log).unwrap();

        let records: Vec<_> = ReplayIterator::new(temp.path(), 0, log.len() as u64)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, 4 + 5);
        assert_eq!(records[0].1.key, b"alpha");
        assert_eq!(records[0].1.value, b"one");
        assert!(!records[0].1.deleted);

        assert_eq!(records[1].0, 16 + 4 + 4);
        assert!(records[1].1.deleted);
        assert!(records[1].1.value.is_empty());
    }

    #[test]
    fn test_truncated_record_is_discarded() {
        let temp = NamedTempFile::new().unwrap();
        let complete = record(b"k1", Some(b"v1"));
        let mut log = complete.clone();
        let partial = record(b"k2", Some(b"a longer value"));
        log.extend_from_slice(&partial[..partial.len() - 3]);
        std::fs::write(temp.path(), &log).unwrap();

        let mut iter = ReplayIterator::new(temp.path(), 0, log.len() as u64).unwrap();
        assert_eq!(iter.next().unwrap().unwrap().1.key, b"k1");
        assert!(iter.next().is_none());
        assert_eq!(iter.position(), complete.len() as u64);
    }

    #[test]
    fn test_negative_key_length_is_corruption() {
        let temp = NamedTempFile::new().unwrap();
        let mut log = (-5i32).to_le_bytes().to_vec();
        log.extend_from_slice(&[0u8; 16]);
        std::fs::write(temp.path(), &log).unwrap();

        let mut iter = ReplayIterator::new(temp.path(), 0, log.len() as u64).unwrap();
        assert!(matches!(iter.next(), Some(Err(Error::CorruptedWal(_)))));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_start_offset_skips_committed_records() {
        let temp = NamedTempFile::new().unwrap();
        let first = record(b"a", Some(b"1"));
        let mut log = first.clone();
        log.extend(record(b"b", Some(b"2")));
        std::fs::write(temp.path(), &log).unwrap();

        let keys: Vec<Vec<u8>> = ReplayIterator::new(temp.path(), first.len() as u64, log.len() as u64)
            .unwrap()
            .map(|r| r.unwrap().1.key)
            .collect();
        assert_eq!(keys, vec![b"b".to_vec()]);
    }
}
