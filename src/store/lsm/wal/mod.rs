//! Write-ahead log manager.
//!
//! Every mutation is appended to a single log file before it reaches a
//! memtable. Callers hand records to an unbounded queue; one dedicated
//! writer thread drains it in arrival order, so the log order is the order
//! in which records reached the queue.
//!
//! # File Format
//!
//! ```text
//! +-------------+------+-------------+-------+-------------+-----
//! | keyLen:i32  | key  | valLen:i32  | value | keyLen:i32  | ...
//! +-------------+------+-------------+-------+-------------+-----
//! ```
//!
//! Integers are little-endian. A delete is logged with `valLen = -1` and no
//! value bytes. The offset handed back for a record is its *value offset*,
//! the position of its `valLen` prefix.
//!
//! A separate commit file holds one `u64`: the log offset up to which every
//! record is reflected in a table file. Records past it are replayed into
//! the memtable at open.
//!
//! Once the pointer reaches the end of the log, the log can be reset to
//! empty. The pointer is zeroed before the log is truncated, so a crash in
//! between replays records that tables already hold.

mod commit;
mod replay;

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};

use byteorder::{LittleEndian, WriteBytesExt};
use tokio::sync::{mpsc, oneshot};

use crate::config::{Durability, LsmConfig};
use crate::error::Result;
use crate::Error;
use commit::CommitFile;
use replay::DELETED_VALUE_LEN;

pub use replay::ReplayIterator;

pub const LOG_FILE: &str = "wal.log";
pub const COMMIT_FILE: &str = "wal.commit";

/// One logged mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOperation {
    pub key: Vec<u8>,
    /// Empty for deletes.
    pub value: Vec<u8>,
    pub deleted: bool,
}

impl PutOperation {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            deleted: false,
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: Vec::new(),
            deleted: true,
        }
    }

    fn encoded_len(&self) -> usize {
        8 + self.key.len() + if self.deleted { 0 } else { self.value.len() }
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        buf.write_i32::<LittleEndian>(self.key.len() as i32)?;
        buf.extend_from_slice(&self.key);
        if self.deleted {
            buf.write_i32::<LittleEndian>(DELETED_VALUE_LEN)?;
        } else {
            buf.write_i32::<LittleEndian>(self.value.len() as i32)?;
            buf.extend_from_slice(&self.value);
        }
        Ok(())
    }
}

/// Resolves to the record's value offset once the writer has handled it.
pub type Completion = oneshot::Receiver<Result<u64>>;

struct Append {
    op: PutOperation,
    done: oneshot::Sender<Result<u64>>,
}

enum Request {
    Append(Append),
    /// Empties the log if every record in it is committed.
    Reset(oneshot::Sender<Result<bool>>),
}

pub struct LogManager {
    path: PathBuf,
    sender: Option<mpsc::UnboundedSender<Request>>,
    writer: Option<JoinHandle<()>>,
    reader: File,
    /// End of the last record the writer has acknowledged.
    length: Arc<AtomicU64>,
    commit: Arc<Mutex<CommitFile>>,
    failure: Arc<OnceLock<String>>,
}

impl std::fmt::Debug for LogManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogManager")
            .field("path", &self.path)
            .field("length", &self.length())
            .finish()
    }
}

impl LogManager {
    /// Opens (or creates) the log and commit files in `config.dir`, cuts off
    /// a torn trailing record, and starts the writer thread.
    pub fn open(config: &LsmConfig) -> Result<Self> {
        let path = config.dir.join(LOG_FILE);
        let mut commit = CommitFile::open(&config.dir.join(COMMIT_FILE))?;

        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        let mut length = file.metadata()?.len();
        let committed = commit.committed();

        if committed > length {
            if length != 0 {
                return Err(Error::CorruptedWal(format!(
                    "commit pointer {} is past the end of the {} byte log",
                    committed, length
                )));
            }
            // A reset truncated the log but never got to zero the pointer.
            tracing::warn!(path = %path.display(), committed, "Finishing interrupted log reset");
            commit.store(0)?;
        }
        let committed = commit.committed();

        let mut replay = ReplayIterator::new(&path, committed, length)?;
        for record in replay.by_ref() {
            record?;
        }
        if replay.position() < length {
            tracing::warn!(
                path = %path.display(),
                length,
                truncated_to = replay.position(),
                "Discarding incomplete record at the end of the log"
            );
            file.set_len(replay.position())?;
            file.sync_all()?;
            length = replay.position();
        }

        // Nothing in the log is needed once it is fully committed.
        if length > 0 && committed == length {
            commit.store(0)?;
            file.set_len(0)?;
            file.sync_all()?;
            tracing::info!(path = %path.display(), bytes = length, "Reset fully committed log");
            length = 0;
        }

        let reader = file.try_clone()?;
        let length = Arc::new(AtomicU64::new(length));
        let failure = Arc::new(OnceLock::new());
        let (sender, receiver) = mpsc::unbounded_channel();

        let commit = Arc::new(Mutex::new(commit));

        let writer = {
            let consumer = LogWriter {
                out: BufWriter::new(file),
                offset: length.load(Ordering::Acquire),
                length: Arc::clone(&length),
                commit: Arc::clone(&commit),
                failure: Arc::clone(&failure),
                durability: config.durability,
                batch_size: config.wal_batch_size.max(1),
            };
            thread::Builder::new()
                .name("trimdb-wal".to_string())
                .spawn(move || consumer.run(receiver))?
        };

        Ok(Self {
            path,
            sender: Some(sender),
            writer: Some(writer),
            reader,
            length,
            commit,
            failure,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes of the log the writer has acknowledged.
    pub fn length(&self) -> u64 {
        self.length.load(Ordering::Acquire)
    }

    pub fn committed_offset(&self) -> Result<u64> {
        Ok(self.commit.lock()?.committed())
    }

    fn check_healthy(&self) -> Result<()> {
        match self.failure.get() {
            Some(msg) => Err(Error::Durability(msg.clone())),
            None => Ok(()),
        }
    }

    fn send(&self, request: Request) -> Result<()> {
        self.check_healthy()?;
        self.sender
            .as_ref()
            .ok_or_else(|| Error::InvalidState("log manager is shut down".to_string()))?
            .send(request)
            .map_err(|_| Error::Durability("log writer has stopped".to_string()))
    }

    /// Queues `op` without waiting for it. Records reach the log in the
    /// order `submit` calls return.
    pub fn submit(&self, op: PutOperation) -> Result<Completion> {
        let (done, completion) = oneshot::channel();
        self.send(Request::Append(Append { op, done }))?;
        Ok(completion)
    }

    /// Truncates the log to empty if the commit pointer covers all of it once
    /// every record queued before this call is written. Returns whether the
    /// log was reset.
    ///
    /// Memtable entries tagged with offsets of the old log must be gone by
    /// then; the caller holds the write gate with both memtables empty.
    pub async fn reset_if_committed(&self) -> Result<bool> {
        let (done, completion) = oneshot::channel();
        self.send(Request::Reset(done))?;
        completion
            .await
            .map_err(|_| Error::Durability("log writer dropped the reset".to_string()))?
    }

    /// Appends one record and returns its value offset once the configured
    /// durability point is reached. Dropping the future does not withdraw a
    /// record that was already queued.
    pub async fn log_entry(&self, key: &[u8], value: &[u8], deleted: bool) -> Result<u64> {
        let op = if deleted {
            PutOperation::delete(key)
        } else {
            PutOperation::put(key, value)
        };
        wait(self.submit(op)?).await
    }

    pub fn is_fully_committed(&self) -> Result<bool> {
        Ok(self.length() == self.committed_offset()?)
    }

    /// Moves the commit pointer past the record whose value offset is
    /// `value_offset`. The pointer never moves backwards.
    pub fn record_committed(&self, value_offset: u64) -> Result<()> {
        self.check_healthy()?;
        let value_len = self.read_value_len(value_offset)?;
        let end = value_offset + 4 + value_len.max(0) as u64;
        if end > self.length() {
            return Err(Error::InvalidInput(format!(
                "record at {} ends past the acknowledged log",
                value_offset
            )));
        }

        let mut commit = self.commit.lock()?;
        if end <= commit.committed() {
            return Ok(());
        }
        if let Err(err) = commit.store(end) {
            let msg = format!("commit pointer write failed: {}", err);
            let _ = self.failure.set(msg.clone());
            tracing::error!(error = %err, "Commit pointer write failed, log is now read-only");
            return Err(Error::Durability(msg));
        }
        tracing::debug!(committed = end, "Advanced log commit pointer");
        Ok(())
    }

    /// Reads the value of the record at `value_offset`; `None` for a delete.
    pub fn read_value_at(&self, value_offset: u64) -> Result<Option<Vec<u8>>> {
        let value_len = self.read_value_len(value_offset)?;
        if value_len == DELETED_VALUE_LEN {
            return Ok(None);
        }
        let mut value = vec![0u8; value_len as usize];
        read_exact_at(&self.reader, &mut value, value_offset + 4)
            .map_err(|e| Error::ReadError("log value", e))?;
        Ok(Some(value))
    }

    fn read_value_len(&self, value_offset: u64) -> Result<i32> {
        if value_offset + 4 > self.length() {
            return Err(Error::InvalidInput(format!(
                "value offset {} is past the acknowledged log",
                value_offset
            )));
        }
        let mut buf = [0u8; 4];
        read_exact_at(&self.reader, &mut buf, value_offset)
            .map_err(|e| Error::ReadError("log value length", e))?;
        let value_len = i32::from_le_bytes(buf);
        if value_len < DELETED_VALUE_LEN {
            return Err(Error::CorruptedWal(format!(
                "invalid value length {} at offset {}",
                value_len, value_offset
            )));
        }
        Ok(value_len)
    }

    /// Records after the commit pointer, in log order.
    pub fn uncommitted_operations(&self) -> Result<ReplayIterator> {
        ReplayIterator::new(&self.path, self.committed_offset()?, self.length())
    }
}

impl Drop for LogManager {
    fn drop(&mut self) {
        // Closing the queue lets the writer finish what is queued and exit.
        self.sender.take();
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

/// Waits for a queued record to be written.
pub async fn wait(completion: Completion) -> Result<u64> {
    completion
        .await
        .map_err(|_| Error::Durability("log writer dropped the record".to_string()))?
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(not(unix))]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = file.try_clone()?;
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
}

/// The single consumer of the log queue.
struct LogWriter {
    out: BufWriter<File>,
    offset: u64,
    length: Arc<AtomicU64>,
    commit: Arc<Mutex<CommitFile>>,
    failure: Arc<OnceLock<String>>,
    durability: Durability,
    batch_size: usize,
}

impl LogWriter {
    fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Request>) {
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut encoded = Vec::new();

        while let Some(first) = receiver.blocking_recv() {
            let mut next = Some(first);
            while let Some(request) = next.take() {
                match request {
                    Request::Append(append) => {
                        batch.push(append);
                        if batch.len() < self.batch_size {
                            next = receiver.try_recv().ok();
                        }
                    }
                    // Appends queued ahead of the reset are written first.
                    Request::Reset(done) => {
                        self.finish_batch(&mut batch, &mut encoded);
                        let _ = done.send(self.reset());
                    }
                }
            }
            self.finish_batch(&mut batch, &mut encoded);
        }
    }

    fn finish_batch(&mut self, batch: &mut Vec<Append>, encoded: &mut Vec<u8>) {
        if batch.is_empty() {
            return;
        }

        if let Some(msg) = self.failure.get() {
            for request in batch.drain(..) {
                let _ = request.done.send(Err(Error::Durability(msg.clone())));
            }
            return;
        }

        match self.write_batch(batch, encoded) {
            Ok(offsets) => {
                self.length.store(self.offset, Ordering::Release);
                for (request, offset) in batch.drain(..).zip(offsets) {
                    let _ = request.done.send(Ok(offset));
                }
            }
            Err(err) => {
                let msg = format!("log append failed: {}", err);
                let _ = self.failure.set(msg.clone());
                tracing::error!(error = %err, records = batch.len(), "Log append failed, log is now read-only");
                for request in batch.drain(..) {
                    let _ = request.done.send(Err(Error::Durability(msg.clone())));
                }
            }
        }
    }

    /// Zeroes the commit pointer, then truncates the log, if the pointer
    /// sits at the end of a non-empty log.
    fn reset(&mut self) -> Result<bool> {
        if let Some(msg) = self.failure.get() {
            return Err(Error::Durability(msg.clone()));
        }

        let mut commit = self.commit.lock()?;
        if self.offset == 0 || commit.committed() != self.offset {
            return Ok(false);
        }

        let truncated = commit.store(0).and_then(|()| {
            let file = self.out.get_ref();
            file.set_len(0)?;
            file.sync_all()?;
            Ok(())
        });
        if let Err(err) = truncated {
            let msg = format!("log reset failed: {}", err);
            let _ = self.failure.set(msg.clone());
            tracing::error!(error = %err, "Log reset failed, log is now read-only");
            return Err(Error::Durability(msg));
        }

        tracing::info!(bytes = self.offset, "Reset fully committed log");
        self.offset = 0;
        self.length.store(0, Ordering::Release);
        Ok(true)
    }

    /// Writes every record of `batch`, then flushes once. Returns the value
    /// offset of each record.
    fn write_batch(&mut self, batch: &[Append], encoded: &mut Vec<u8>) -> io::Result<Vec<u64>> {
        let mut offsets = Vec::with_capacity(batch.len());
        for request in batch {
            encoded.clear();
            encoded.reserve(request.op.encoded_len());
            request.op.encode_into(encoded)?;
            self.out.write_all(encoded)?;

            offsets.push(self.offset + 4 + request.op.key.len() as u64);
            self.offset += encoded.len() as u64;
        }

        self.out.flush()?;
        if self.durability == Durability::Synced {
            self.out.get_ref().sync_data()?;
        }
        Ok(offsets)
    }
}
