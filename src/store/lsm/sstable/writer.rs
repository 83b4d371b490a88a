use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::format::{
    encode_block_offsets, encode_statistics, EntryType, Footer, TocEntry, PAGE_SIZE,
};
use super::page::PageBuilder;
use crate::error::Result;
use crate::hasher::key_hash;
use crate::store::lsm::filter::{BloomFilter, MembershipFilter};
use crate::Error;

/// Builds a table file in one forward pass.
///
/// Everything is written to `<path>.tmp` and renamed into place by
/// [`TableWriter::finish`], so a table under its final name is always
/// complete. Dropping an unfinished writer removes the temporary file.
pub struct TableWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    out: BufWriter<File>,
    page: PageBuilder,
    block_offsets: Vec<u64>,
    key_hashes: Vec<u64>,
    first_key: Option<Vec<u8>>,
    last_key: Vec<u8>,
    offset: u64,
    finished: bool,
}

impl TableWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;

        Ok(Self {
            path,
            tmp_path,
            out: BufWriter::new(file),
            page: PageBuilder::new(),
            block_offsets: Vec::new(),
            key_hashes: Vec::new(),
            first_key: None,
            last_key: Vec::new(),
            offset: 0,
            finished: false,
        })
    }

    /// Appends one entry. Keys must be strictly ascending; `None` writes a
    /// tombstone.
    pub fn add(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        if self.first_key.is_some() && key <= self.last_key.as_slice() {
            return Err(Error::InvalidInput(format!(
                "key {:?} does not sort after {:?}",
                String::from_utf8_lossy(key),
                String::from_utf8_lossy(&self.last_key)
            )));
        }
        if !PageBuilder::entry_fits_alone(key, value) {
            return Err(Error::InvalidInput(format!(
                "entry of {} key bytes and {} value bytes exceeds the page size",
                key.len(),
                value.map_or(0, |v| v.len())
            )));
        }

        if !self.page.add(key, value) {
            self.flush_page()?;
            if !self.page.add(key, value) {
                return Err(Error::InvalidState(
                    "entry rejected by an empty page".to_string(),
                ));
            }
        }

        self.key_hashes.push(key_hash(key));
        if self.first_key.is_none() {
            self.first_key = Some(key.to_vec());
        }
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        Ok(())
    }

    /// Pages written so far, counting the one being filled.
    pub fn page_count(&self) -> usize {
        self.block_offsets.len() + usize::from(!self.page.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.first_key.is_none()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush_page(&mut self) -> Result<()> {
        if self.page.is_empty() {
            return Ok(());
        }
        let page = std::mem::replace(&mut self.page, PageBuilder::new()).finish();
        self.out.write_all(&page)?;
        self.block_offsets.push(self.offset);
        self.offset += page.len() as u64;
        Ok(())
    }

    fn write_section(&mut self, entry_type: EntryType, bytes: &[u8]) -> Result<TocEntry> {
        let entry = TocEntry::new(entry_type, self.offset, bytes.len());
        self.out.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        Ok(entry)
    }

    /// Writes the metadata sections and footer, syncs, and renames the file
    /// into place. Returns the size of the finished table in bytes.
    pub fn finish(mut self) -> Result<u64> {
        let first_key = self
            .first_key
            .clone()
            .ok_or_else(|| Error::InvalidState("cannot finish an empty table".to_string()))?;
        self.flush_page()?;

        let filter = BloomFilter::build(&self.key_hashes).to_block()?;
        let offsets = encode_block_offsets(&self.block_offsets)?;
        let stats = encode_statistics(&first_key, &self.last_key)?;

        let filter_entry = self.write_section(EntryType::Filter, &filter)?;
        let offsets_entry = self.write_section(EntryType::BlockOffsets, &offsets)?;
        let stats_entry = self.write_section(EntryType::Statistics, &stats)?;

        let padding = (PAGE_SIZE - (self.offset as usize % PAGE_SIZE)) % PAGE_SIZE;
        self.out.write_all(&vec![0u8; padding])?;
        self.offset += padding as u64;

        let footer = Footer::new(vec![filter_entry, offsets_entry, stats_entry]).encode()?;
        self.out.write_all(&footer)?;
        self.offset += footer.len() as u64;

        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        fs::rename(&self.tmp_path, &self.path)?;
        self.finished = true;

        tracing::debug!(
            path = %self.path.display(),
            pages = self.block_offsets.len(),
            entries = self.key_hashes.len(),
            bytes = self.offset,
            "Table file written"
        );
        Ok(self.offset)
    }
}

impl Drop for TableWriter {
    fn drop(&mut self) {
        if !self.finished {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}
