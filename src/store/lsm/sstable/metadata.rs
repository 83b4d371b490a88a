//! Footer-first loading of a table's metadata sections.

use std::fmt;
use std::io::SeekFrom;
use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::format::{
    decode_block_offsets, decode_statistics, EntryType, Footer, TocEntry, PAGE_SIZE,
};
use crate::error::Result;
use crate::store::lsm::filter::{BloomFilter, MembershipFilter};
use crate::Error;

/// Everything a reader needs to know about a table without touching its
/// data pages.
pub struct TableMetadata {
    block_offsets: Vec<u64>,
    first_key: Vec<u8>,
    last_key: Vec<u8>,
    filter: Box<dyn MembershipFilter>,
}

impl fmt::Debug for TableMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableMetadata")
            .field("block_count", &self.block_offsets.len())
            .field("first_key", &String::from_utf8_lossy(&self.first_key))
            .field("last_key", &String::from_utf8_lossy(&self.last_key))
            .finish()
    }
}

impl TableMetadata {
    pub fn new(
        block_offsets: Vec<u64>,
        first_key: Vec<u8>,
        last_key: Vec<u8>,
        filter: Box<dyn MembershipFilter>,
    ) -> Self {
        Self {
            block_offsets,
            first_key,
            last_key,
            filter,
        }
    }

    /// Parses the footer page, then the block-offset, filter and statistics
    /// sections it points at. Fails with `Error::Format` on any
    /// inconsistency; no partially parsed metadata is ever returned.
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path).await?;
        let file_len = file.metadata().await?.len();

        if file_len < PAGE_SIZE as u64 {
            return Err(Error::Format(format!(
                "{} is {} bytes, shorter than one page",
                path.display(),
                file_len
            )));
        }

        let footer_start = file_len - PAGE_SIZE as u64;
        let mut page = vec![0u8; PAGE_SIZE];
        file.seek(SeekFrom::Start(footer_start)).await?;
        file.read_exact(&mut page)
            .await
            .map_err(|e| Error::ReadError("footer page", e))?;
        let footer = Footer::decode(&page)?;

        let offsets_section = read_section(&mut file, &footer, EntryType::BlockOffsets, footer_start).await?;
        let filter_section = read_section(&mut file, &footer, EntryType::Filter, footer_start).await?;
        let stats_section = read_section(&mut file, &footer, EntryType::Statistics, footer_start).await?;

        let block_offsets = decode_block_offsets(&offsets_section)?;
        for (index, offset) in block_offsets.iter().enumerate() {
            if *offset != (index * PAGE_SIZE) as u64 || offset + PAGE_SIZE as u64 > footer_start {
                return Err(Error::Format(format!(
                    "block {} at offset {} is not a page of the data region",
                    index, offset
                )));
            }
        }

        let filter = BloomFilter::from_block(&filter_section)?;
        let (first_key, last_key) = decode_statistics(&stats_section)?;
        if first_key > last_key {
            return Err(Error::Format("first key sorts after last key".to_string()));
        }

        Ok(Self::new(block_offsets, first_key, last_key, Box::new(filter)))
    }

    pub fn block_count(&self) -> usize {
        self.block_offsets.len()
    }

    pub fn block_offsets(&self) -> &[u64] {
        &self.block_offsets
    }

    pub fn first_key(&self) -> &[u8] {
        &self.first_key
    }

    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }

    pub fn filter(&self) -> &dyn MembershipFilter {
        self.filter.as_ref()
    }

    /// True if `key` lies within `[first_key, last_key]`.
    pub fn covers(&self, key: &[u8]) -> bool {
        key >= self.first_key.as_slice() && key <= self.last_key.as_slice()
    }

    /// Range check followed by the filter probe.
    pub fn may_contain(&self, key: &[u8], key_hash: u64) -> bool {
        self.covers(key) && self.filter.may_contain(key_hash)
    }
}

async fn read_section(
    file: &mut File,
    footer: &Footer,
    entry_type: EntryType,
    footer_start: u64,
) -> Result<Vec<u8>> {
    let entry: TocEntry = footer.find(entry_type)?;
    if entry.end() > footer_start {
        return Err(Error::Format(format!(
            "{:?} section [{}, {}) overlaps the footer page at {}",
            entry_type,
            entry.offset,
            entry.end(),
            footer_start
        )));
    }

    let mut buf = vec![0u8; entry.length as usize];
    file.seek(SeekFrom::Start(entry.offset)).await?;
    file.read_exact(&mut buf)
        .await
        .map_err(|e| Error::ReadError("table section", e))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::key_hash;
    use crate::store::lsm::sstable::format::{encode_block_offsets, encode_statistics};
    use crate::store::lsm::sstable::TableWriter;
    use crate::tmpfs::NamedTempFile;

    fn entries(count: usize) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        (0..count)
            .map(|i| {
                let key = format!("key_{:05}", i).into_bytes();
                let value = if i % 10 == 3 {
                    None
                } else {
                    Some(format!("value_{:05}", i).into_bytes())
                };
                (key, value)
            })
            .collect()
    }

    fn write_table(path: &Path, entries: &[(Vec<u8>, Option<Vec<u8>>)]) {
        let mut writer = TableWriter::create(path).expect("Failed to create writer");
        for (key, value) in entries {
            writer.add(key, value.as_deref()).expect("Failed to add entry");
        }
        writer.finish().expect("Failed to finish table");
    }

    #[tokio::test]
    async fn test_metadata_round_trip() {
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let data = entries(2000);
        write_table(temp_file.path(), &data);

        let meta = TableMetadata::load_from_file(temp_file.path())
            .await
            .expect("Failed to load metadata");

        assert_eq!(meta.first_key(), b"key_00000");
        assert_eq!(meta.last_key(), b"key_01999");
        assert!(meta.block_count() > 1);
        for (key, _) in &data {
            assert!(meta.filter().may_contain(key_hash(key)));
        }
        assert!(!meta.covers(b"key_02000"));
        assert!(!meta.may_contain(b"aaa", key_hash(b"aaa")));
    }

    #[tokio::test]
    async fn test_bad_magic_rejected() {
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        write_table(temp_file.path(), &entries(10));

        let mut bytes = std::fs::read(temp_file.path()).unwrap();
        let len = bytes.len();
        bytes[len - 4..].copy_from_slice(b"NOPE");
        std::fs::write(temp_file.path(), &bytes).unwrap();

        let result = TableMetadata::load_from_file(temp_file.path()).await;
        assert!(matches!(result, Err(Error::Format(_))));
    }

    #[tokio::test]
    async fn test_short_file_rejected() {
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        std::fs::write(temp_file.path(), b"tiny").unwrap();

        let result = TableMetadata::load_from_file(temp_file.path()).await;
        assert!(matches!(result, Err(Error::Format(_))));
    }

    #[tokio::test]
    async fn test_section_pointing_into_footer_rejected() {
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");

        let offsets = encode_block_offsets(&[]).unwrap();
        let stats = encode_statistics(b"a", b"b").unwrap();
        let filter = BloomFilter::build(&[]).to_block().unwrap();

        let mut file_bytes = Vec::new();
        let filter_entry = TocEntry::new(EntryType::Filter, 0, filter.len());
        file_bytes.extend_from_slice(&filter);
        let offsets_entry = TocEntry::new(EntryType::BlockOffsets, file_bytes.len() as u64, offsets.len());
        file_bytes.extend_from_slice(&offsets);
        // Claims to extend far past where the footer page begins.
        let stats_entry = TocEntry::new(EntryType::Statistics, file_bytes.len() as u64, PAGE_SIZE);
        file_bytes.extend_from_slice(&stats);

        let footer = Footer::new(vec![filter_entry, offsets_entry, stats_entry]);
        file_bytes.extend_from_slice(&footer.encode().unwrap());
        std::fs::write(temp_file.path(), &file_bytes).unwrap();

        let result = TableMetadata::load_from_file(temp_file.path()).await;
        assert!(matches!(result, Err(Error::Format(_))));
    }
}
