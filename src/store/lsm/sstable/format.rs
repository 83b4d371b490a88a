//! Trailer, table-of-contents and section codecs of the table file format.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::Error;

/// Size of every data page and of the footer page.
pub const PAGE_SIZE: usize = 4096;

/// Last four bytes of every table file.
pub const MAGIC_NUMBER: u32 = u32::from_le_bytes(*b"TRIM");

pub const FORMAT_VERSION: i32 = 1;

pub const TOC_ENTRY_SIZE: usize = 16;

/// `version:i32, tocSize:i32, magic:u32` at the very end of the footer page.
pub const TRAILER_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    BlockOffsets,
    Filter,
    Statistics,
}

impl EntryType {
    pub fn code(self) -> i32 {
        match self {
            EntryType::BlockOffsets => 1,
            EntryType::Filter => 2,
            EntryType::Statistics => 3,
        }
    }

    fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(EntryType::BlockOffsets),
            2 => Some(EntryType::Filter),
            3 => Some(EntryType::Statistics),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TocEntry {
    pub offset: u64,
    pub length: u32,
    /// Raw type code; codes this version does not know are carried and ignored.
    pub entry_type: i32,
}

impl TocEntry {
    pub fn new(entry_type: EntryType, offset: u64, length: usize) -> Self {
        Self {
            offset,
            length: length as u32,
            entry_type: entry_type.code(),
        }
    }

    pub fn kind(&self) -> Option<EntryType> {
        EntryType::from_code(self.entry_type)
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length as u64
    }
}

/// Parsed footer page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footer {
    pub version: i32,
    pub entries: Vec<TocEntry>,
}

impl Footer {
    pub fn new(entries: Vec<TocEntry>) -> Self {
        Self {
            version: FORMAT_VERSION,
            entries,
        }
    }

    /// Lays the table of contents and trailer out at the end of one page.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let toc_size = self.entries.len() * TOC_ENTRY_SIZE + TRAILER_SIZE;
        if toc_size > PAGE_SIZE {
            return Err(Error::InvalidInput(format!(
                "table of contents of {} entries does not fit a page",
                self.entries.len()
            )));
        }

        let mut page = vec![0u8; PAGE_SIZE - toc_size];
        for entry in &self.entries {
            page.write_i64::<LittleEndian>(entry.offset as i64)?;
            page.write_i32::<LittleEndian>(entry.length as i32)?;
            page.write_i32::<LittleEndian>(entry.entry_type)?;
        }
        page.write_i32::<LittleEndian>(self.version)?;
        page.write_i32::<LittleEndian>(toc_size as i32)?;
        page.write_u32::<LittleEndian>(MAGIC_NUMBER)?;
        debug_assert_eq!(page.len(), PAGE_SIZE);
        Ok(page)
    }

    /// Parses the final page of a table file. Nothing is returned unless the
    /// magic number, version and table-of-contents size all check out.
    pub fn decode(page: &[u8]) -> Result<Self> {
        if page.len() != PAGE_SIZE {
            return Err(Error::Format(format!(
                "footer page is {} bytes, expected {}",
                page.len(),
                PAGE_SIZE
            )));
        }

        let mut trailer = &page[PAGE_SIZE - TRAILER_SIZE..];
        let version = trailer.read_i32::<LittleEndian>()?;
        let toc_size = trailer.read_i32::<LittleEndian>()?;
        let magic = trailer.read_u32::<LittleEndian>()?;

        if magic != MAGIC_NUMBER {
            return Err(Error::Format(format!("bad magic number {:#010x}", magic)));
        }
        if version != FORMAT_VERSION {
            return Err(Error::Format(format!("unsupported version {}", version)));
        }
        if toc_size < TRAILER_SIZE as i32 || toc_size as usize > PAGE_SIZE {
            return Err(Error::Format(format!(
                "table of contents size {} out of bounds",
                toc_size
            )));
        }

        let toc = &page[PAGE_SIZE - toc_size as usize..PAGE_SIZE - TRAILER_SIZE];
        if toc.len() % TOC_ENTRY_SIZE != 0 {
            return Err(Error::Format(format!(
                "table of contents length {} is not a multiple of {}",
                toc.len(),
                TOC_ENTRY_SIZE
            )));
        }

        let mut cursor = Cursor::new(toc);
        let mut entries = Vec::with_capacity(toc.len() / TOC_ENTRY_SIZE);
        while (cursor.position() as usize) < toc.len() {
            let offset = cursor.read_i64::<LittleEndian>()?;
            let length = cursor.read_i32::<LittleEndian>()?;
            let entry_type = cursor.read_i32::<LittleEndian>()?;
            if offset < 0 || length < 0 {
                return Err(Error::Format(format!(
                    "negative table of contents entry (offset {}, length {})",
                    offset, length
                )));
            }
            entries.push(TocEntry {
                offset: offset as u64,
                length: length as u32,
                entry_type,
            });
        }

        Ok(Self { version, entries })
    }

    /// Returns the single entry of the given type.
    pub fn find(&self, entry_type: EntryType) -> Result<TocEntry> {
        let mut matches = self
            .entries
            .iter()
            .filter(|entry| entry.kind() == Some(entry_type));

        match (matches.next(), matches.next()) {
            (Some(entry), None) => Ok(*entry),
            (None, _) => Err(Error::Format(format!(
                "missing {:?} table of contents entry",
                entry_type
            ))),
            (Some(_), Some(_)) => Err(Error::Format(format!(
                "duplicate {:?} table of contents entry",
                entry_type
            ))),
        }
    }
}

pub fn encode_block_offsets(offsets: &[u64]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(4 + offsets.len() * 8);
    buf.write_i32::<LittleEndian>(offsets.len() as i32)?;
    for offset in offsets {
        buf.write_i64::<LittleEndian>(*offset as i64)?;
    }
    Ok(buf)
}

/// The declared count must agree with the number of offsets the section
/// actually holds.
pub fn decode_block_offsets(section: &[u8]) -> Result<Vec<u64>> {
    if section.len() < 4 {
        return Err(Error::Format(format!(
            "block offset section of {} bytes has no count",
            section.len()
        )));
    }
    let mut cursor = Cursor::new(section);
    let expected = cursor
        .read_i32::<LittleEndian>()
        .map_err(|e| Error::ReadError("block offset count", e))?;

    let available = (section.len() - cursor.position() as usize) / 8;
    if expected < 0 || expected as usize != available {
        return Err(Error::Format(format!(
            "block offset count {} does not match section holding {}",
            expected, available
        )));
    }

    let mut offsets = Vec::with_capacity(available);
    for _ in 0..available {
        let offset = cursor
            .read_i64::<LittleEndian>()
            .map_err(|e| Error::ReadError("block offset", e))?;
        offsets.push(offset as u64);
    }
    Ok(offsets)
}

pub fn encode_statistics(first_key: &[u8], last_key: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8 + first_key.len() + last_key.len());
    buf.write_i32::<LittleEndian>(first_key.len() as i32)?;
    buf.extend_from_slice(first_key);
    buf.write_i32::<LittleEndian>(last_key.len() as i32)?;
    buf.extend_from_slice(last_key);
    Ok(buf)
}

/// Returns `(first_key, last_key)`.
pub fn decode_statistics(section: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut cursor = Cursor::new(section);
    let first_key = read_prefixed(&mut cursor, "first key")?;
    let last_key = read_prefixed(&mut cursor, "last key")?;
    Ok((first_key, last_key))
}

fn read_prefixed(cursor: &mut Cursor<&[u8]>, context: &'static str) -> Result<Vec<u8>> {
    let len = cursor
        .read_i32::<LittleEndian>()
        .map_err(|e| Error::ReadError(context, e))?;
    if len < 0 {
        return Err(Error::Format(format!("negative {} length {}", context, len)));
    }
    let remaining = cursor.get_ref().len() as u64 - cursor.position();
    if len as u64 > remaining {
        return Err(Error::Format(format!(
            "{} length {} exceeds the {} bytes left in the section",
            context, len, remaining
        )));
    }
    let mut buf = vec![0u8; len as usize];
    cursor
        .read_exact(&mut buf)
        .map_err(|e| Error::ReadError(context, e))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_footer() -> Footer {
        Footer::new(vec![
            TocEntry::new(EntryType::Filter, 8192, 100),
            TocEntry::new(EntryType::BlockOffsets, 8292, 20),
            TocEntry::new(EntryType::Statistics, 8312, 16),
        ])
    }

    #[test]
    fn test_footer_layout() {
        let page = sample_footer().encode().expect("encode");
        assert_eq!(page.len(), PAGE_SIZE);
        assert_eq!(&page[PAGE_SIZE - 4..], b"TRIM");

        let toc_size = i32::from_le_bytes(page[PAGE_SIZE - 8..PAGE_SIZE - 4].try_into().unwrap());
        assert_eq!(toc_size as usize, 3 * TOC_ENTRY_SIZE + TRAILER_SIZE);

        let decoded = Footer::decode(&page).expect("decode");
        assert_eq!(decoded, sample_footer());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut page = sample_footer().encode().expect("encode");
        page[PAGE_SIZE - 1] ^= 0xFF;
        assert!(matches!(Footer::decode(&page), Err(Error::Format(_))));
    }

    #[test]
    fn test_toc_size_out_of_bounds_rejected() {
        let mut page = sample_footer().encode().expect("encode");
        page[PAGE_SIZE - 8..PAGE_SIZE - 4].copy_from_slice(&(PAGE_SIZE as i32 + 1).to_le_bytes());
        assert!(matches!(Footer::decode(&page), Err(Error::Format(_))));
    }

    #[test]
    fn test_missing_and_duplicate_entries() {
        let footer = Footer::new(vec![
            TocEntry::new(EntryType::Filter, 0, 1),
            TocEntry::new(EntryType::Filter, 1, 1),
        ]);
        assert!(matches!(footer.find(EntryType::Filter), Err(Error::Format(_))));
        assert!(matches!(
            footer.find(EntryType::Statistics),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_unknown_entry_types_ignored() {
        let mut footer = sample_footer();
        footer.entries.push(TocEntry {
            offset: 0,
            length: 0,
            entry_type: 99,
        });
        let decoded = Footer::decode(&footer.encode().unwrap()).unwrap();
        let stats = decoded.find(EntryType::Statistics).expect("statistics");
        assert_eq!(stats.offset, 8312);
    }

    #[test]
    fn test_block_offset_count_mismatch() {
        let mut section = encode_block_offsets(&[0, 4096, 8192]).unwrap();
        assert_eq!(decode_block_offsets(&section).unwrap(), vec![0, 4096, 8192]);

        section[0..4].copy_from_slice(&4i32.to_le_bytes());
        assert!(matches!(
            decode_block_offsets(&section),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_statistics_layout() {
        let section = encode_statistics(b"apple", b"pear").unwrap();
        assert_eq!(&section[0..4], &5i32.to_le_bytes());
        assert_eq!(&section[4..9], b"apple");
        let (first, last) = decode_statistics(&section).unwrap();
        assert_eq!(first, b"apple");
        assert_eq!(last, b"pear");
    }

    #[test]
    fn test_truncated_statistics() {
        let section = encode_statistics(b"apple", b"pear").unwrap();
        assert!(matches!(
            decode_statistics(&section[..section.len() - 1]),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_statistics_length_past_section() {
        let mut section = Vec::new();
        section.extend_from_slice(&i32::MAX.to_le_bytes());
        section.extend_from_slice(b"abc");
        assert!(matches!(decode_statistics(&section), Err(Error::Format(_))));
    }

    #[test]
    fn test_block_offset_section_without_count() {
        for len in 0..4 {
            let section = vec![0u8; len];
            assert!(matches!(decode_block_offsets(&section), Err(Error::Format(_))));
        }
    }
}
