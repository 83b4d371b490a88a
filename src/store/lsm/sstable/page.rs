//! Fixed-size data pages.
//!
//! Every page is exactly [`PAGE_SIZE`] bytes so that page `i` of a table lives
//! at `i * PAGE_SIZE` in the mapped file. Entries are stored behind a slot
//! array so a lookup can binary search without decoding the whole page.

use std::cmp::Ordering;

use byteorder::{ByteOrder, LittleEndian};

use super::format::PAGE_SIZE;
use super::SearchResult;
use crate::error::Result;
use crate::Error;

/// `valLen` value marking a deletion.
pub const TOMBSTONE: u16 = u16::MAX;

const COUNT_SIZE: usize = 2;
const SLOT_SIZE: usize = 2;
const ENTRY_HEADER_SIZE: usize = 4;

/// Largest `key.len() + value.len()` that fits a page on its own.
pub const MAX_ENTRY_PAYLOAD: usize = PAGE_SIZE - COUNT_SIZE - SLOT_SIZE - ENTRY_HEADER_SIZE;

pub struct PageBuilder {
    body: Vec<u8>,
    slots: Vec<u16>,
    first_key: Option<Vec<u8>>,
}

impl PageBuilder {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            body: Vec::with_capacity(PAGE_SIZE),
            slots: Vec::new(),
            first_key: None,
        }
    }

    /// Appends an entry if it fits. Keys must arrive in ascending order.
    /// A `None` value records a tombstone.
    pub fn add(&mut self, key: &[u8], value: Option<&[u8]>) -> bool {
        let value_len = value.map_or(0, |v| v.len());
        if !Self::entry_fits_alone(key, value) || !self.has_room(key.len() + value_len) {
            return false;
        }

        self.slots.push(self.body.len() as u16);
        let mut header = [0u8; ENTRY_HEADER_SIZE];
        LittleEndian::write_u16(&mut header[0..2], key.len() as u16);
        LittleEndian::write_u16(
            &mut header[2..4],
            value.map_or(TOMBSTONE, |v| v.len() as u16),
        );
        self.body.extend_from_slice(&header);
        self.body.extend_from_slice(key);
        if let Some(v) = value {
            self.body.extend_from_slice(v);
        }

        if self.first_key.is_none() {
            self.first_key = Some(key.to_vec());
        }
        true
    }

    /// Whether the entry could be stored in an otherwise empty page.
    pub fn entry_fits_alone(key: &[u8], value: Option<&[u8]>) -> bool {
        let value_len = value.map_or(0, |v| v.len());
        value_len < TOMBSTONE as usize && key.len() + value_len <= MAX_ENTRY_PAYLOAD
    }

    fn has_room(&self, payload: usize) -> bool {
        let used = COUNT_SIZE + self.slots.len() * SLOT_SIZE + self.body.len();
        used + SLOT_SIZE + ENTRY_HEADER_SIZE + payload <= PAGE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.slots.len()
    }

    pub fn first_key(&self) -> Option<&[u8]> {
        self.first_key.as_deref()
    }

    /// Produces the zero-padded page image.
    pub fn finish(self) -> Vec<u8> {
        let header_len = COUNT_SIZE + self.slots.len() * SLOT_SIZE;
        let mut page = vec![0u8; PAGE_SIZE];

        LittleEndian::write_u16(&mut page[0..2], self.slots.len() as u16);
        for (i, slot) in self.slots.iter().enumerate() {
            let at = COUNT_SIZE + i * SLOT_SIZE;
            LittleEndian::write_u16(&mut page[at..at + 2], *slot + header_len as u16);
        }
        page[header_len..header_len + self.body.len()].copy_from_slice(&self.body);
        page
    }
}

/// A decoded entry borrowed from a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageEntry<'a> {
    pub key: &'a [u8],
    /// `None` for a tombstone.
    pub value: Option<&'a [u8]>,
}

/// Read-only view over one page image.
#[derive(Clone, Copy)]
pub struct PageView<'a> {
    data: &'a [u8],
    count: usize,
}

impl<'a> PageView<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self> {
        if data.len() != PAGE_SIZE {
            return Err(Error::Format(format!(
                "page is {} bytes, expected {}",
                data.len(),
                PAGE_SIZE
            )));
        }
        let count = LittleEndian::read_u16(&data[0..2]) as usize;
        if COUNT_SIZE + count * SLOT_SIZE > PAGE_SIZE {
            return Err(Error::Format(format!("page claims {} entries", count)));
        }
        Ok(Self { data, count })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn entry(&self, index: usize) -> Result<PageEntry<'a>> {
        if index >= self.count {
            return Err(Error::Format(format!(
                "slot {} beyond page entry count {}",
                index, self.count
            )));
        }
        let slot_at = COUNT_SIZE + index * SLOT_SIZE;
        let start = LittleEndian::read_u16(&self.data[slot_at..slot_at + 2]) as usize;
        let header = self
            .data
            .get(start..start + ENTRY_HEADER_SIZE)
            .ok_or_else(|| Error::Format(format!("entry header at {} past page end", start)))?;

        let key_len = LittleEndian::read_u16(&header[0..2]) as usize;
        let value_len = LittleEndian::read_u16(&header[2..4]);

        let key_start = start + ENTRY_HEADER_SIZE;
        let key = self
            .data
            .get(key_start..key_start + key_len)
            .ok_or_else(|| Error::Format(format!("key at {} past page end", key_start)))?;

        let value = if value_len == TOMBSTONE {
            None
        } else {
            let value_start = key_start + key_len;
            Some(
                self.data
                    .get(value_start..value_start + value_len as usize)
                    .ok_or_else(|| {
                        Error::Format(format!("value at {} past page end", value_start))
                    })?,
            )
        };

        Ok(PageEntry { key, value })
    }

    pub fn first_key(&self) -> Result<Option<&'a [u8]>> {
        if self.count == 0 {
            return Ok(None);
        }
        Ok(Some(self.entry(0)?.key))
    }

    /// Binary search over the slot array.
    pub fn get(&self, key: &[u8]) -> Result<SearchResult> {
        let (mut low, mut high) = (0, self.count);
        while low < high {
            let mid = low + (high - low) / 2;
            let entry = self.entry(mid)?;
            match entry.key.cmp(key) {
                Ordering::Less => low = mid + 1,
                Ordering::Greater => high = mid,
                Ordering::Equal => {
                    return Ok(match entry.value {
                        Some(value) => SearchResult::Found(value.to_vec()),
                        None => SearchResult::Deleted,
                    });
                }
            }
        }
        Ok(SearchResult::NotFound)
    }
}
