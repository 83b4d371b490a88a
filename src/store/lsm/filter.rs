//! Approximate membership filters attached to every table file.
//!
//! A filter answers "definitely absent" or "maybe present" for a key hash so
//! reads can skip tables without touching their pages. The table format
//! stores the filter as an opaque section; only the filter knows its layout.

use std::io::{Cursor, Read};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::Error;

/// Capability a table needs from its filter.
pub trait MembershipFilter: Send + Sync {
    /// One-sided: may return true for absent keys, never false for present ones.
    fn may_contain(&self, key_hash: u64) -> bool;

    /// Serializes the filter into its table section.
    fn to_block(&self) -> Result<Vec<u8>>;
}

const DEFAULT_BITS_PER_KEY: usize = 10;

/// Bloom filter using double hashing over the two halves of the key hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Sizes a filter for `expected_keys` at the given bits-per-key budget.
    pub fn with_capacity(expected_keys: usize, bits_per_key: usize) -> Self {
        let num_bits = (expected_keys.max(1) * bits_per_key.max(1)).max(64) as u64;
        // k = bits_per_key * ln 2, rounded
        let num_hashes = ((bits_per_key as f64) * std::f64::consts::LN_2).round() as u32;
        Self {
            bits: vec![0u64; num_bits.div_ceil(64) as usize],
            num_bits,
            num_hashes: num_hashes.clamp(1, 30),
        }
    }

    /// Builds a filter containing every hash in `key_hashes`.
    pub fn build(key_hashes: &[u64]) -> Self {
        let mut filter = Self::with_capacity(key_hashes.len(), DEFAULT_BITS_PER_KEY);
        for hash in key_hashes {
            filter.insert(*hash);
        }
        filter
    }

    pub fn insert(&mut self, key_hash: u64) {
        let (h1, h2) = split(key_hash);
        for i in 0..self.num_hashes {
            let bit = self.bit_index(h1, h2, i);
            self.bits[(bit / 64) as usize] |= 1u64 << (bit % 64);
        }
    }

    /// Reconstructs a filter from its table section.
    pub fn from_block(block: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(block);
        let num_bits = cursor
            .read_u64::<LittleEndian>()
            .map_err(|e| Error::ReadError("filter bit count", e))?;
        let num_hashes = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| Error::ReadError("filter hash count", e))?;

        let words = num_bits.div_ceil(64) as usize;
        if num_bits == 0 || num_hashes == 0 || block.len() != 12 + words * 8 {
            return Err(Error::Format(format!(
                "filter section of {} bytes does not hold {} bits",
                block.len(),
                num_bits
            )));
        }

        let mut bits = vec![0u64; words];
        let mut raw = vec![0u8; words * 8];
        cursor
            .read_exact(&mut raw)
            .map_err(|e| Error::ReadError("filter bits", e))?;
        for (word, chunk) in bits.iter_mut().zip(raw.chunks_exact(8)) {
            *word = LittleEndian::read_u64(chunk);
        }

        Ok(Self {
            bits,
            num_bits,
            num_hashes,
        })
    }

    fn bit_index(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits
    }
}

fn split(key_hash: u64) -> (u64, u64) {
    let h1 = key_hash & 0xFFFF_FFFF;
    // Never zero, so probes cannot collapse onto a single bit.
    let h2 = (key_hash >> 32) | 1;
    (h1, h2)
}

impl MembershipFilter for BloomFilter {
    fn may_contain(&self, key_hash: u64) -> bool {
        let (h1, h2) = split(key_hash);
        (0..self.num_hashes).all(|i| {
            let bit = self.bit_index(h1, h2, i);
            self.bits[(bit / 64) as usize] & (1u64 << (bit % 64)) != 0
        })
    }

    fn to_block(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(12 + self.bits.len() * 8);
        buf.write_u64::<LittleEndian>(self.num_bits)?;
        buf.write_u32::<LittleEndian>(self.num_hashes)?;
        for word in &self.bits {
            buf.write_u64::<LittleEndian>(*word)?;
        }
        Ok(buf)
    }
}
