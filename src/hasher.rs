//! Key hashing shared by filter construction and lookups.
//!
//! A key is hashed once per read and the same value is tested against the
//! membership filter of every table the read visits, so the function must be
//! stable across processes and releases.

use crc::{Algorithm, Crc};

pub const CRC_64_ECMA: Algorithm<u64> = crc::CRC_64_ECMA_182;

static KEY_CRC: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA);

/// Returns the 64-bit hash of `key`.
pub fn key_hash(key: &[u8]) -> u64 {
    KEY_CRC.checksum(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_different_keys_different_hashes() {
        assert_ne!(key_hash(b"hello"), key_hash(b"world"));
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(key_hash(b"stable"), key_hash(b"stable"));
        assert_eq!(key_hash(b""), 0);
    }
}
