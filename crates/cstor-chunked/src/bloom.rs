//! Bloom filter over binary digests.
//!
//! Each cache file carries one of these so that the differ can reject most
//! lookups without touching the tag table. The filter is sized at ten bits per
//! entry with three hash functions, which keeps the false-positive rate near
//! 1.7%.
//!
//! The `k` bit positions are derived from the digest itself: hash function
//! `i` splits the input at `i % len` and xors the CRC-32 of both halves.
//! Those hashes differ only by constants, so reducing them modulo a power of
//! two keeps correlated low bits. The word count is therefore always odd once
//! the filter spans more than one word; readers take the count from the
//! serialized filter and are unaffected.

use crc::{CRC_32_ISO_HDLC, Crc};

use crate::error::{ChunkedError, Result};

const CRC32_IEEE: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Bits allocated per expected entry.
pub const BITS_PER_ENTRY: usize = 10;

/// Number of hash functions used by the cache.
pub const DEFAULT_HASHES: u32 = 3;

/// A fixed-size bloom filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u64>,
    k: u32,
}

impl BloomFilter {
    /// Create a filter able to hold `expected_entries` with `k` hash functions.
    pub fn new(expected_entries: usize, k: u32) -> Self {
        let nbits = expected_entries.max(1) * BITS_PER_ENTRY;
        let mut words = nbits.div_ceil(64);
        if words > 1 {
            words |= 1;
        }
        Self {
            bits: vec![0; words],
            k: k.max(1),
        }
    }

    /// Rebuild a filter from its serialized words.
    pub fn from_words(bits: Vec<u64>, k: u32) -> Result<Self> {
        if bits.is_empty() || k == 0 {
            return Err(ChunkedError::CacheCorrupt(
                "bloom filter is empty".to_string(),
            ));
        }
        Ok(Self { bits, k })
    }

    /// Number of hash functions.
    pub fn hashes(&self) -> u32 {
        self.k
    }

    /// The underlying bit array.
    pub fn words(&self) -> &[u64] {
        &self.bits
    }

    fn bit_count(&self) -> u64 {
        self.bits.len() as u64 * 64
    }

    /// Word index and single-bit mask selected by hash `seed`.
    fn position(&self, data: &[u8], seed: u32) -> (usize, u64) {
        let hash = if data.is_empty() {
            CRC32_IEEE.checksum(&[]) ^ seed
        } else {
            let split = seed as usize % data.len();
            CRC32_IEEE.checksum(&data[..split]) ^ CRC32_IEEE.checksum(&data[split..])
        };
        let bit = hash as u64 % self.bit_count();
        ((bit / 64) as usize, 1u64 << (bit % 64))
    }

    /// Insert an item.
    pub fn add(&mut self, data: &[u8]) {
        for seed in 0..self.k {
            let (idx, mask) = self.position(data, seed);
            self.bits[idx] |= mask;
        }
    }

    /// Whether the item may have been inserted. Never false for inserted items.
    pub fn maybe_contains(&self, data: &[u8]) -> bool {
        (0..self.k).all(|seed| {
            let (idx, mask) = self.position(data, seed);
            self.bits[idx] & mask != 0
        })
    }
}
