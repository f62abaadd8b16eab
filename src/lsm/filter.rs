//! Bloom filter for skipping SSTables that cannot contain a key.
//!
//! Sizing follows the usual 10-bits-per-key rule with a floor of 64 bits;
//! the hash count is derived from the target false-positive rate. The hash
//! family is k seeded FNV-style mixes over the key bytes, indexed modulo the
//! bit count — no false negatives, tunable false positives.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::errcorrupt;
use crate::error::Result;

pub const DEFAULT_FP_RATE: f64 = 0.01;

#[derive(Clone, Debug)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: usize,
    num_hashes: u32,
}

impl BloomFilter {
    /// Sizes the filter for `expected_keys` at the given false-positive rate.
    pub fn new(expected_keys: usize, fp_rate: f64) -> Self {
        let num_hashes = ((-fp_rate.ln() / 2f64.ln()).ceil() as u32).max(1);
        let num_bits = (expected_keys * 10).max(64);
        let bytes = num_bits.div_ceil(8);
        Self {
            bits: vec![0u8; bytes],
            num_bits: bytes * 8,
            num_hashes,
        }
    }

    pub fn add(&mut self, key: &[u8]) {
        for seed in 0..self.num_hashes {
            let bit = (Self::hash(key, seed) % self.num_bits as u64) as usize;
            self.bits[bit / 8] |= 1 << (bit % 8);
        }
    }

    /// False negatives are impossible; a `true` answer may be wrong at the
    /// configured rate.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        for seed in 0..self.num_hashes {
            let bit = (Self::hash(key, seed) % self.num_bits as u64) as usize;
            if self.bits[bit / 8] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }

    /// `[num_hashes:4 LE][num_bytes:4 LE][bits]`
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.bits.len());
        buf.extend_from_slice(&self.num_hashes.to_le_bytes());
        buf.extend_from_slice(&(self.bits.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.bits);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let num_hashes = cursor.read_u32::<LittleEndian>()?;
        let num_bytes = cursor.read_u32::<LittleEndian>()? as usize;
        if data.len() < 8 + num_bytes || num_hashes == 0 {
            return errcorrupt!("malformed bloom filter block ({} bytes)", data.len());
        }
        let bits = data[8..8 + num_bytes].to_vec();
        Ok(Self {
            num_bits: bits.len() * 8,
            bits,
            num_hashes,
        })
    }

    fn hash(key: &[u8], seed: u32) -> u64 {
        let mut h = (seed as u64).wrapping_mul(0x9e3779b97f4a7c15);
        for &b in key {
            h ^= b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        h
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let mut filter = BloomFilter::new(1000, DEFAULT_FP_RATE);
        for i in 0..1000u32 {
            filter.add(format!("key_{i}").as_bytes());
        }
        for i in 0..1000u32 {
            assert!(filter.may_contain(format!("key_{i}").as_bytes()));
        }
    }

    #[test]
    fn test_false_positive_rate_is_bounded() {
        let mut filter = BloomFilter::new(1000, DEFAULT_FP_RATE);
        for i in 0..1000u32 {
            filter.add(format!("key_{i}").as_bytes());
        }

        let false_positives = (0..10_000u32)
            .filter(|i| filter.may_contain(format!("absent_{i}").as_bytes()))
            .count();
        // 1% target; allow generous slack for hash quality.
        assert!(false_positives < 500, "false positive count: {false_positives}");
    }

    #[test]
    fn test_encode_decode_roundtrip() -> Result<()> {
        let mut filter = BloomFilter::new(100, DEFAULT_FP_RATE);
        for i in 0..100u32 {
            filter.add(&i.to_le_bytes());
        }

        let decoded = BloomFilter::decode(&filter.encode())?;
        for i in 0..100u32 {
            assert!(decoded.may_contain(&i.to_le_bytes()));
        }
        assert_eq!(decoded.num_hashes, filter.num_hashes);
        assert_eq!(decoded.num_bits, filter.num_bits);
        Ok(())
    }

    #[test]
    fn test_minimum_sizing() {
        // Zero expected keys still gets the 64-bit floor.
        let filter = BloomFilter::new(0, DEFAULT_FP_RATE);
        assert_eq!(filter.num_bits, 64);
        assert_eq!(filter.num_hashes, 7); // ceil(-ln(0.01)/ln(2))
    }

    #[test]
    fn test_truncated_block_rejected() {
        let mut filter = BloomFilter::new(100, DEFAULT_FP_RATE);
        filter.add(b"k");
        let mut encoded = filter.encode();
        encoded.truncate(10);
        assert!(BloomFilter::decode(&encoded).is_err());
    }
}
