use crate::address;

use bitvec::vec::BitVec;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Set of line addresses with false positives but no false negatives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: BitVec,
    num_hashes: usize,
}

impl BloomFilter {
    #[must_use]
    pub fn new(num_bits: usize, num_hashes: usize) -> Self {
        assert!(num_bits > 0 && num_hashes > 0);
        Self {
            bits: BitVec::repeat(false, num_bits),
            num_hashes,
        }
    }

    fn indices(&self, addr: address) -> impl Iterator<Item = usize> + '_ {
        (0..self.num_hashes).map(move |seed| {
            let mut hasher = DefaultHasher::new();
            seed.hash(&mut hasher);
            addr.hash(&mut hasher);
            (hasher.finish() % self.bits.len() as u64) as usize
        })
    }

    pub fn add(&mut self, addr: address) {
        let indices: Vec<usize> = self.indices(addr).collect();
        for idx in indices {
            self.bits.set(idx, true);
        }
    }

    #[must_use]
    pub fn contains(&self, addr: address) -> bool {
        self.indices(addr).all(|idx| self.bits[idx])
    }

    pub fn clear(&mut self) {
        self.bits.fill(false);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits.not_any()
    }
}
