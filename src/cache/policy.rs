use super::CacheLine;

use bitvec::slice::BitSlice;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Chooses the way of a full set to evict.
///
/// `mru` holds one recently-used bit per way and is only maintained under
/// pseudo LRU replacement.
pub trait EvictionPolicy<L> {
    #[must_use]
    fn choose_victim(&mut self, set: &VecDeque<L>, mru: &BitSlice) -> usize;
}

#[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum Replacement {
    /// Sets are kept in recency order, the tail is evicted.
    #[default]
    LRU,
    /// Ways stay in place, the first way without its recently-used bit is evicted.
    PLRU,
}

impl<L> EvictionPolicy<L> for Replacement
where
    L: CacheLine,
{
    fn choose_victim(&mut self, set: &VecDeque<L>, mru: &BitSlice) -> usize {
        match self {
            Self::LRU => set.len() - 1,
            Self::PLRU => set
                .iter()
                .position(|line| !line.is_valid())
                .or_else(|| mru.first_zero())
                .unwrap_or(0),
        }
    }
}

/// LRU replacement that skips lines the core has written.
///
/// Only applies when the tail is valid. Scans from the tail towards the
/// MRU position for a line without writes and falls back to the tail.
pub struct CleanFirst<F> {
    pub is_written: F,
}

impl<L, F> EvictionPolicy<L> for CleanFirst<F>
where
    L: CacheLine,
    F: Fn(&L) -> bool,
{
    fn choose_victim(&mut self, set: &VecDeque<L>, _mru: &BitSlice) -> usize {
        let tail = set.len() - 1;
        if !set[tail].is_valid() {
            return tail;
        }
        (0..set.len())
            .rev()
            .find(|&way| !(self.is_written)(&set[way]))
            .unwrap_or(tail)
    }
}
