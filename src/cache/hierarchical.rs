use super::{CacheLevel, CacheLine, EvictionPolicy, Replacement};
use crate::{address, config};

use bitvec::vec::BitVec;
use std::collections::VecDeque;

/// Position a victim was removed from, to be filled by [`HierarchicalCache::fill`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot {
    pub set: usize,
    pub way: usize,
}

/// One level of a set-associative cache.
///
/// Every set always holds exactly `associativity` lines, empty slots are
/// blank lines. Under LRU the front of a set is the most recently used line.
#[derive(Debug, Clone)]
pub struct HierarchicalCache<L> {
    pub level: CacheLevel,
    pub config: config::Cache,
    pub replacement: Replacement,
    sets: Vec<VecDeque<L>>,
    mru: Vec<BitVec>,
    blank: L,
}

impl<L> HierarchicalCache<L>
where
    L: CacheLine,
{
    #[must_use]
    pub fn new(
        level: CacheLevel,
        config: config::Cache,
        replacement: Replacement,
        blank: L,
    ) -> Self {
        let num_sets = config.num_sets();
        let assoc = config.associativity;
        let sets = (0..num_sets)
            .map(|_| std::iter::repeat(blank.clone()).take(assoc).collect())
            .collect();
        let mru = (0..num_sets).map(|_| BitVec::repeat(false, assoc)).collect();
        Self {
            level,
            config,
            replacement,
            sets,
            mru,
            blank,
        }
    }

    #[inline]
    #[must_use]
    pub fn set_index(&self, addr: address) -> usize {
        self.config.set_index(addr)
    }

    #[must_use]
    pub fn set(&self, addr: address) -> &VecDeque<L> {
        &self.sets[self.set_index(addr)]
    }

    pub fn sets(&self) -> impl Iterator<Item = &VecDeque<L>> + '_ {
        self.sets.iter()
    }

    pub fn lines(&self) -> impl Iterator<Item = &L> + '_ {
        self.sets.iter().flatten()
    }

    pub fn lines_mut(&mut self) -> impl Iterator<Item = &mut L> + '_ {
        self.sets.iter_mut().flatten()
    }

    /// Addresses of all valid lines.
    #[must_use]
    pub fn valid_addresses(&self) -> Vec<address> {
        self.lines()
            .filter(|line| line.is_valid())
            .filter_map(CacheLine::addr)
            .collect()
    }

    fn way(&self, addr: address) -> Option<usize> {
        self.set(addr).iter().position(|line| line.holds(addr))
    }

    /// The line holding `addr` in any state.
    #[must_use]
    pub fn find(&self, addr: address) -> Option<&L> {
        self.set(addr).iter().find(|line| line.holds(addr))
    }

    pub fn find_mut(&mut self, addr: address) -> Option<&mut L> {
        let set = self.set_index(addr);
        self.sets[set].iter_mut().find(|line| line.holds(addr))
    }

    /// The valid line holding `addr`.
    #[must_use]
    pub fn lookup(&self, addr: address) -> Option<&L> {
        self.find(addr).filter(|line| line.is_valid())
    }

    pub fn lookup_mut(&mut self, addr: address) -> Option<&mut L> {
        self.find_mut(addr).filter(|line| line.is_valid())
    }

    /// Marks the line holding `addr` as most recently used.
    pub fn touch(&mut self, addr: address) {
        let Some(way) = self.way(addr) else {
            return;
        };
        let set = self.set_index(addr);
        match self.replacement {
            Replacement::LRU => {
                if let Some(line) = self.sets[set].remove(way) {
                    self.sets[set].push_front(line);
                }
            }
            Replacement::PLRU => {
                let mru = &mut self.mru[set];
                mru.set(way, true);
                if mru.all() {
                    mru.fill(false);
                    mru.set(way, true);
                }
            }
        }
    }

    /// Removes the victim for an incoming line at `addr`.
    ///
    /// A slot already holding `addr` (e.g. an invalidated copy) is always
    /// reused so that no set ever contains an address twice. The returned
    /// line may be invalid or blank.
    pub fn evict(
        &mut self,
        addr: address,
        policy: &mut dyn EvictionPolicy<L>,
    ) -> (Slot, L) {
        let set = self.set_index(addr);
        assert_eq!(
            self.sets[set].len(),
            self.config.associativity,
            "{} set {set} lost its associativity",
            self.level
        );
        let way = self
            .way(addr)
            .unwrap_or_else(|| policy.choose_victim(&self.sets[set], &self.mru[set]));
        let victim = match self.replacement {
            Replacement::LRU => self.sets[set].remove(way),
            Replacement::PLRU => {
                self.mru[set].set(way, false);
                Some(std::mem::replace(
                    &mut self.sets[set][way],
                    self.blank.clone(),
                ))
            }
        };
        let victim = victim.unwrap_or_else(|| panic!("{} set {set} has no way {way}", self.level));
        log::trace!("{}: evict {:?} for {addr}", self.level, victim.addr());
        (Slot { set, way }, victim)
    }

    /// Places `line` into the slot freed by [`Self::evict`].
    pub fn fill(&mut self, slot: Slot, line: L) {
        let addr = line.addr().unwrap_or_else(|| panic!("{}: fill without address", self.level));
        assert_eq!(slot.set, self.set_index(addr));
        assert!(
            self.way(addr).is_none(),
            "{}: duplicate address {addr} in set {}",
            self.level,
            slot.set
        );
        match self.replacement {
            Replacement::LRU => {
                assert_eq!(self.sets[slot.set].len(), self.config.associativity - 1);
                self.sets[slot.set].push_front(line);
            }
            Replacement::PLRU => {
                self.sets[slot.set][slot.way] = line;
                self.touch(addr);
            }
        }
    }

    /// Inserts `line`, returning whatever occupied its slot before.
    pub fn insert(&mut self, line: L, policy: &mut dyn EvictionPolicy<L>) -> L {
        let addr = line.addr().unwrap_or_else(|| panic!("{}: insert without address", self.level));
        let (slot, victim) = self.evict(addr, policy);
        self.fill(slot, line);
        victim
    }

    /// Invalidates the line holding `addr`, returning whether it was valid.
    pub fn invalidate(&mut self, addr: address) -> bool {
        let set = self.set_index(addr);
        let Some(way) = self.way(addr) else {
            return false;
        };
        let line = &mut self.sets[set][way];
        let was_valid = line.is_valid();
        line.invalidate();
        if self.replacement == Replacement::PLRU {
            self.mru[set].set(way, false);
        }
        was_valid
    }

    /// Removes the line holding `addr` and appends a blank line to its set.
    pub fn remove(&mut self, addr: address) -> Option<L> {
        let set = self.set_index(addr);
        let way = self.way(addr)?;
        let removed = match self.replacement {
            Replacement::LRU => {
                let removed = self.sets[set].remove(way);
                self.sets[set].push_back(self.blank.clone());
                removed
            }
            Replacement::PLRU => {
                self.mru[set].set(way, false);
                Some(std::mem::replace(
                    &mut self.sets[set][way],
                    self.blank.clone(),
                ))
            }
        };
        removed
    }
}

impl<L> std::fmt::Display for HierarchicalCache<L>
where
    L: CacheLine,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        use itertools::Itertools;
        writeln!(f, "{} {}", self.level, self.config)?;
        for (i, set) in self.sets.iter().enumerate() {
            let lines = set
                .iter()
                .map(|line| match (line.addr(), line.is_valid()) {
                    (Some(addr), true) => format!("{addr}"),
                    (Some(addr), false) => format!("({addr})"),
                    (None, _) => "-".to_string(),
                })
                .join(", ");
            writeln!(f, "  [{i}] {lines}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::HierarchicalCache;
    use crate::address;
    use crate::cache::{CacheLevel, CacheLine, CleanFirst, Replacement};
    use crate::config;
    use pretty_assertions_sorted as diff;

    #[derive(Debug, Clone, Default)]
    struct Line {
        addr: Option<address>,
        valid: bool,
        written: bool,
    }

    impl Line {
        fn new(addr: address) -> Self {
            Self {
                addr: Some(addr),
                valid: true,
                written: false,
            }
        }
    }

    impl CacheLine for Line {
        fn addr(&self) -> Option<address> {
            self.addr
        }
        fn level(&self) -> CacheLevel {
            CacheLevel::L2
        }
        fn is_valid(&self) -> bool {
            self.valid
        }
        fn is_dirty(&self) -> bool {
            self.written
        }
        fn invalidate(&mut self) {
            self.valid = false;
        }
        fn has_aim_metadata(&self) -> bool {
            false
        }
        fn has_live_metadata(&self, _epochs: &[u32]) -> bool {
            false
        }
    }

    fn cache(replacement: Replacement) -> HierarchicalCache<Line> {
        // 2 sets, 2 ways, 4 byte lines
        HierarchicalCache::new(
            CacheLevel::L2,
            config::Cache::new(16, 4, 2),
            replacement,
            Line::default(),
        )
    }

    fn addrs(cache: &HierarchicalCache<Line>, addr: address) -> Vec<Option<address>> {
        cache.set(addr).iter().map(CacheLine::addr).collect()
    }

    #[test]
    fn lru_evicts_tail() {
        let mut cache = cache(Replacement::LRU);
        let mut policy = Replacement::LRU;
        assert!(cache.insert(Line::new(64), &mut policy).addr.is_none());
        assert!(cache.insert(Line::new(80), &mut policy).addr.is_none());
        diff::assert_eq!(addrs(&cache, 64), vec![Some(80), Some(64)]);

        cache.touch(64);
        let victim = cache.insert(Line::new(96), &mut policy);
        diff::assert_eq!(victim.addr, Some(80));
        diff::assert_eq!(addrs(&cache, 64), vec![Some(96), Some(64)]);
    }

    #[test]
    fn reinsert_reuses_invalid_slot() {
        let mut cache = cache(Replacement::LRU);
        let mut policy = Replacement::LRU;
        let _ = cache.insert(Line::new(64), &mut policy);
        let _ = cache.insert(Line::new(80), &mut policy);
        assert!(cache.invalidate(80));
        assert!(cache.lookup(80).is_none());
        assert!(cache.find(80).is_some());

        // 80 is not the tail, yet its stale slot is reused
        let victim = cache.insert(Line::new(80), &mut policy);
        assert!(!victim.valid);
        diff::assert_eq!(addrs(&cache, 64), vec![Some(80), Some(64)]);
    }

    #[test]
    fn plru_replaces_in_place() {
        let mut cache = cache(Replacement::PLRU);
        let mut policy = Replacement::PLRU;
        let _ = cache.insert(Line::new(64), &mut policy);
        let _ = cache.insert(Line::new(80), &mut policy);
        diff::assert_eq!(addrs(&cache, 64), vec![Some(64), Some(80)]);

        // inserting 80 set all bits, so only its own bit survived the reset
        let victim = cache.insert(Line::new(96), &mut policy);
        diff::assert_eq!(victim.addr, Some(64));
        diff::assert_eq!(addrs(&cache, 64), vec![Some(96), Some(80)]);

        cache.touch(96);
        let victim = cache.insert(Line::new(112), &mut policy);
        diff::assert_eq!(victim.addr, Some(80));
    }

    #[test]
    fn clean_first_skips_written_lines() {
        let mut cache = cache(Replacement::LRU);
        let mut lru = Replacement::LRU;
        let mut written = Line::new(64);
        written.written = true;
        let _ = cache.insert(written, &mut lru);
        let _ = cache.insert(Line::new(80), &mut lru);
        cache.touch(64);
        diff::assert_eq!(addrs(&cache, 64), vec![Some(64), Some(80)]);

        let mut policy = CleanFirst {
            is_written: |line: &Line| line.written,
        };
        cache.touch(80);
        let victim = cache.insert(Line::new(96), &mut policy);
        diff::assert_eq!(victim.addr, Some(80));
    }

    #[test]
    fn remove_keeps_associativity() {
        let mut cache = cache(Replacement::LRU);
        let mut policy = Replacement::LRU;
        let _ = cache.insert(Line::new(64), &mut policy);
        let removed = cache.remove(64);
        diff::assert_eq!(removed.and_then(|line| line.addr), Some(64));
        diff::assert_eq!(cache.set(64).len(), 2);
        diff::assert_eq!(cache.valid_addresses(), Vec::<address>::new());
    }
}
