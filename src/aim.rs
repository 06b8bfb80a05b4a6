//! Approximate information metadata (AIM) cache.
//!
//! A small tag-only shadow of the shared cache that remembers whether a
//! line carries per-core conflict metadata. The real metadata lives with the
//! line in the shared cache or memory, the AIM only decides whether an access
//! has to pay for fetching it. Treating "no metadata" as the safe default
//! means a dropped entry can cost an extra miss but never hides a conflict.

use crate::cache::{CacheLevel, CacheLine, HierarchicalCache};
use crate::{address, config};

use indexmap::IndexMap;
use stats::{AccessKind, Event};
use std::collections::VecDeque;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct AimLine {
    pub addr: Option<address>,
    pub has_metadata: bool,
}

impl AimLine {
    fn new(addr: address, has_metadata: bool) -> Self {
        Self {
            addr: Some(addr),
            has_metadata,
        }
    }
}

/// What the AIM cache can observe about the shared level.
pub trait SharedMetadata {
    /// `Some(has_aim_metadata)` if the shared cache holds a valid copy.
    fn llc(&self, addr: address) -> Option<bool>;

    /// Metadata flag of the shared copy, looking at memory if the shared cache misses.
    fn shared(&self, addr: address) -> bool;

    /// Whether any core has live offsets on the shared cache copy.
    fn has_live_offsets(&self, addr: address) -> bool;
}

/// Read-only view of the shared cache and backing memory.
pub struct SharedView<'a, L> {
    pub llc: &'a HierarchicalCache<L>,
    pub memory: &'a IndexMap<address, L>,
    pub epochs: &'a [u32],
}

impl<L> SharedMetadata for SharedView<'_, L>
where
    L: CacheLine,
{
    fn llc(&self, addr: address) -> Option<bool> {
        self.llc.lookup(addr).map(CacheLine::has_aim_metadata)
    }

    fn shared(&self, addr: address) -> bool {
        self.llc(addr)
            .or_else(|| self.memory.get(&addr).map(CacheLine::has_aim_metadata))
            .unwrap_or(false)
    }

    fn has_live_offsets(&self, addr: address) -> bool {
        self.llc
            .lookup(addr)
            .is_some_and(|line| line.has_live_metadata(self.epochs))
    }
}

/// Who is charged for AIM traffic.
pub struct Requester<'a> {
    pub stats: &'a mut stats::Cache,
    pub kind: AccessKind,
    pub is_read: bool,
}

impl Requester<'_> {
    fn hit(&mut self) {
        self.stats.inc(self.kind, Event::hit(self.is_read), 1);
    }

    fn miss(&mut self) {
        self.stats.inc(self.kind, Event::miss(self.is_read), 1);
    }

    fn eviction(&mut self) {
        self.stats.inc(self.kind, Event::LineEviction, 1);
        self.stats.inc(self.kind, Event::DirtyLineEviction, 1);
    }
}

/// Whose metadata decides if replacing an AIM entry is charged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Charge {
    Victim,
    Incoming,
}

#[derive(Debug, Clone)]
pub struct AimCache {
    pub config: config::Aim,
    /// Bytes of metadata one entry stands in for.
    pub metadata_line_size: usize,
    clear_at_region_boundaries: bool,
    sets: Vec<VecDeque<AimLine>>,
}

impl AimCache {
    #[must_use]
    pub fn new(
        config: config::Aim,
        metadata_line_size: usize,
        clear_at_region_boundaries: bool,
    ) -> Self {
        let sets = (0..config.num_sets())
            .map(|_| std::iter::repeat(AimLine::default()).take(config.associativity).collect())
            .collect();
        Self {
            config,
            metadata_line_size,
            clear_at_region_boundaries,
            sets,
        }
    }

    #[inline]
    fn set_index(&self, addr: address) -> usize {
        self.config.set_index(addr)
    }

    #[must_use]
    pub fn get(&self, addr: address) -> Option<&AimLine> {
        self.sets[self.set_index(addr)]
            .iter()
            .find(|line| line.addr == Some(addr))
    }

    pub fn lines(&self) -> impl Iterator<Item = &AimLine> + '_ {
        self.sets.iter().flatten()
    }

    pub fn sets(&self) -> impl Iterator<Item = &VecDeque<AimLine>> + '_ {
        self.sets.iter()
    }

    /// Prefers an empty slot, then an entry whose shared line is gone or has
    /// no metadata, then the LRU tail.
    fn victim(&self, shared: &impl SharedMetadata, set: usize) -> usize {
        let set = &self.sets[set];
        let tail = set.len() - 1;
        if self.clear_at_region_boundaries || set[tail].addr.is_none() {
            return tail;
        }
        set.iter()
            .position(|line| match line.addr {
                None => true,
                Some(addr) => shared.llc(addr) != Some(true),
            })
            .unwrap_or(tail)
    }

    /// Inserts a new entry at the MRU position.
    ///
    /// Replacing an entry is charged by `charge`: either by the metadata of
    /// the victim's shared line or by that of the incoming line.
    fn insert(
        &mut self,
        shared: &impl SharedMetadata,
        addr: address,
        has_metadata: bool,
        charge: Charge,
        req: &mut Requester,
    ) {
        let set = self.set_index(addr);
        let way = self.victim(shared, set);
        let Some(victim) = self.sets[set].remove(way) else {
            unreachable!("AIM set {set} has no way {way}");
        };
        if let Some(victim_addr) = victim.addr {
            let charged = match charge {
                Charge::Victim => shared.llc(victim_addr) == Some(true),
                Charge::Incoming => has_metadata,
            };
            if charged {
                log::trace!("AIM: evict {victim_addr} with metadata for {addr}");
                req.eviction();
            }
        }
        self.sets[set].push_front(AimLine::new(addr, has_metadata));
        if has_metadata {
            req.miss();
        }
    }

    /// Looks up the entry for a shared cache line being accessed.
    ///
    /// Missing the AIM only costs a metadata fetch when the line actually has
    /// metadata, otherwise the access is treated as a hit and nothing is cached.
    pub fn request(
        &mut self,
        shared: &impl SharedMetadata,
        addr: address,
        has_metadata: bool,
        req: &mut Requester,
    ) -> CacheLevel {
        let set = self.set_index(addr);
        assert_eq!(self.sets[set].len(), self.config.associativity);
        if let Some(line) = self.sets[set].iter_mut().find(|line| line.addr == Some(addr)) {
            line.has_metadata = has_metadata;
            req.hit();
            return CacheLevel::L3;
        }
        if !shared.shared(addr) {
            req.hit();
            return CacheLevel::L3;
        }
        req.miss();
        let way = self.victim(shared, set);
        let Some(victim) = self.sets[set].remove(way) else {
            unreachable!("AIM set {set} has no way {way}");
        };
        if let Some(victim_addr) = victim.addr {
            if shared.llc(victim_addr) == Some(true) {
                req.eviction();
            }
        }
        self.sets[set].push_front(AimLine::new(addr, has_metadata));
        CacheLevel::MEMORY
    }

    /// Drops the entry of a line leaving the shared cache.
    pub fn evict_line(&mut self, addr: address, llc_has_metadata: bool, req: &mut Requester) {
        let set = self.set_index(addr);
        let Some(way) = self.sets[set].iter().position(|line| line.addr == Some(addr)) else {
            return;
        };
        self.sets[set].remove(way);
        self.sets[set].push_back(AimLine::default());
        if llc_has_metadata {
            req.eviction();
        }
    }

    /// Adds an entry for a line the shared cache just fetched from memory.
    ///
    /// Replacing an entry costs a metadata write-back only if the fetched
    /// line carries metadata.
    pub fn add_line_from_llc_miss(
        &mut self,
        shared: &impl SharedMetadata,
        addr: address,
        has_metadata: bool,
        req: &mut Requester,
    ) {
        self.insert(shared, addr, has_metadata, Charge::Incoming, req);
    }

    pub fn add_line_without_checking_for_duplicates(
        &mut self,
        shared: &impl SharedMetadata,
        addr: address,
        has_metadata: bool,
        req: &mut Requester,
    ) {
        assert!(self.get(addr).is_none(), "AIM already holds {addr}");
        self.insert(shared, addr, has_metadata, Charge::Victim, req);
    }

    /// Records metadata written back into the shared cache.
    pub fn add_line_if_not_present(
        &mut self,
        shared: &impl SharedMetadata,
        addr: address,
        has_metadata: bool,
        req: &mut Requester,
    ) {
        let set = self.set_index(addr);
        if let Some(line) = self.sets[set].iter_mut().find(|line| line.addr == Some(addr)) {
            if has_metadata {
                line.has_metadata = true;
                req.hit();
            }
            return;
        }
        self.add_line_without_checking_for_duplicates(shared, addr, has_metadata, req);
    }

    /// Rebuilds every set keeping only entries whose shared line still has
    /// live offsets. Freed ways become blank entries at the LRU end.
    pub fn clear_aim_cache(&mut self, shared: &impl SharedMetadata) {
        let assoc = self.config.associativity;
        for set in &mut self.sets {
            let mut rebuilt: VecDeque<AimLine> = set
                .iter()
                .filter_map(|line| match line.addr {
                    None => Some(AimLine::default()),
                    Some(addr) if shared.has_live_offsets(addr) => {
                        Some(AimLine::new(addr, shared.llc(addr).unwrap_or(false)))
                    }
                    Some(_) => None,
                })
                .collect();
            rebuilt.resize(assoc, AimLine::default());
            *set = rebuilt;
        }
    }

    /// Removes entries without live offsets in place.
    pub fn clear_aim_cache2(&mut self, shared: &impl SharedMetadata) {
        let assoc = self.config.associativity;
        for set in &mut self.sets {
            set.retain(|line| match line.addr {
                None => true,
                Some(addr) => shared.has_live_offsets(addr),
            });
            set.resize(assoc, AimLine::default());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AimCache, Requester, SharedMetadata};
    use crate::address;
    use crate::cache::CacheLevel;
    use crate::config;
    use pretty_assertions_sorted as diff;
    use stats::{AccessKind, Event};
    use std::collections::{HashMap, HashSet};

    /// Shared level stub: address -> has metadata, plus lines in memory only.
    #[derive(Default)]
    struct Shared {
        llc: HashMap<address, bool>,
        memory: HashMap<address, bool>,
        live: HashSet<address>,
    }

    impl SharedMetadata for Shared {
        fn llc(&self, addr: address) -> Option<bool> {
            self.llc.get(&addr).copied()
        }
        fn shared(&self, addr: address) -> bool {
            self.llc(addr)
                .or_else(|| self.memory.get(&addr).copied())
                .unwrap_or(false)
        }
        fn has_live_offsets(&self, addr: address) -> bool {
            self.live.contains(&addr)
        }
    }

    fn aim() -> AimCache {
        let config = config::Aim {
            num_lines: 16,
            associativity: 2,
            line_size: 64,
        };
        AimCache::new(config, 20, false)
    }

    fn write<'a>(stats: &'a mut stats::Cache) -> Requester<'a> {
        Requester {
            stats,
            kind: AccessKind::Regular,
            is_read: false,
        }
    }

    #[test]
    fn miss_without_metadata_is_free() {
        let mut aim = aim();
        let mut stats = stats::Cache::default();
        let shared = Shared {
            llc: HashMap::from([(64, false)]),
            ..Shared::default()
        };
        let level = aim.request(&shared, 64, false, &mut write(&mut stats));
        diff::assert_eq!(level, CacheLevel::L3);
        diff::assert_eq!(stats.get(Event::WriteMiss), 0);
        diff::assert_eq!(stats.get(Event::WriteHit), 1);
        assert!(aim.get(64).is_none());
    }

    #[test]
    fn prefers_victims_without_metadata() {
        let mut aim = aim();
        let mut stats = stats::Cache::default();
        // 64, 80, 96 share AIM set 1
        let mut shared = Shared::default();
        shared.llc.insert(64, true);
        aim.add_line_from_llc_miss(&shared, 64, true, &mut write(&mut stats));
        shared.llc.insert(80, false);
        aim.add_line_from_llc_miss(&shared, 80, false, &mut write(&mut stats));
        diff::assert_eq!(stats.get(Event::WriteMiss), 1);

        shared.llc.insert(96, false);
        aim.add_line_from_llc_miss(&shared, 96, false, &mut write(&mut stats));
        assert!(aim.get(80).is_none());
        assert!(aim.get(64).is_some());
        diff::assert_eq!(stats.get(Event::LineEviction), 0);

        // both remaining entries now have metadata, the tail has to go
        shared.llc.insert(96, true);
        shared.llc.insert(112, true);
        aim.add_line_if_not_present(&shared, 96, true, &mut write(&mut stats));
        aim.add_line_from_llc_miss(&shared, 112, true, &mut write(&mut stats));
        assert!(aim.get(64).is_none());
        diff::assert_eq!(stats.get(Event::LineEviction), 1);
        diff::assert_eq!(stats.get(Event::DirtyLineEviction), 1);
        diff::assert_eq!(stats.get(Event::WriteMiss), 2);
    }

    #[test]
    fn llc_miss_charges_by_incoming_metadata() {
        let mut aim = aim();
        let mut stats = stats::Cache::default();
        let mut shared = Shared {
            llc: HashMap::from([(64, true), (80, true), (96, false)]),
            ..Shared::default()
        };
        aim.add_line_from_llc_miss(&shared, 64, true, &mut write(&mut stats));
        aim.add_line_from_llc_miss(&shared, 80, true, &mut write(&mut stats));

        // the victim has metadata but the fetched line has none
        aim.add_line_from_llc_miss(&shared, 96, false, &mut write(&mut stats));
        assert!(aim.get(64).is_none());
        diff::assert_eq!(stats.get(Event::LineEviction), 0);

        // write-backs are charged by the victim instead
        shared.llc.insert(96, true);
        shared.llc.insert(112, false);
        aim.add_line_if_not_present(&shared, 112, false, &mut write(&mut stats));
        assert!(aim.get(80).is_none());
        diff::assert_eq!(stats.get(Event::LineEviction), 1);
    }

    #[test]
    fn request_miss_with_metadata_inserts() {
        let mut aim = aim();
        let mut stats = stats::Cache::default();
        let shared = Shared {
            llc: HashMap::from([(128, true)]),
            ..Shared::default()
        };
        let level = aim.request(&shared, 128, true, &mut write(&mut stats));
        diff::assert_eq!(level, CacheLevel::MEMORY);
        diff::assert_eq!(stats.get(Event::WriteMiss), 1);
        assert!(aim.get(128).is_some_and(|line| line.has_metadata));

        let level = aim.request(&shared, 128, true, &mut write(&mut stats));
        diff::assert_eq!(level, CacheLevel::L3);
        diff::assert_eq!(stats.get(Event::WriteHit), 1);
    }

    #[test]
    #[should_panic(expected = "AIM already holds")]
    fn duplicate_insert_is_fatal() {
        let mut aim = aim();
        let mut stats = stats::Cache::default();
        let shared = Shared {
            llc: HashMap::from([(64, true)]),
            ..Shared::default()
        };
        aim.add_line_without_checking_for_duplicates(&shared, 64, true, &mut write(&mut stats));
        aim.add_line_without_checking_for_duplicates(&shared, 64, true, &mut write(&mut stats));
    }

    #[test]
    fn evict_line_charges_only_with_metadata() {
        let mut aim = aim();
        let mut stats = stats::Cache::default();
        let shared = Shared {
            llc: HashMap::from([(64, false), (80, true)]),
            ..Shared::default()
        };
        aim.add_line_from_llc_miss(&shared, 64, false, &mut write(&mut stats));
        aim.add_line_from_llc_miss(&shared, 80, true, &mut write(&mut stats));
        aim.evict_line(64, false, &mut write(&mut stats));
        diff::assert_eq!(stats.get(Event::LineEviction), 0);
        aim.evict_line(80, true, &mut write(&mut stats));
        diff::assert_eq!(stats.get(Event::LineEviction), 1);
        assert!(aim.lines().all(|line| line.addr.is_none()));
        assert!(aim.sets().all(|set| set.len() == 2));
    }

    #[test]
    fn clearing_keeps_live_entries_and_capacity() {
        let mut aim = aim();
        let mut stats = stats::Cache::default();
        let mut shared = Shared {
            llc: HashMap::from([(64, true), (80, true)]),
            ..Shared::default()
        };
        aim.add_line_from_llc_miss(&shared, 64, true, &mut write(&mut stats));
        aim.add_line_from_llc_miss(&shared, 80, true, &mut write(&mut stats));
        shared.live.insert(80);

        let mut cleared = aim.clone();
        cleared.clear_aim_cache(&shared);
        assert!(cleared.get(64).is_none());
        assert!(cleared.get(80).is_some());
        assert!(cleared.sets().all(|set| set.len() == 2));

        aim.clear_aim_cache2(&shared);
        assert!(aim.get(64).is_none());
        assert!(aim.get(80).is_some());
        assert!(aim.sets().all(|set| set.len() == 2));
    }
}
