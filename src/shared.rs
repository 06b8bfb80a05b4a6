use crate::aim::{AimCache, Requester, SharedView};
use crate::cache::{CacheLevel, CacheLine, HierarchicalCache, Replacement};
use crate::{address, config};

use indexmap::IndexMap;

/// Region id every core starts in. Metadata stamped 0 is never live.
pub const REGION_ID_START: u32 = 1;

/// State all cores share: the last level cache, backing memory, the AIM
/// cache and the per-core region ids.
#[derive(Debug, Clone)]
pub struct SharedLevel<L> {
    pub l3: HierarchicalCache<L>,
    /// Lines evicted from the shared cache, including their metadata.
    pub memory: IndexMap<address, L>,
    pub aim: Option<AimCache>,
    pub epochs: Vec<u32>,
}

impl<L> SharedLevel<L>
where
    L: CacheLine,
{
    pub fn new(config: &config::Config, blank: L) -> Result<Self, config::Error> {
        let replacement = if config.use_plru {
            Replacement::PLRU
        } else {
            Replacement::LRU
        };
        let aim = if config.use_aim_cache {
            Some(AimCache::new(
                config.aim,
                config.aim_metadata_line_size()?,
                config.clear_aim_cache_at_region_boundaries,
            ))
        } else {
            None
        };
        Ok(Self {
            l3: HierarchicalCache::new(CacheLevel::L3, config.l3, replacement, blank),
            memory: IndexMap::new(),
            aim,
            epochs: vec![REGION_ID_START; config.num_cores],
        })
    }

    #[must_use]
    pub fn view(&self) -> SharedView<'_, L> {
        SharedView {
            llc: &self.l3,
            memory: &self.memory,
            epochs: &self.epochs,
        }
    }

    #[inline]
    #[must_use]
    pub fn epoch(&self, core: usize) -> u32 {
        self.epochs[core]
    }

    pub fn increment_epoch(&mut self, core: usize) {
        self.epochs[core] += 1;
        log::trace!("core {core} entered region {}", self.epochs[core]);
    }

    /// The authoritative shared copy: the valid LLC line or the memory backup.
    #[must_use]
    pub fn line(&self, addr: address) -> Option<(&L, CacheLevel)> {
        if let Some(line) = self.l3.lookup(addr) {
            return Some((line, CacheLevel::L3));
        }
        self.memory.get(&addr).map(|line| (line, CacheLevel::MEMORY))
    }

    pub fn line_mut(&mut self, addr: address) -> Option<(&mut L, CacheLevel)> {
        if let Some(line) = self.l3.lookup_mut(addr) {
            return Some((line, CacheLevel::L3));
        }
        self.memory
            .get_mut(&addr)
            .map(|line| (line, CacheLevel::MEMORY))
    }

    pub fn aim_request(
        &mut self,
        addr: address,
        has_metadata: bool,
        req: &mut Requester,
    ) -> Option<CacheLevel> {
        let aim = self.aim.as_mut()?;
        let view = SharedView {
            llc: &self.l3,
            memory: &self.memory,
            epochs: &self.epochs,
        };
        Some(aim.request(&view, addr, has_metadata, req))
    }

    pub fn aim_add_line_if_not_present(
        &mut self,
        addr: address,
        has_metadata: bool,
        req: &mut Requester,
    ) {
        if let Some(aim) = self.aim.as_mut() {
            let view = SharedView {
                llc: &self.l3,
                memory: &self.memory,
                epochs: &self.epochs,
            };
            aim.add_line_if_not_present(&view, addr, has_metadata, req);
        }
    }

    pub fn aim_add_line_from_llc_miss(
        &mut self,
        addr: address,
        has_metadata: bool,
        req: &mut Requester,
    ) {
        if let Some(aim) = self.aim.as_mut() {
            let view = SharedView {
                llc: &self.l3,
                memory: &self.memory,
                epochs: &self.epochs,
            };
            aim.add_line_from_llc_miss(&view, addr, has_metadata, req);
        }
    }

    pub fn aim_evict_line(&mut self, addr: address, has_metadata: bool, req: &mut Requester) {
        if let Some(aim) = self.aim.as_mut() {
            aim.evict_line(addr, has_metadata, req);
        }
    }

    pub fn clear_aim_cache(&mut self) {
        if let Some(aim) = self.aim.as_mut() {
            let view = SharedView {
                llc: &self.l3,
                memory: &self.memory,
                epochs: &self.epochs,
            };
            aim.clear_aim_cache(&view);
        }
    }

    pub fn clear_aim_cache2(&mut self) {
        if let Some(aim) = self.aim.as_mut() {
            let view = SharedView {
                llc: &self.l3,
                memory: &self.memory,
                epochs: &self.epochs,
            };
            aim.clear_aim_cache2(&view);
        }
    }

    /// Checks that every AIM entry shadows a valid LLC line and that no AIM
    /// set lost capacity or holds an address twice.
    pub fn verify_aim(&self) -> Result<(), crate::verify::Violation> {
        use crate::verify::Violation;
        let Some(aim) = &self.aim else {
            return Ok(());
        };
        for (set_idx, set) in aim.sets().enumerate() {
            if set.len() != aim.config.associativity {
                return Err(Violation::Associativity {
                    level: "AIM",
                    set: set_idx,
                    len: set.len(),
                });
            }
            let mut seen = std::collections::HashSet::new();
            for addr in set.iter().filter_map(|line| line.addr) {
                if !seen.insert(addr) {
                    return Err(Violation::DuplicateTag {
                        level: "AIM".to_string(),
                        set: set_idx,
                        addr,
                    });
                }
                if self.l3.lookup(addr).is_none() {
                    return Err(Violation::AimNotInLlc { addr });
                }
            }
        }
        Ok(())
    }
}
