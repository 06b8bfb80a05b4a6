//! Conflict exceptions on top of MESI coherence.
//!
//! Lines carry the bytes the local core read and wrote in its current
//! region, plus the bytes other cores reported when they handed the line
//! over. An access overlapping a remote access of the other kind is a
//! conflict. Bits of lines that leave the private caches are parked in a
//! global table until the region that produced them ends.

pub mod access;
pub mod commit;
pub mod line;
pub mod verify;

#[cfg(test)]
mod tests;

pub use line::{AccessBits, MesiLine, State};

use crate::access::{Access, Semantics, SyncEvent};
use crate::cache::{CacheLevel, HierarchicalCache, Replacement};
use crate::shared::SharedLevel;
use crate::{address, config, ConflictKind, Simulator};

use indexmap::IndexMap;
use stats::Counter;

/// Access bits of a line that left a core's private caches during `region`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Backup {
    pub local_reads: u64,
    pub local_writes: u64,
    pub supplied: bool,
    pub region: u32,
}

#[derive(Debug, Default, Clone)]
pub struct Region {
    pub has_writes: bool,
    pub has_exceptions: bool,
}

#[derive(Debug, Clone)]
pub struct Processor {
    pub id: usize,
    pub l1: HierarchicalCache<MesiLine>,
    pub l2: HierarchicalCache<MesiLine>,
    pub stats: stats::Processor,
    pub region: Region,
}

impl Processor {
    fn new(id: usize, config: &config::Config) -> Self {
        let replacement = if config.use_plru {
            Replacement::PLRU
        } else {
            Replacement::LRU
        };
        Self {
            id,
            l1: HierarchicalCache::new(
                CacheLevel::L1,
                config.l1,
                replacement,
                MesiLine::blank(CacheLevel::L1),
            ),
            l2: HierarchicalCache::new(
                CacheLevel::L2,
                config.l2,
                replacement,
                MesiLine::blank(CacheLevel::L2),
            ),
            stats: stats::Processor::default(),
            region: Region::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Machine {
    pub config: config::Config,
    pub processors: Vec<Processor>,
    pub shared: SharedLevel<MesiLine>,
    /// Per line and core, bits of lines evicted from L2 while their region was open.
    pub global_table: IndexMap<address, IndexMap<usize, Backup>>,
    events: u64,
}

impl Machine {
    pub fn new(config: config::Config) -> Result<Self, config::Error> {
        config.validate()?;
        let shared = SharedLevel::new(&config, MesiLine::blank(CacheLevel::L3))?;
        let processors = (0..config.num_cores)
            .map(|id| Processor::new(id, &config))
            .collect();
        log::debug!("mesi machine: {config}");
        Ok(Self {
            config,
            processors,
            shared,
            global_table: IndexMap::new(),
            events: 0,
        })
    }

    #[must_use]
    pub fn processor(&self, core: usize) -> &Processor {
        &self.processors[core]
    }

    #[inline]
    #[must_use]
    pub fn epoch(&self, core: usize) -> u32 {
        self.shared.epoch(core)
    }

    /// Reads `size` bytes at `addr` with a regular access.
    pub fn read(&mut self, core: usize, addr: address, size: u32) {
        self.access(Access::read(core, addr, size));
    }

    /// Writes `value` over `size` bytes at `addr` with a regular access.
    pub fn write(&mut self, core: usize, addr: address, size: u32, value: u64) {
        self.access(Access::write(core, addr, size, value));
    }

    /// Ends the current region of `core`.
    pub fn region_end(&mut self, core: usize) {
        self.process_region_boundary(core, SyncEvent::LOCK_RELEASE, Semantics::REG_END);
    }

    /// Live backup of `core` for `addr`.
    #[must_use]
    pub fn backup(&self, core: usize, addr: address) -> Option<&Backup> {
        let epoch = self.epoch(core);
        self.global_table
            .get(&addr)?
            .get(&core)
            .filter(|backup| backup.region == epoch)
    }

    pub(crate) fn count(&mut self, core: usize, counter: Counter) {
        self.processors[core].stats.counters.inc(counter, 1);
    }

    pub(crate) fn handle_conflict(&mut self, core: usize, addr: address, kind: ConflictKind) {
        log::debug!(
            "core {core}: {kind:?} conflict on line {addr} (region {})",
            self.epoch(core)
        );
        let proc = &mut self.processors[core];
        let counters = &mut proc.stats.counters;
        counters.inc(Counter::PreciseConflicts, 1);
        counters.inc(kind.counter(), 1);
        counters.inc(Counter::RegionBodyPreciseConflicts, 1);
        if !proc.region.has_exceptions {
            proc.region.has_exceptions = true;
            counters.inc(Counter::RegionsWithExceptions, 1);
        }
    }

    fn after_event(&mut self) {
        self.events += 1;
        if self.config.verify_every > 0 && self.events % self.config.verify_every == 0 {
            if let Err(violation) = self.verify() {
                panic!("invariant violated after event {}: {violation}", self.events);
            }
        }
    }
}

impl Simulator for Machine {
    fn num_cores(&self) -> usize {
        self.processors.len()
    }

    fn access(&mut self, access: Access) {
        assert!(access.core < self.num_cores(), "no core {}", access.core);
        self.perform_access(access);
        self.after_event();
    }

    fn process_region_boundary(&mut self, core: usize, event: SyncEvent, semantics: Semantics) {
        log::trace!("core {core}: {event:?} {semantics:?}");
        if semantics == Semantics::REG_END {
            self.process_region_end(core);
            self.count(core, Counter::RegionBoundaries);
        }
        self.after_event();
    }

    fn insns_executed(&mut self, core: usize, count: u64) {
        self.processors[core]
            .stats
            .counters
            .inc(Counter::InstructionsExecuted, count as usize);
    }

    fn stats(&self) -> stats::Machine {
        stats::Machine::new(self.processors.iter().map(|p| &p.stats))
    }

    fn verify(&self) -> Result<(), crate::verify::Violation> {
        self.verify_invariants()
    }
}

impl std::fmt::Display for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for proc in &self.processors {
            writeln!(f, "core {} (region {})", proc.id, self.epoch(proc.id))?;
            write!(f, "{}{}", proc.l1, proc.l2)?;
        }
        write!(f, "{}", self.shared.l3)
    }
}
