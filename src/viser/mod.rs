//! Region conflict detection on versioned, per-byte metadata lines.
//!
//! Each core runs synchronization free regions. Writes stay private until
//! the region ends, when the core checks its writes against concurrently
//! open regions of the other cores (pre-commit), validates the values it
//! read (read validation) and publishes its writes while self-invalidating
//! lines that may have gone stale (post-commit).

pub mod access;
pub mod commit;
pub mod line;
pub mod verify;


pub use line::{PerCore, State, ViserLine};

use crate::access::{Access, Semantics, SyncEvent};
use crate::bloom::BloomFilter;
use crate::cache::{CacheLevel, HierarchicalCache, Replacement};
use crate::shared::SharedLevel;
use crate::{address, config, ConflictKind, Simulator};

use indexmap::IndexSet;
use stats::Counter;

/// Region flags and scratch sets, reset at every region end.
#[derive(Debug, Default, Clone)]
pub struct Region {
    pub has_writes: bool,
    pub has_dirty_eviction: bool,
    pub has_exceptions: bool,
    pub has_failed_validation: bool,
    /// Lines written in this region that left the private caches before it ended.
    pub evicted_written: IndexSet<address>,
}

#[derive(Debug, Clone)]
pub struct Processor {
    pub id: usize,
    pub l1: HierarchicalCache<ViserLine>,
    pub l2: HierarchicalCache<ViserLine>,
    pub stats: stats::Processor,
    /// Lines written by other cores since this core's last region end.
    pub bloom: Option<BloomFilter>,
    pub region: Region,
}

impl Processor {
    fn new(id: usize, config: &config::Config) -> Self {
        let replacement = if config.use_plru {
            Replacement::PLRU
        } else {
            Replacement::LRU
        };
        let blank = |level| ViserLine::blank(level, config.line_size(), config.num_cores);
        let bloom = config
            .use_bloom_filter
            .then(|| BloomFilter::new(config.bloom_filter_bits, config.bloom_filter_hashes));
        Self {
            id,
            l1: HierarchicalCache::new(CacheLevel::L1, config.l1, replacement, blank(CacheLevel::L1)),
            l2: HierarchicalCache::new(CacheLevel::L2, config.l2, replacement, blank(CacheLevel::L2)),
            stats: stats::Processor::default(),
            bloom,
            region: Region::default(),
        }
    }
}

/// Phase a precise conflict was detected in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    RegionBody,
    PreCommit,
    ReadValidation,
}

#[derive(Debug, Clone)]
pub struct Machine {
    pub config: config::Config,
    pub processors: Vec<Processor>,
    pub shared: SharedLevel<ViserLine>,
    /// Region ids of every core at the last memory scavenge.
    scavenge_map: Vec<u32>,
    events: u64,
}

impl Machine {
    pub fn new(config: config::Config) -> Result<Self, config::Error> {
        config.validate()?;
        let blank = ViserLine::blank(CacheLevel::L3, config.line_size(), config.num_cores);
        let shared = SharedLevel::new(&config, blank)?;
        let processors = (0..config.num_cores)
            .map(|id| Processor::new(id, &config))
            .collect();
        log::debug!("viser machine: {config}");
        Ok(Self {
            scavenge_map: shared.epochs.clone(),
            config,
            processors,
            shared,
            events: 0,
        })
    }

    #[inline]
    #[must_use]
    pub fn num_cores(&self) -> usize {
        self.processors.len()
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

    pub fn increment_epoch(&mut self, core: usize) {
        self.shared.increment_epoch(core);
    }

    #[inline]
    fn line_size(&self) -> u32 {
        self.config.line_size()
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

    pub(crate) fn count(&mut self, core: usize, counter: Counter) {
        self.processors[core].stats.counters.inc(counter, 1);
    }

    /// Records a precise conflict found by `core`.
    pub(crate) fn handle_conflict(
        &mut self,
        core: usize,
        addr: address,
        phase: Phase,
        kind: ConflictKind,
    ) {
        log::debug!(
            "core {core}: {kind:?} conflict on line {addr} during {phase:?} (region {})",
            self.epoch(core)
        );
        let proc = &mut self.processors[core];
        let counters = &mut proc.stats.counters;
        counters.inc(Counter::PreciseConflicts, 1);
        counters.inc(kind.counter(), 1);
        counters.inc(
            match phase {
                Phase::RegionBody => Counter::RegionBodyPreciseConflicts,
                Phase::PreCommit => Counter::PreCommitPreciseConflicts,
                Phase::ReadValidation => Counter::ReadValidationPreciseConflicts,
            },
            1,
        );
        if !proc.region.has_exceptions {
            proc.region.has_exceptions = true;
            counters.inc(Counter::RegionsWithExceptions, 1);
        }
    }

    /// Drops memory lines no core can still need.
    ///
    /// Only runs once memory outgrew the threshold and every core finished at
    /// least one full region since the last scavenge. A line survives while
    /// any core's metadata on it is from that core's current region, or while
    /// any core holds it valid in L2.
    pub fn scavenge_memory(&mut self, core: usize) {
        if self.shared.memory.len() <= self.config.scavenge_threshold {
            return;
        }
        let epochs = &self.shared.epochs;
        let ready = self
            .scavenge_map
            .iter()
            .zip(epochs)
            .all(|(&last, &epoch)| last + 1 < epoch);
        if !ready {
            return;
        }
        let before = self.shared.memory.len();
        let processors = &self.processors;
        self.shared.memory.retain(|addr, line| {
            let live = (0..epochs.len()).any(|c| line.md(c).epoch == epochs[c]);
            live || processors.iter().any(|p| p.l2.lookup(*addr).is_some())
        });
        let removed = before - self.shared.memory.len();
        self.scavenge_map.clone_from(&self.shared.epochs);
        log::debug!("scavenged {removed} of {before} memory lines");
        let counters = &mut self.processors[core].stats.counters;
        counters.inc(Counter::NumScavenges, 1);
        counters.inc(Counter::ScavengedLines, removed);
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
        match semantics {
            Semantics::REG_BEGIN => {}
            Semantics::REG_END => {
                self.process_region_end(core);
                self.count(core, Counter::RegionBoundaries);
            }
        }
        self.scavenge_memory(core);
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
