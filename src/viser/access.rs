use super::{line::State, Machine, ViserLine};
use crate::access::{Access, AccessType, LineAccess};
use crate::aim::Requester;
use crate::address;
use crate::cache::{CacheLevel, CacheLine, CleanFirst, EvictionPolicy, Replacement};

use stats::{Counter, Event};

impl Machine {
    /// Splits an access into line accesses and runs each through the private caches.
    pub(crate) fn perform_access(&mut self, access: Access) {
        let core = access.core;
        let access = access.normalize(&self.config);
        let kind = access.kind;
        log::trace!(
            "core {core}: {kind:?} {} bytes at {} (region {})",
            access.size,
            access.addr,
            self.epoch(core)
        );

        self.count(core, Counter::TotalMemoryAccesses);
        self.count(core, kind.total_counter());

        for line_access in access.split(self.line_size()) {
            match kind {
                AccessType::MEMORY_READ => self.read_line(core, &line_access),
                AccessType::MEMORY_WRITE => self.write_line(core, &line_access),
                kind if kind.is_read() => {
                    self.request(core, line_access.line_addr, kind);
                }
                kind => self.sync_write_line(core, &line_access, kind),
            }
        }
    }

    fn read_line(&mut self, core: usize, access: &LineAccess) {
        let epoch = self.epoch(core);
        let addr = access.line_addr;
        self.request(core, addr, AccessType::MEMORY_READ);
        let Some(line) = self.processors[core].l1.lookup_mut(addr) else {
            panic!("core {core}: line {addr} missing from L1 after request");
        };
        let md = line.md_mut(core, epoch);
        md.read |= access.encoding() & !md.write;
    }

    fn write_line(&mut self, core: usize, access: &LineAccess) {
        let epoch = self.epoch(core);
        let addr = access.line_addr;
        let enc = access.encoding();
        self.request(core, addr, AccessType::MEMORY_WRITE);

        let proc = &mut self.processors[core];
        let Some(line) = proc.l1.lookup_mut(addr) else {
            panic!("core {core}: line {addr} missing from L1 after request");
        };
        let md = line.live_md(core, epoch);
        let read_only = md.read & !md.write & enc;
        if read_only != 0 {
            // write after read: L2 keeps the bytes that were actually read
            let Some(l2) = proc.l2.lookup_mut(addr) else {
                panic!("core {core}: L1 line {addr} has no L2 line");
            };
            l2.md_mut(core, epoch).read |= read_only;
            l2.backup_from(line, read_only);
            line.md_mut(core, epoch).read &= !read_only;
            proc.stats.counters.inc(Counter::ViserWARUpgrades, 1);
        }
        line.md_mut(core, epoch).write |= enc;
        line.write_bytes(access.offset, &access.bytes);
        line.dirty = true;
        proc.region.has_writes = true;
    }

    /// Lock and atomic writes bypass conflict detection and become visible
    /// in the shared copy right away.
    fn sync_write_line(&mut self, core: usize, access: &LineAccess, kind: AccessType) {
        let addr = access.line_addr;
        self.request(core, addr, kind);
        self.fetch_deferred_from_others(core, addr);

        let Some((shared, _)) = self.shared.line_mut(addr) else {
            panic!("core {core}: no shared copy of {kind:?} line {addr}");
        };
        shared.write_bytes(access.offset, &access.bytes);
        shared.dirty = true;
        let previous_owner = shared.lock_owner.replace(core);

        let proc = &mut self.processors[core];
        for line in [proc.l1.lookup_mut(addr), proc.l2.lookup_mut(addr)]
            .into_iter()
            .flatten()
        {
            line.write_bytes(access.offset, &access.bytes);
            line.lock_owner = Some(core);
        }

        if let Some(previous) = previous_owner.filter(|&previous| previous != core) {
            log::trace!("{kind:?} on {addr} moves ownership from core {previous} to {core}");
            self.flush_private(previous, addr);
            self.count(core, Counter::LockOwnershipTransfers);
        }
    }

    /// Brings `addr` into L1 (and L2) of `core`, returning the level it hit in.
    pub(crate) fn request(&mut self, core: usize, addr: address, kind: AccessType) -> CacheLevel {
        let is_read = kind.is_read();
        let stats_kind = kind.stats_kind();
        if self.config.use_special_invalid_state {
            self.revalidate_tentative(core, addr);
        }

        let proc = &mut self.processors[core];
        if proc.l1.lookup(addr).is_some() {
            proc.l1.touch(addr);
            proc.l2.touch(addr);
            proc.stats.l1.inc(stats_kind, Event::hit(is_read), 1);
            return CacheLevel::L1;
        }
        proc.stats.l1.inc(stats_kind, Event::miss(is_read), 1);

        let level = if proc.l2.lookup(addr).is_some() {
            proc.l2.touch(addr);
            proc.stats.l2.inc(stats_kind, Event::hit(is_read), 1);
            CacheLevel::L2
        } else {
            proc.stats.l2.inc(stats_kind, Event::miss(is_read), 1);
            self.fill_l2(core, addr, kind)
        };
        self.fill_l1(core, addr);
        level
    }

    /// Evicts the L2 victim for `addr`, then fetches the line from the shared level.
    fn fill_l2(&mut self, core: usize, addr: address, kind: AccessType) -> CacheLevel {
        let epoch = self.epoch(core);
        let proc = &mut self.processors[core];
        let clean_first = self.config.evict_clean_line_first
            && !proc.region.has_dirty_eviction
            && proc.l2.replacement == Replacement::LRU;
        let (slot, victim) = if clean_first {
            let l1 = &proc.l1;
            let mut policy = CleanFirst {
                is_written: |line: &ViserLine| {
                    line.has_written_offsets(core, epoch)
                        || line
                            .addr()
                            .and_then(|addr| l1.lookup(addr))
                            .is_some_and(|l1| l1.has_written_offsets(core, epoch))
                },
            };
            proc.l2.evict(addr, &mut policy)
        } else {
            let mut policy = proc.l2.replacement;
            proc.l2.evict(addr, &mut policy as &mut dyn EvictionPolicy<ViserLine>)
        };
        if victim.is_valid() {
            self.write_back_l2_victim(core, victim);
        }

        let level = self.fetch_shared(core, addr, kind);
        let Some((shared, _)) = self.shared.line(addr) else {
            panic!("core {core}: shared level lost line {addr}");
        };
        let copy = shared.private_copy(
            core,
            epoch,
            !self.config.ignore_fetching_read_bits,
            !self.config.ignore_fetching_write_bits,
        );
        self.processors[core].l2.fill(slot, copy);
        level
    }

    /// Copies the L2 line into L1, folding a valid L1 victim back into L2.
    fn fill_l1(&mut self, core: usize, addr: address) {
        let epoch = self.epoch(core);
        let proc = &mut self.processors[core];
        let Some(l2) = proc.l2.lookup(addr) else {
            panic!("core {core}: filling L1 with {addr} which is not in L2");
        };
        let mut copy = l2.clone();
        copy.set_level(CacheLevel::L1);
        copy.backup = 0;

        let mut policy = proc.l1.replacement;
        let victim = proc.l1.insert(copy, &mut policy as &mut dyn EvictionPolicy<ViserLine>);
        if !victim.is_valid() {
            return;
        }
        let Some(victim_addr) = victim.addr() else {
            return;
        };
        proc.stats.l1.inc(stats::AccessKind::Regular, Event::LineEviction, 1);
        if victim.is_dirty() {
            proc.stats.l1.inc(stats::AccessKind::Regular, Event::DirtyLineEviction, 1);
        }
        let Some(l2) = proc.l2.lookup_mut(victim_addr) else {
            panic!("core {core}: L1 victim {victim_addr} has no L2 line");
        };
        l2.merge_from_l1(&victim, core, epoch);
    }

    /// Removes a valid L2 line, folding in its L1 copy and writing back to the shared level.
    fn write_back_l2_victim(&mut self, core: usize, mut victim: ViserLine) {
        let epoch = self.epoch(core);
        let Some(addr) = victim.addr() else {
            return;
        };
        let proc = &mut self.processors[core];
        if let Some(l1) = proc.l1.lookup(addr) {
            victim.merge_from_l1(l1, core, epoch);
        }
        proc.l1.invalidate(addr);

        proc.stats.l2.inc(stats::AccessKind::Regular, Event::LineEviction, 1);
        if victim.is_dirty() {
            proc.stats.l2.inc(stats::AccessKind::Regular, Event::DirtyLineEviction, 1);
        }
        if victim.has_written_offsets(core, epoch) && !proc.region.has_dirty_eviction {
            proc.region.has_dirty_eviction = true;
            proc.stats.counters.inc(Counter::RegionHasDirtyEviction, 1);
        }
        self.write_back_private(core, &victim);
    }

    /// Writes back and invalidates `core`'s private copy of `addr`, if any.
    pub(crate) fn flush_private(&mut self, core: usize, addr: address) {
        let proc = &mut self.processors[core];
        let Some(line) = proc.l2.lookup(addr).cloned() else {
            return;
        };
        proc.l2.invalidate(addr);
        self.write_back_l2_victim(core, line);
    }

    /// Merges a private line leaving `core`'s caches into the shared copy.
    pub(crate) fn write_back_private(&mut self, core: usize, line: &ViserLine) {
        let epoch = self.epoch(core);
        let Some(addr) = line.addr() else {
            return;
        };
        let Some((shared, level)) = self.shared.line_mut(addr) else {
            panic!("core {core}: no shared copy of evicted line {addr}");
        };
        if shared.deferred_owner == Some(core) {
            shared.copy_values(line, line.full_mask());
            shared.dirty = true;
            shared.deferred_owner = None;
            self.processors[core]
                .stats
                .counters
                .inc(Counter::DeferredWriteBacks, 1);
        }

        let md = line.live_md(core, epoch);
        let has_md = !md.is_empty();
        if has_md {
            let shared_md = shared.md_mut(core, epoch);
            shared_md.read |= md.read & !md.write;
            shared_md.write |= md.write;
            if md.write != 0 {
                shared.copy_values(line, md.write);
                shared.set_last_writer(md.write, core);
                shared.dirty = true;
                self.processors[core].region.evicted_written.insert(addr);
            }
            shared.has_aim_md = true;
        }

        if level == CacheLevel::L3 {
            if has_md {
                self.shared.aim_add_line_if_not_present(
                    addr,
                    true,
                    &mut Requester {
                        stats: &mut self.processors[core].stats.aim,
                        kind: stats::AccessKind::Regular,
                        is_read: false,
                    },
                );
            }
            self.shared.l3.touch(addr);
        }
    }

    /// Makes `addr` resident in the shared cache, fetching it from memory on a miss.
    fn fetch_shared(&mut self, core: usize, addr: address, kind: AccessType) -> CacheLevel {
        let is_read = kind.is_read();
        let stats_kind = kind.stats_kind();
        let level = if self.shared.l3.lookup(addr).is_some() {
            self.shared.l3.touch(addr);
            self.processors[core]
                .stats
                .l3
                .inc(stats_kind, Event::hit(is_read), 1);
            CacheLevel::L3
        } else {
            self.processors[core]
                .stats
                .l3
                .inc(stats_kind, Event::miss(is_read), 1);
            self.fill_llc(core, addr, kind);
            CacheLevel::MEMORY
        };

        self.fetch_deferred_from_others(core, addr);

        if level == CacheLevel::L3 && kind.is_regular() {
            let has_md = self
                .shared
                .l3
                .lookup(addr)
                .is_some_and(CacheLine::has_aim_metadata);
            let _ = self.shared.aim_request(
                addr,
                has_md,
                &mut Requester {
                    stats: &mut self.processors[core].stats.aim,
                    kind: stats_kind,
                    is_read,
                },
            );
        }
        level
    }

    /// Moves a line from memory into the shared cache.
    ///
    /// A line lives either in the shared cache or in memory, never in both.
    fn fill_llc(&mut self, core: usize, addr: address, kind: AccessType) {
        let mut line = self.shared.memory.shift_remove(&addr).unwrap_or_else(|| {
            ViserLine::new(addr, CacheLevel::L3, self.line_size(), self.num_cores())
        });
        line.set_level(CacheLevel::L3);
        line.state = State::VALID;
        line.clear_stale_metadata(&self.shared.epochs);
        let has_md = line.has_aim_md;

        let mut policy = self.shared.l3.replacement;
        let victim = self
            .shared
            .l3
            .insert(line, &mut policy as &mut dyn EvictionPolicy<ViserLine>);
        if victim.is_valid() {
            self.evict_llc_line(core, victim, kind);
        }
        self.shared.aim_add_line_from_llc_miss(
            addr,
            has_md,
            &mut Requester {
                stats: &mut self.processors[core].stats.aim,
                kind: kind.stats_kind(),
                is_read: kind.is_read(),
            },
        );
    }

    /// Backs up a line leaving the shared cache into memory.
    fn evict_llc_line(&mut self, core: usize, mut victim: ViserLine, kind: AccessType) {
        let Some(addr) = victim.addr() else {
            return;
        };
        victim.set_level(CacheLevel::MEMORY);
        let deferred = victim.deferred_owner.is_some();
        self.shared.memory.insert(addr, victim);
        if deferred {
            self.fetch_deferred_line(addr);
        }

        let Some(line) = self.shared.memory.get(&addr) else {
            unreachable!();
        };
        let (dirty, has_md) = (line.dirty, line.has_aim_md);
        let stats_kind = kind.stats_kind();
        let proc = &mut self.processors[core];
        proc.stats.l3.inc(stats_kind, Event::LineEviction, 1);
        if dirty {
            proc.stats.l3.inc(stats_kind, Event::DirtyLineEviction, 1);
        }
        log::trace!("L3: line {addr} moves to memory (dirty={dirty}, metadata={has_md})");
        self.shared.aim_evict_line(
            addr,
            has_md,
            &mut Requester {
                stats: &mut proc.stats.aim,
                kind: stats_kind,
                is_read: kind.is_read(),
            },
        );
    }

    /// Pulls `addr` out of another core's private cache if it owns the latest values.
    pub(crate) fn fetch_deferred_from_others(&mut self, core: usize, addr: address) {
        let deferred = self
            .shared
            .line(addr)
            .and_then(|(line, _)| line.deferred_owner)
            .is_some_and(|owner| owner != core);
        if deferred {
            self.fetch_deferred_line(addr);
        }
    }

    /// Resolves a tentatively invalid private copy of `addr` by a version check.
    fn revalidate_tentative(&mut self, core: usize, addr: address) {
        let proc = &self.processors[core];
        let Some(l2) = proc
            .l2
            .find(addr)
            .filter(|line| line.state == State::INVALID_TENTATIVE)
        else {
            return;
        };
        let still_current = self.shared.line(addr).is_some_and(|(shared, _)| {
            shared.version == l2.version
                && shared.deferred_owner.map_or(true, |owner| owner == core)
        });

        let proc = &mut self.processors[core];
        for cache in [&mut proc.l1, &mut proc.l2] {
            let Some(line) = cache
                .find_mut(addr)
                .filter(|line| line.state == State::INVALID_TENTATIVE)
            else {
                continue;
            };
            if still_current {
                line.state = State::VALID;
            } else {
                line.invalidate();
            }
        }
        let counter = if still_current {
            Counter::InvalidStateHits
        } else {
            Counter::InvalidStateFailures
        };
        proc.stats.counters.inc(counter, 1);
    }
}
