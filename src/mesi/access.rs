use super::{Backup, Machine, MesiLine, State};
use crate::access::{Access, AccessType, LineAccess};
use crate::aim::Requester;
use crate::cache::{CacheLevel, CacheLine, EvictionPolicy};
use crate::{address, ConflictKind};

use stats::{Counter, Event};

/// Bits other cores handed over with a line.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Collected {
    reads: u64,
    writes: u64,
}

impl Collected {
    fn apply(self, line: &mut MesiLine) {
        line.bits.remote_reads |= self.reads;
        line.bits.remote_writes |= self.writes & !line.bits.local_writes;
    }
}

impl Machine {
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

        for line_access in access.split(self.config.line_size()) {
            if kind.is_read() {
                self.read_line(core, &line_access, kind);
            } else {
                self.write_line(core, &line_access, kind);
            }
        }
    }

    fn read_line(&mut self, core: usize, access: &LineAccess, kind: AccessType) {
        let addr = access.line_addr;
        self.request(core, addr, kind);
        if !kind.is_regular() {
            return;
        }
        let enc = access.encoding();
        if self.private_bits(core, addr).remote_writes & enc != 0 {
            self.handle_conflict(core, addr, ConflictKind::RW);
        }
        self.update_private(core, addr, |line| line.bits.local_reads |= enc);
    }

    fn write_line(&mut self, core: usize, access: &LineAccess, kind: AccessType) {
        let addr = access.line_addr;
        self.request(core, addr, kind);
        self.update_private(core, addr, |line| line.dirty = true);
        if !kind.is_regular() {
            return;
        }
        self.processors[core].region.has_writes = true;
        let enc = access.encoding();
        let bits = self.private_bits(core, addr);
        if bits.remote_writes & enc != 0 {
            self.handle_conflict(core, addr, ConflictKind::WW);
        } else if bits.remote_reads & enc != 0 {
            self.handle_conflict(core, addr, ConflictKind::WR);
        }
        self.update_private(core, addr, |line| line.bits.local_writes |= enc);
    }

    fn private_bits(&self, core: usize, addr: address) -> super::AccessBits {
        match self.processors[core].l2.lookup(addr) {
            Some(line) => line.bits,
            None => panic!("core {core}: line {addr} missing from L2 after request"),
        }
    }

    /// Applies `f` to the valid L1 and L2 copies `core` holds of `addr`.
    fn update_private(&mut self, core: usize, addr: address, mut f: impl FnMut(&mut MesiLine)) {
        let proc = &mut self.processors[core];
        for line in [proc.l1.lookup_mut(addr), proc.l2.lookup_mut(addr)]
            .into_iter()
            .flatten()
        {
            f(line);
        }
    }

    /// Brings `addr` into L1 and L2 of `core` with the permission `kind` needs.
    pub(crate) fn request(&mut self, core: usize, addr: address, kind: AccessType) -> CacheLevel {
        let is_read = kind.is_read();
        let stats_kind = kind.stats_kind();

        let proc = &mut self.processors[core];
        let level = if proc.l1.lookup(addr).is_some() {
            proc.l1.touch(addr);
            proc.l2.touch(addr);
            proc.stats.l1.inc(stats_kind, Event::hit(is_read), 1);
            CacheLevel::L1
        } else {
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
        };

        if kind.is_write() {
            if level.is_private() {
                self.upgrade(core, addr);
            }
            self.update_private(core, addr, |line| line.state = State::MODIFIED);
            self.update_llc_state(addr);
        }
        level
    }

    /// Gains write permission for a line `core` already holds.
    fn upgrade(&mut self, core: usize, addr: address) {
        let state = self.processors[core].l2.lookup(addr).map(|line| line.state);
        match state {
            Some(State::SHARED) => {
                self.count(core, Counter::MESIUpgradeMisses);
                let collected = self.remote_write(core, addr);
                self.update_private(core, addr, |line| collected.apply(line));
            }
            Some(State::EXCLUSIVE | State::MODIFIED) => {}
            other => panic!("core {core}: write hit on line {addr} in state {other:?}"),
        }
    }

    fn fill_l2(&mut self, core: usize, addr: address, kind: AccessType) -> CacheLevel {
        let proc = &mut self.processors[core];
        let mut policy = proc.l2.replacement;
        let (slot, victim) = proc
            .l2
            .evict(addr, &mut policy as &mut dyn EvictionPolicy<MesiLine>);
        self.evict_l2_line(core, victim);

        let level = self.fetch_shared(core, addr, kind);
        let (state, collected) = if kind.is_read() {
            self.remote_read(core, addr, level)
        } else {
            (State::MODIFIED, self.remote_write(core, addr))
        };
        let mut line = MesiLine::private(addr, state);
        self.restore_backup(core, &mut line);
        collected.apply(&mut line);
        self.processors[core].l2.fill(slot, line);
        self.update_llc_state(addr);
        level
    }

    fn fill_l1(&mut self, core: usize, addr: address) {
        let proc = &mut self.processors[core];
        let Some(l2) = proc.l2.lookup(addr) else {
            panic!("core {core}: filling L1 with {addr} which is not in L2");
        };
        let mut copy = l2.clone();
        copy.set_level(CacheLevel::L1);
        let mut policy = proc.l1.replacement;
        let victim = proc
            .l1
            .insert(copy, &mut policy as &mut dyn EvictionPolicy<MesiLine>);
        if victim.is_valid() {
            proc.stats.l1.inc(stats::AccessKind::Regular, Event::LineEviction, 1);
            if victim.is_dirty() {
                proc.stats.l1.inc(stats::AccessKind::Regular, Event::DirtyLineEviction, 1);
            }
        }
    }

    /// Handles a line leaving L2, together with its L1 copy.
    ///
    /// Bits of the open region survive in the global table.
    fn evict_l2_line(&mut self, core: usize, victim: MesiLine) {
        let Some(addr) = victim.addr() else {
            return;
        };
        let proc = &mut self.processors[core];
        proc.l1.remove(addr);
        if victim.is_valid() {
            proc.stats.l2.inc(stats::AccessKind::Regular, Event::LineEviction, 1);
            if victim.is_dirty() {
                proc.stats.l2.inc(stats::AccessKind::Regular, Event::DirtyLineEviction, 1);
            }
            log::trace!("core {core}: L2 evicts {victim}");
        }
        if victim.supplied || victim.has_local_bits() {
            self.back_up(core, addr, &victim);
        }
        if victim.is_valid() {
            if victim.is_dirty() {
                if let Some((shared, _)) = self.shared.line_mut(addr) {
                    shared.dirty = true;
                }
            }
            self.update_llc_state(addr);
        }
    }

    fn back_up(&mut self, core: usize, addr: address, line: &MesiLine) {
        let epoch = self.epoch(core);
        let backup = self
            .global_table
            .entry(addr)
            .or_default()
            .entry(core)
            .or_default();
        if backup.region != epoch {
            *backup = Backup {
                region: epoch,
                ..Backup::default()
            };
        }
        backup.local_reads |= line.bits.local_reads;
        backup.local_writes |= line.bits.local_writes;
        backup.supplied |= line.supplied;
        log::trace!("core {core}: backed up {backup:?} for line {addr}");

        let Some((shared, level)) = self.shared.line_mut(addr) else {
            panic!("core {core}: no shared copy of evicted line {addr}");
        };
        shared.has_aim_md = true;
        if level == CacheLevel::L3 {
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
    }

    /// Moves `core`'s backup for the line back onto its new private copy.
    fn restore_backup(&mut self, core: usize, line: &mut MesiLine) {
        let Some(addr) = line.addr() else {
            return;
        };
        let epoch = self.epoch(core);
        let Some(entries) = self.global_table.get_mut(&addr) else {
            return;
        };
        if let Some(backup) = entries.shift_remove(&core) {
            if backup.region == epoch {
                line.bits.local_reads |= backup.local_reads;
                line.bits.local_writes |= backup.local_writes;
                line.supplied |= backup.supplied;
            }
        }
        if entries.is_empty() {
            self.global_table.shift_remove(&addr);
        }
    }

    fn fetch_shared(&mut self, core: usize, addr: address, kind: AccessType) -> CacheLevel {
        let is_read = kind.is_read();
        let stats_kind = kind.stats_kind();
        if self.shared.l3.lookup(addr).is_none() {
            self.processors[core]
                .stats
                .l3
                .inc(stats_kind, Event::miss(is_read), 1);
            self.fill_llc(core, addr, kind);
            return CacheLevel::MEMORY;
        }
        self.shared.l3.touch(addr);
        self.processors[core]
            .stats
            .l3
            .inc(stats_kind, Event::hit(is_read), 1);
        if kind.is_regular() {
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
        CacheLevel::L3
    }

    fn fill_llc(&mut self, core: usize, addr: address, kind: AccessType) {
        let mut line = match self.shared.memory.get(&addr) {
            Some(backed) => {
                let mut line = backed.clone();
                line.in_memory = true;
                line
            }
            None => MesiLine::new(addr, CacheLevel::L3),
        };
        line.set_level(CacheLevel::L3);
        line.set_valid(true);
        line.state = State::INVALID;
        let has_md = line.has_aim_md;

        let mut policy = self.shared.l3.replacement;
        let victim = self
            .shared
            .l3
            .insert(line, &mut policy as &mut dyn EvictionPolicy<MesiLine>);
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

    /// Recalls the private copies of a line leaving the shared cache and backs it up in memory.
    fn evict_llc_line(&mut self, core: usize, mut victim: MesiLine, kind: AccessType) {
        let Some(addr) = victim.addr() else {
            return;
        };
        let stats_kind = kind.stats_kind();
        for proc in &mut self.processors {
            let Some(dirty) = proc.l2.lookup(addr).map(CacheLine::is_dirty) else {
                continue;
            };
            victim.dirty |= dirty;
            proc.l1.invalidate(addr);
            proc.l2.invalidate(addr);
            proc.stats.l2.inc(stats_kind, Event::LineEviction, 1);
            log::trace!("L3: recalled line {addr} from core {}", proc.id);
        }

        victim.set_level(CacheLevel::MEMORY);
        victim.state = State::INVALID;
        victim.in_memory = true;
        let (dirty, has_md) = (victim.dirty, victim.has_aim_md);
        let proc = &mut self.processors[core];
        proc.stats.l3.inc(stats_kind, Event::LineEviction, 1);
        if dirty {
            proc.stats.l3.inc(stats_kind, Event::DirtyLineEviction, 1);
        }
        self.shared.memory.insert(addr, victim);
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

    /// Gathers the bits other cores recorded on `addr` in their open regions
    /// and marks every core that handed any over as a supplier.
    ///
    /// A reader only needs the remote writes, a writer needs reads as well.
    fn collect_remote_bits(&mut self, core: usize, addr: address, for_write: bool) -> Collected {
        let mut collected = Collected::default();
        let mut take = |reads: u64, writes: u64| {
            let supplies = writes != 0 || (for_write && reads != 0);
            if supplies {
                if for_write {
                    collected.reads |= reads;
                }
                collected.writes |= writes;
            }
            supplies
        };

        for proc in self.processors.iter_mut().filter(|proc| proc.id != core) {
            let Some(l2) = proc.l2.find(addr) else {
                continue;
            };
            if !take(l2.bits.local_reads, l2.bits.local_writes) {
                continue;
            }
            for line in [proc.l1.find_mut(addr), proc.l2.find_mut(addr)]
                .into_iter()
                .flatten()
            {
                line.supplied = true;
            }
        }

        if let Some(entries) = self.global_table.get_mut(&addr) {
            for (&other, backup) in entries.iter_mut() {
                if other == core || backup.region != self.shared.epochs[other] {
                    continue;
                }
                if take(backup.local_reads, backup.local_writes) {
                    backup.supplied = true;
                }
            }
        }
        collected
    }

    /// Serves a read miss that reached the shared level.
    ///
    /// An exclusive copy may later be written without asking anyone, so it
    /// collects the remote reads as well.
    fn remote_read(&mut self, core: usize, addr: address, level: CacheLevel) -> (State, Collected) {
        let state = if level == CacheLevel::MEMORY {
            let epochs = &self.shared.epochs;
            let read_elsewhere = self.global_table.get(&addr).is_some_and(|entries| {
                entries.iter().any(|(&other, backup)| {
                    other != core && backup.region == epochs[other] && backup.local_reads != 0
                })
            });
            if read_elsewhere {
                State::SHARED
            } else {
                State::EXCLUSIVE
            }
        } else {
            self.downgrade_others(core, addr)
        };
        let collected = self.collect_remote_bits(core, addr, state == State::EXCLUSIVE);
        (state, collected)
    }

    /// Moves exclusive remote copies to SHARED, returning the state the reader gets.
    fn downgrade_others(&mut self, core: usize, addr: address) -> State {
        let (mut provided, mut shared, mut written_back) = (false, false, false);
        for proc in self.processors.iter_mut().filter(|proc| proc.id != core) {
            let Some(state) = proc.l2.lookup(addr).map(|line| line.state) else {
                continue;
            };
            match state {
                State::EXCLUSIVE | State::MODIFIED => {
                    provided = true;
                    for line in [proc.l1.lookup_mut(addr), proc.l2.lookup_mut(addr)]
                        .into_iter()
                        .flatten()
                    {
                        written_back |= line.dirty;
                        line.state = State::SHARED;
                        line.dirty = false;
                    }
                }
                State::SHARED => shared = true,
                State::INVALID => panic!("core {}: valid line {addr} in state INVALID", proc.id),
            }
        }
        assert!(
            !(provided && shared),
            "line {addr} is both exclusive and shared in remote caches"
        );
        if provided {
            self.count(core, Counter::MESIReadRemoteHits);
        }
        if written_back {
            if let Some(llc) = self.shared.l3.lookup_mut(addr) {
                llc.dirty = true;
            }
        }
        if provided || shared {
            State::SHARED
        } else {
            State::EXCLUSIVE
        }
    }

    /// Invalidates every other private copy of `addr`, collecting their bits.
    fn remote_write(&mut self, core: usize, addr: address) -> Collected {
        let collected = self.collect_remote_bits(core, addr, true);
        let (mut invalidations, mut fetches) = (0, 0);
        for proc in self.processors.iter_mut().filter(|proc| proc.id != core) {
            let Some(state) = proc.l2.lookup(addr).map(|line| line.state) else {
                continue;
            };
            if state.is_exclusive() {
                fetches += 1;
            }
            proc.l1.invalidate(addr);
            proc.l2.invalidate(addr);
            invalidations += 1;
        }
        let counters = &mut self.processors[core].stats.counters;
        counters.inc(Counter::ModifiedLineFetches, fetches);
        counters.inc(Counter::MESIWriteRemoteHits, invalidations);
        collected
    }

    /// State of `addr` across all private caches.
    #[must_use]
    pub fn holders_state(&self, addr: address) -> State {
        let mut holders = self
            .processors
            .iter()
            .filter_map(|proc| proc.l2.lookup(addr))
            .map(|line| line.state);
        match (holders.next(), holders.next()) {
            (None, _) => State::INVALID,
            (Some(state), None) => state,
            (Some(_), Some(_)) => State::SHARED,
        }
    }

    /// Sets the shared cache state to what the private copies imply.
    pub(crate) fn update_llc_state(&mut self, addr: address) {
        let state = self.holders_state(addr);
        match self.shared.l3.lookup_mut(addr) {
            Some(llc) => llc.state = state,
            None => assert_eq!(
                state,
                State::INVALID,
                "private copies of {addr} outlived the LLC line"
            ),
        }
    }
}
