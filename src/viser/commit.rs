//! End of region: pre-commit, read validation and post-commit.

use super::{Machine, Phase, Processor, Region, State, ViserLine};
use crate::access::offsets;
use crate::aim::Requester;
use crate::cache::{CacheLevel, CacheLine};
use crate::{address, ConflictKind};

use indexmap::IndexMap;
use stats::Counter;

/// What post-commit does with a private line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retain {
    Keep,
    Invalidate,
    Tentative,
}

impl Machine {
    pub(crate) fn process_region_end(&mut self, core: usize) {
        let epoch = self.epoch(core);
        log::debug!("core {core}: end of region {epoch}");

        self.pre_commit(core);
        self.read_validation(core);
        self.post_commit(core);

        let proc = &mut self.processors[core];
        if proc.region.has_writes {
            proc.stats.counters.inc(Counter::RegionsWithWrites, 1);
        }
        if let Some(bloom) = proc.bloom.as_mut() {
            bloom.clear();
        }
        proc.region = Region::default();
        self.increment_epoch(core);
        if self.config.clear_aim_cache_at_region_boundaries {
            self.shared.clear_aim_cache();
        }
    }

    /// Write offsets of all valid private lines, L1 lines first.
    fn private_writes(&self, core: usize) -> IndexMap<address, u64> {
        let epoch = self.epoch(core);
        let proc = &self.processors[core];
        let mut written: IndexMap<address, u64> = IndexMap::new();
        for line in proc.l1.lines().chain(proc.l2.lines()) {
            let Some(addr) = line.addr().filter(|_| line.is_valid()) else {
                continue;
            };
            let enc = line.live_md(core, epoch).write;
            if enc != 0 {
                *written.entry(addr).or_default() |= enc;
            }
        }
        written
    }

    /// Publishes write offsets to the shared level and checks them against
    /// concurrently open regions of the other cores.
    fn pre_commit(&mut self, core: usize) {
        let epoch = self.epoch(core);
        let mut written = self.private_writes(core);
        let evicted: Vec<address> = self.processors[core]
            .region
            .evicted_written
            .iter()
            .copied()
            .filter(|addr| !written.contains_key(addr))
            .collect();
        for addr in evicted {
            if let Some((shared, _)) = self.shared.line(addr) {
                written.insert(addr, shared.live_md(core, epoch).write);
            }
        }

        for (addr, enc) in written {
            let Some((shared, _)) = self.shared.line(addr) else {
                panic!("core {core}: no shared copy of written line {addr}");
            };
            // one conflict per line, the first remote core decides and WR wins over WW
            let epochs = &self.shared.epochs;
            let conflict = (0..self.num_cores())
                .filter(|&other| other != core)
                .find_map(|other| {
                    let md = shared.md(other);
                    if md.epoch != epochs[other] {
                        None
                    } else if md.read & enc != 0 {
                        Some(ConflictKind::WR)
                    } else if md.write & enc != 0 {
                        Some(ConflictKind::WW)
                    } else {
                        None
                    }
                });
            if let Some(kind) = conflict {
                self.handle_conflict(core, addr, Phase::PreCommit, kind);
            }

            let Some((shared, level)) = self.shared.line_mut(addr) else {
                unreachable!();
            };
            shared.md_mut(core, epoch).write |= enc;
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
    }

    /// Folds every valid L1 line into its L2 copy.
    fn merge_l1_into_l2(&mut self, core: usize) {
        let epoch = self.epoch(core);
        let Processor { l1, l2, .. } = &mut self.processors[core];
        for line in l1.lines().filter(|line| line.is_valid()) {
            let Some(addr) = line.addr() else {
                continue;
            };
            let Some(l2_line) = l2.lookup_mut(addr) else {
                panic!("core {core}: L1 line {addr} has no L2 line");
            };
            l2_line.merge_from_l1(line, core, epoch);
        }
    }

    /// Revalidates every line read in this region until a full pass finds all
    /// versions current.
    ///
    /// A pass that finds a stale line brings it up to date, so the next pass
    /// can only find lines that other cores committed to in between. With
    /// events processed one at a time there are none and the loop ends after
    /// at most two passes.
    fn read_validation(&mut self, core: usize) {
        let epoch = self.epoch(core);
        self.merge_l1_into_l2(core);

        let mut retry = false;
        for round in 0.. {
            assert!(
                round < self.config.max_validation_rounds,
                "core {core}: read validation of region {epoch} did not converge after {round} rounds"
            );
            if retry {
                self.count(core, Counter::ReadValidationRetries);
            }
            let read_lines: Vec<address> = self.processors[core]
                .l2
                .lines()
                .filter(|line| line.is_valid() && line.has_read_offsets(core, epoch))
                .filter_map(CacheLine::addr)
                .collect();
            let mut versions_match = true;
            for addr in read_lines {
                versions_match &= self.validate_line(core, addr, retry);
            }
            if versions_match {
                break;
            }
            retry = true;
        }
    }

    /// Returns whether the private version of `addr` was already current.
    fn validate_line(&mut self, core: usize, addr: address, retry: bool) -> bool {
        let epoch = self.epoch(core);
        let proc = &self.processors[core];
        let skip = self.config.use_bloom_filter
            && self.config.skip_validating_read_lines
            && proc.bloom.as_ref().is_some_and(|bloom| !bloom.contains(addr));
        if skip {
            log::trace!("core {core}: bloom filter skips line {addr}");
            self.count(core, Counter::BloomFilterSkippedLines);
            return true;
        }
        let Some(l2) = self.processors[core].l2.lookup(addr) else {
            panic!("core {core}: validating line {addr} missing from L2");
        };
        let (version, read, written) = (
            l2.version,
            l2.live_md(core, epoch).read,
            l2.has_written_offsets(core, epoch),
        );
        let Some((shared, _)) = self.shared.line(addr) else {
            panic!("core {core}: no shared copy of read line {addr}");
        };
        let shared_version = shared.version;
        let written_by_others = shared.written_by_others(core);
        // writes of open regions that reached the shared level through evictions
        let remote_write = (0..self.num_cores())
            .filter(|&other| other != core)
            .any(|other| {
                let remote = shared.md(other);
                remote.epoch == self.shared.epochs[other] && remote.write & read != 0
            });
        self.count(core, Counter::ValidatedLines);

        if version == shared_version {
            if !retry && written_by_others {
                self.count(core, Counter::PotentialWrRdValConflicts);
                if remote_write {
                    self.handle_conflict(core, addr, Phase::ReadValidation, ConflictKind::RW);
                }
            }
            return true;
        }
        assert!(
            version < shared_version,
            "core {core}: private version {version} of line {addr} is ahead of shared version {shared_version}"
        );

        let proc = &mut self.processors[core];
        for line in [proc.l1.lookup_mut(addr), proc.l2.lookup_mut(addr)]
            .into_iter()
            .flatten()
        {
            line.version = shared_version;
            line.concurrent_remote_write |= written;
        }
        if !self.config.ignore_fetching_deferred_lines_during_read_validation {
            self.fetch_deferred_from_others(core, addr);
        }
        self.validate_values(core, addr);
        false
    }

    /// Compares read bytes against the shared values, then refreshes the
    /// bytes this core has not written.
    fn validate_values(&mut self, core: usize, addr: address) {
        let epoch = self.epoch(core);
        let Some((shared, _)) = self.shared.line(addr) else {
            panic!("core {core}: no shared copy of read line {addr}");
        };
        let proc = &mut self.processors[core];
        proc.stats.counters.inc(Counter::ValidationAttempts, 1);
        let Some(l2) = proc.l2.lookup_mut(addr) else {
            panic!("core {core}: validating line {addr} missing from L2");
        };
        let md = l2.live_md(core, epoch);
        let failed = offsets(md.read).any(|off| {
            l2.read_value(off) != shared.values[off]
                && shared.last_writers[off] != Some(core as u16)
        });

        let refresh = !md.write & l2.full_mask();
        l2.copy_values(shared, refresh);
        if let Some(l1) = proc.l1.lookup_mut(addr) {
            let l1_writes = l1.live_md(core, epoch).write;
            l1.copy_values(shared, refresh & !l1_writes);
        }

        if failed {
            log::debug!("core {core}: value validation of line {addr} failed");
            proc.stats.counters.inc(Counter::FailedValidations, 1);
            if !proc.region.has_failed_validation {
                proc.region.has_failed_validation = true;
                proc.stats.counters.inc(Counter::RegionsWithFRVs, 1);
            }
            self.handle_conflict(core, addr, Phase::ReadValidation, ConflictKind::RW);
        }
    }

    /// Makes this region's writes visible and self-invalidates private lines
    /// that may be stale in the next region.
    fn post_commit(&mut self, core: usize) {
        let epoch = self.epoch(core);
        self.merge_l1_into_l2(core);
        self.send_dirty_values(core);

        let addrs = self.processors[core].l2.valid_addresses();
        let (mut kept, mut invalidated) = (0, 0);
        for addr in addrs {
            let retain = self.retain_after_commit(core, addr);
            if retain != Retain::Keep {
                self.resolve_own_deferral(core, addr);
            }
            let written = self.processors[core]
                .l2
                .lookup(addr)
                .is_some_and(|line| line.has_written_offsets(core, epoch));
            // only a written line knows the version its own commit produced
            let committed_version = self
                .shared
                .line(addr)
                .map(|(shared, _)| shared.version)
                .filter(|_| written);

            let proc = &mut self.processors[core];
            for line in [proc.l1.lookup_mut(addr), proc.l2.lookup_mut(addr)]
                .into_iter()
                .flatten()
            {
                match retain {
                    Retain::Keep => {
                        if let Some(version) = committed_version {
                            line.version = version;
                        }
                        line.reset_after_commit(core, epoch + 1);
                    }
                    Retain::Invalidate => line.invalidate(),
                    Retain::Tentative => {
                        line.invalidate();
                        line.state = State::INVALID_TENTATIVE;
                    }
                }
            }
            if retain == Retain::Keep {
                kept += 1;
            } else {
                invalidated += 1;
            }
        }
        let counters = &mut self.processors[core].stats.counters;
        counters.inc(Counter::LinesKeptAfterCommit, kept);
        counters.inc(Counter::LinesInvalidatedAfterCommit, invalidated);
    }

    fn retain_after_commit(&self, core: usize, addr: address) -> Retain {
        let epoch = self.epoch(core);
        let config = &self.config;
        let proc = &self.processors[core];
        let Some(line) = proc.l2.lookup(addr) else {
            return Retain::Invalidate;
        };
        let md = line.live_md(core, epoch);
        if md.write != 0 {
            let shared_version = self.shared.line(addr).map(|(shared, _)| shared.version);
            let one_ahead = shared_version == Some(line.version + 1);
            if config.invalidate_written_lines_only_after_version_check
                && one_ahead
                && !line.concurrent_remote_write
            {
                Retain::Keep
            } else {
                Retain::Invalidate
            }
        } else if md.read != 0 {
            if config.always_invalidate_read_only_lines {
                Retain::Invalidate
            } else {
                Retain::Keep
            }
        } else if config.use_special_invalid_state {
            Retain::Tentative
        } else if config.use_bloom_filter
            && config.invalidate_untouched_lines_optimization
            && proc.bloom.as_ref().is_some_and(|bloom| !bloom.contains(addr))
        {
            Retain::Keep
        } else {
            Retain::Invalidate
        }
    }

    /// Bumps the shared version of every line written in this region and
    /// either copies the values or leaves them deferred in this core's L2.
    fn send_dirty_values(&mut self, core: usize) {
        let epoch = self.epoch(core);
        let defer = self.config.defer_write_backs;
        let written: Vec<ViserLine> = self.processors[core]
            .l2
            .lines()
            .filter(|line| line.is_valid() && line.has_written_offsets(core, epoch))
            .cloned()
            .collect();
        for line in &written {
            let Some(addr) = line.addr() else {
                continue;
            };
            let enc = line.live_md(core, epoch).write;
            let Some((shared, _)) = self.shared.line_mut(addr) else {
                panic!("core {core}: no shared copy of written line {addr}");
            };
            bump_version(shared, core);
            if defer {
                shared.deferred_owner = Some(core);
            } else {
                shared.copy_values(line, enc);
                shared.dirty = true;
            }
            shared.set_last_writer(enc, core);
            self.add_to_bloom_filters(core, addr);
        }

        let evicted: Vec<address> = self.processors[core]
            .region
            .evicted_written
            .iter()
            .copied()
            .filter(|addr| !written.iter().any(|line| line.holds(*addr)))
            .collect();
        for addr in evicted {
            let Some((shared, _)) = self.shared.line_mut(addr) else {
                panic!("core {core}: no shared copy of evicted line {addr}");
            };
            bump_version(shared, core);
            self.add_to_bloom_filters(core, addr);
        }
    }

    /// Hands the values of a line deferred to `core` back to the shared level.
    fn resolve_own_deferral(&mut self, core: usize, addr: address) {
        let proc = &self.processors[core];
        let Some(line) = proc.l2.lookup(addr) else {
            return;
        };
        let Some((shared, _)) = self.shared.line_mut(addr) else {
            return;
        };
        if shared.deferred_owner != Some(core) {
            return;
        }
        shared.copy_values(line, line.full_mask());
        shared.dirty = true;
        shared.deferred_owner = None;
        self.count(core, Counter::DeferredWriteBacks);
    }

    fn add_to_bloom_filters(&mut self, writer: usize, addr: address) {
        for proc in self
            .processors
            .iter_mut()
            .filter(|proc| proc.id != writer)
        {
            if let Some(bloom) = proc.bloom.as_mut() {
                bloom.add(addr);
            }
        }
    }

    /// Publishes a line whose latest values live in the owner's private cache.
    ///
    /// The owner's read and write offsets move to the shared copy, written
    /// offsets bump the shared version, and the owner continues with a clean
    /// private copy at the new version.
    pub(crate) fn fetch_deferred_line(&mut self, addr: address) {
        let Some(owner) = self
            .shared
            .line(addr)
            .and_then(|(line, _)| line.deferred_owner)
        else {
            return;
        };
        let epoch = self.epoch(owner);
        let proc = &self.processors[owner];
        let Some(mut view) = proc.l2.lookup(addr).cloned() else {
            panic!("line {addr} is deferred to core {owner} which does not hold it");
        };
        if let Some(l1) = proc.l1.lookup(addr) {
            view.merge_from_l1(l1, owner, epoch);
        }
        let md = view.live_md(owner, epoch);
        let written = md.write != 0;

        let Some((shared, level)) = self.shared.line_mut(addr) else {
            unreachable!();
        };
        let shared_md = shared.md_mut(owner, epoch);
        shared_md.read |= md.read;
        shared_md.write |= md.write;
        shared_md.read &= !shared_md.write;
        if written {
            bump_version(shared, owner);
            shared.dirty = true;
        }
        shared.copy_values(&view, view.full_mask());
        shared.set_last_writer(md.write, owner);
        shared.has_aim_md = true;
        shared.deferred_owner = None;
        let version = shared.version;
        log::debug!("fetched line {addr} deferred to core {owner} (version {version})");

        if written {
            self.add_to_bloom_filters(owner, addr);
        }
        if level == CacheLevel::L3 {
            self.shared.aim_add_line_if_not_present(
                addr,
                true,
                &mut Requester {
                    stats: &mut self.processors[owner].stats.aim,
                    kind: stats::AccessKind::Regular,
                    is_read: true,
                },
            );
        }

        let proc = &mut self.processors[owner];
        for line in [proc.l1.lookup_mut(addr), proc.l2.lookup_mut(addr)]
            .into_iter()
            .flatten()
        {
            line.values.clone_from(&view.values);
            line.clear_md(owner, epoch);
            line.backup = 0;
            line.dirty = false;
            line.version = version;
        }
        proc.stats.counters.inc(Counter::DeferredLineFetches, 1);
    }
}

fn bump_version(shared: &mut ViserLine, writer: usize) {
    let Some(next) = shared.version.checked_add(1) else {
        panic!("version of line {:?} overflowed", shared.addr());
    };
    log::trace!("core {writer} commits {:?} at version {next}", shared.addr());
    shared.version = next;
}
