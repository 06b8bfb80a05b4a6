//! End of region: retract the bits other cores were handed and start over.

use super::{Machine, Region};
use crate::address;
use crate::cache::CacheLine;

use stats::Counter;

impl Machine {
    pub(crate) fn process_region_end(&mut self, core: usize) {
        let epoch = self.epoch(core);
        log::debug!("core {core}: end of region {epoch}");

        let mut supplied: Vec<(address, u64, u64)> = self.processors[core]
            .l2
            .lines()
            .filter(|line| line.supplied)
            .filter_map(|line| {
                let addr = line.addr()?;
                Some((addr, line.bits.local_reads, line.bits.local_writes))
            })
            .collect();
        supplied.extend(self.global_table.iter().filter_map(|(&addr, entries)| {
            let backup = entries.get(&core)?;
            (backup.supplied && backup.region == epoch)
                .then_some((addr, backup.local_reads, backup.local_writes))
        }));
        for (addr, reads, writes) in supplied {
            self.announce_end_of_region(core, addr, reads, writes);
        }

        self.global_table.retain(|_, entries| {
            entries.shift_remove(&core);
            !entries.is_empty()
        });

        let proc = &mut self.processors[core];
        for line in proc.l1.lines_mut().chain(proc.l2.lines_mut()) {
            line.clear_region_metadata();
        }
        if proc.region.has_writes {
            proc.stats.counters.inc(Counter::RegionsWithWrites, 1);
        }
        proc.region = Region::default();
        self.shared.increment_epoch(core);
    }

    /// Tells every other core that `core` no longer holds `reads` and `writes` on `addr`.
    fn announce_end_of_region(&mut self, core: usize, addr: address, reads: u64, writes: u64) {
        self.count(core, Counter::CEEndOfRegionMessages);
        for proc in self.processors.iter_mut().filter(|proc| proc.id != core) {
            let mut retracted = false;
            for line in [proc.l1.find_mut(addr), proc.l2.find_mut(addr)]
                .into_iter()
                .flatten()
            {
                retracted |= line.retract_remote(reads, writes);
            }
            if retracted {
                log::trace!("core {}: core {core} retracted its bits on {addr}", proc.id);
            }
        }
    }
}
