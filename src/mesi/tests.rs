use super::{Machine, State};
use crate::access::{Access, AccessType};
use crate::cache::CacheLine;
use crate::{config, testing, Simulator};
use color_eyre::eyre;
use pretty_assertions_sorted as diff;
use stats::{Counter, Event};

fn counter(machine: &Machine, core: usize, counter: Counter) -> usize {
    machine.processor(core).stats.counters.get(counter)
}

fn machine(config: config::Config) -> eyre::Result<Machine> {
    testing::init_logging();
    Ok(Machine::new(config)?)
}

fn state(machine: &Machine, core: usize, addr: u64) -> State {
    machine
        .processor(core)
        .l2
        .lookup(addr)
        .map_or(State::INVALID, |line| line.state)
}

fn llc_state(machine: &Machine, addr: u64) -> Option<State> {
    machine.shared.l3.lookup(addr).map(|line| line.state)
}

#[test]
fn read_miss_fetches_exclusive() -> eyre::Result<()> {
    let mut machine = machine(testing::configs::mesi(2))?;
    machine.read(0, 0, 4);
    machine.verify()?;

    diff::assert_eq!(state(&machine, 0, 0), State::EXCLUSIVE);
    diff::assert_eq!(llc_state(&machine, 0), Some(State::EXCLUSIVE));
    let stats = &machine.processor(0).stats;
    diff::assert_eq!(stats.l1.get(Event::ReadMiss), 1);
    diff::assert_eq!(stats.l2.get(Event::ReadMiss), 1);
    diff::assert_eq!(stats.l3.get(Event::ReadMiss), 1);

    machine.read(0, 0, 4);
    diff::assert_eq!(machine.processor(0).stats.l1.get(Event::ReadHit), 1);
    Ok(())
}

#[test]
fn second_reader_shares_the_line() -> eyre::Result<()> {
    let mut machine = machine(testing::configs::mesi(2))?;
    machine.read(0, 0, 4);
    machine.read(1, 0, 4);
    machine.verify()?;

    diff::assert_eq!(state(&machine, 0, 0), State::SHARED);
    diff::assert_eq!(state(&machine, 1, 0), State::SHARED);
    diff::assert_eq!(llc_state(&machine, 0), Some(State::SHARED));
    diff::assert_eq!(counter(&machine, 1, Counter::MESIReadRemoteHits), 1);
    diff::assert_eq!(machine.processor(1).stats.l3.get(Event::ReadHit), 1);
    diff::assert_eq!(counter(&machine, 1, Counter::PreciseConflicts), 0);
    Ok(())
}

#[test]
fn write_invalidates_reader_and_conflicts() -> eyre::Result<()> {
    let mut machine = machine(testing::configs::mesi(2))?;
    machine.read(0, 0, 4);
    machine.write(1, 0, 4, 1);
    machine.verify()?;

    diff::assert_eq!(state(&machine, 0, 0), State::INVALID);
    diff::assert_eq!(state(&machine, 1, 0), State::MODIFIED);
    diff::assert_eq!(llc_state(&machine, 0), Some(State::MODIFIED));
    diff::assert_eq!(counter(&machine, 1, Counter::MESIWriteRemoteHits), 1);
    diff::assert_eq!(counter(&machine, 1, Counter::ModifiedLineFetches), 1);
    diff::assert_eq!(counter(&machine, 1, Counter::PreciseConflicts), 1);
    diff::assert_eq!(counter(&machine, 1, Counter::WRPreciseConflicts), 1);
    diff::assert_eq!(counter(&machine, 1, Counter::RegionsWithExceptions), 1);

    // the invalidated copy still speaks for core 0's open region
    let stale = machine.processor(0).l2.find(0).expect("slot of line 0");
    assert!(!stale.is_valid());
    assert!(stale.supplied);
    diff::assert_eq!(stale.bits.local_reads, 0xF);

    let line = machine.processor(1).l2.lookup(0).expect("line 0 in L2");
    diff::assert_eq!(line.bits.remote_reads, 0xF);
    diff::assert_eq!(line.bits.local_writes, 0xF);
    Ok(())
}

#[test]
fn upgrade_miss_on_shared_line() -> eyre::Result<()> {
    let mut machine = machine(testing::configs::mesi(2))?;
    machine.read(0, 0, 1);
    machine.read(1, 0, 1);
    machine.write(1, 2, 1, 5);
    machine.verify()?;

    diff::assert_eq!(counter(&machine, 1, Counter::MESIUpgradeMisses), 1);
    diff::assert_eq!(counter(&machine, 1, Counter::MESIWriteRemoteHits), 1);
    diff::assert_eq!(counter(&machine, 1, Counter::ModifiedLineFetches), 0);
    diff::assert_eq!(counter(&machine, 1, Counter::PreciseConflicts), 0);
    diff::assert_eq!(state(&machine, 0, 0), State::INVALID);
    diff::assert_eq!(state(&machine, 1, 0), State::MODIFIED);

    let line = machine.processor(1).l1.lookup(0).expect("line 0 in L1");
    diff::assert_eq!(line.bits.remote_reads, 0b1);
    diff::assert_eq!(line.bits.local_reads, 0b1);
    diff::assert_eq!(line.bits.local_writes, 0b100);
    Ok(())
}

#[test]
fn read_of_remote_write_conflicts_until_writer_ends_region() -> eyre::Result<()> {
    let mut machine = machine(testing::configs::mesi(2))?;
    machine.write(0, 0, 4, 7);
    machine.read(1, 0, 4);
    machine.verify()?;

    diff::assert_eq!(counter(&machine, 1, Counter::RWPreciseConflicts), 1);
    diff::assert_eq!(counter(&machine, 1, Counter::MESIReadRemoteHits), 1);
    diff::assert_eq!(state(&machine, 0, 0), State::SHARED);
    diff::assert_eq!(state(&machine, 1, 0), State::SHARED);
    let llc = machine.shared.l3.lookup(0).expect("line 0 in LLC");
    assert!(llc.is_dirty(), "downgrading a modified line writes it back");
    assert!(machine.processor(0).l2.lookup(0).is_some_and(|line| line.supplied));

    machine.region_end(0);
    machine.verify()?;
    diff::assert_eq!(counter(&machine, 0, Counter::CEEndOfRegionMessages), 1);
    diff::assert_eq!(counter(&machine, 0, Counter::RegionsWithWrites), 1);
    diff::assert_eq!(machine.epoch(0), 2);
    let line = machine.processor(1).l2.lookup(0).expect("line 0 in L2");
    diff::assert_eq!(line.bits.remote_writes, 0);

    machine.read(1, 0, 4);
    diff::assert_eq!(counter(&machine, 1, Counter::PreciseConflicts), 1);
    Ok(())
}

#[test]
fn evicted_bits_reach_later_readers() -> eyre::Result<()> {
    let mut machine = machine(testing::configs::mesi(2))?;
    machine.write(0, 0, 4, 7);
    // 8 and 16 share L2 set 0 with line 0, which is the LRU victim
    machine.read(0, 8, 4);
    machine.read(0, 16, 4);
    machine.verify()?;

    assert!(machine.processor(0).l2.find(0).is_none());
    let backup = machine.backup(0, 0).expect("line 0 backed up");
    diff::assert_eq!(backup.local_writes, 0xF);
    assert!(!backup.supplied);
    let llc = machine.shared.l3.lookup(0).expect("line 0 in LLC");
    diff::assert_eq!(llc.state, State::INVALID);
    assert!(llc.has_aim_md);
    assert!(llc.is_dirty());

    machine.read(1, 0, 4);
    machine.verify()?;
    diff::assert_eq!(state(&machine, 1, 0), State::EXCLUSIVE);
    diff::assert_eq!(counter(&machine, 1, Counter::RWPreciseConflicts), 1);
    assert!(machine.backup(0, 0).is_some_and(|backup| backup.supplied));

    machine.region_end(0);
    machine.verify()?;
    diff::assert_eq!(counter(&machine, 0, Counter::CEEndOfRegionMessages), 1);
    assert!(machine.global_table.is_empty());
    let line = machine.processor(1).l2.lookup(0).expect("line 0 in L2");
    diff::assert_eq!(line.bits.remote_writes, 0);
    Ok(())
}

#[test]
fn exclusive_reader_sees_earlier_reads_before_silent_upgrade() -> eyre::Result<()> {
    let mut machine = machine(testing::configs::mesi(2))?;
    machine.read(0, 0, 4);
    machine.read(0, 8, 4);
    machine.read(0, 16, 4);
    diff::assert_eq!(
        machine.backup(0, 0).map(|backup| backup.local_reads),
        Some(0xF)
    );

    machine.read(1, 0, 4);
    diff::assert_eq!(state(&machine, 1, 0), State::EXCLUSIVE);
    let line = machine.processor(1).l2.lookup(0).expect("line 0 in L2");
    diff::assert_eq!(line.bits.remote_reads, 0xF);
    assert!(machine.backup(0, 0).is_some_and(|backup| backup.supplied));

    machine.write(1, 0, 4, 1);
    machine.verify()?;
    diff::assert_eq!(state(&machine, 1, 0), State::MODIFIED);
    diff::assert_eq!(counter(&machine, 1, Counter::MESIUpgradeMisses), 0);
    diff::assert_eq!(counter(&machine, 1, Counter::WRPreciseConflicts), 1);
    Ok(())
}

#[test]
fn refetched_line_restores_its_backup() -> eyre::Result<()> {
    let mut machine = machine(testing::configs::mesi(1))?;
    machine.write(0, 0, 4, 7);
    machine.read(0, 8, 4);
    machine.read(0, 16, 4);
    machine.read(0, 0, 2);
    machine.verify()?;

    let line = machine.processor(0).l2.lookup(0).expect("line 0 in L2");
    diff::assert_eq!(line.bits.local_writes, 0xF);
    diff::assert_eq!(line.bits.local_reads, 0b11);
    assert!(machine.backup(0, 0).is_none());
    // refetching 0 pushed out 8, the LRU line of the set
    let backup = machine.backup(0, 8).expect("line 8 backed up");
    diff::assert_eq!(backup.local_reads, 0xF);
    Ok(())
}

#[test]
fn llc_eviction_recalls_private_copies() -> eyre::Result<()> {
    let mut machine = machine(testing::configs::mesi(2))?;
    machine.read(0, 0, 4);
    // 0, 16, 32, 48 and 64 share LLC set 0
    for addr in [16, 32, 48, 64] {
        machine.read(1, addr, 4);
    }
    machine.verify()?;

    assert!(machine.shared.l3.lookup(0).is_none());
    let memory = machine.shared.memory.get(&0).expect("line 0 in memory");
    assert!(memory.in_memory);
    diff::assert_eq!(state(&machine, 0, 0), State::INVALID);
    diff::assert_eq!(machine.processor(0).stats.l2.get(Event::LineEviction), 1);
    diff::assert_eq!(machine.processor(1).stats.l3.get(Event::LineEviction), 1);

    machine.read(0, 0, 4);
    machine.verify()?;
    diff::assert_eq!(state(&machine, 0, 0), State::EXCLUSIVE);
    diff::assert_eq!(machine.processor(0).stats.l3.get(Event::ReadMiss), 2);
    assert!(machine.shared.l3.lookup(0).is_some_and(|line| line.in_memory));
    Ok(())
}

#[test]
fn lock_accesses_skip_conflict_detection() -> eyre::Result<()> {
    let mut machine = machine(testing::configs::mesi(2))?;
    machine.write(0, 0, 4, 7);
    machine.access(Access::write(1, 0, 4, 1).with_kind(AccessType::LOCK_ACQ_WRITE));
    machine.access(Access::read(1, 0, 4).with_kind(AccessType::LOCK_ACQ_READ));
    machine.verify()?;

    diff::assert_eq!(counter(&machine, 1, Counter::PreciseConflicts), 0);
    diff::assert_eq!(counter(&machine, 1, Counter::TotalLockWrites), 1);
    diff::assert_eq!(counter(&machine, 1, Counter::TotalLockReads), 1);
    diff::assert_eq!(state(&machine, 0, 0), State::INVALID);
    diff::assert_eq!(state(&machine, 1, 0), State::MODIFIED);
    let line = machine.processor(1).l2.lookup(0).expect("line 0 in L2");
    diff::assert_eq!(line.bits.local_writes, 0);
    diff::assert_eq!(line.bits.local_reads, 0);
    Ok(())
}

#[test]
fn atomics_as_regular_accesses_conflict() -> eyre::Result<()> {
    let mut machine = machine(config::Config {
        treat_atomic_updates_as_regular_accesses: true,
        ..testing::configs::mesi(2)
    })?;
    machine.write(0, 0, 4, 7);
    machine.access(Access::write(1, 0, 4, 1).with_kind(AccessType::ATOMIC_WRITE));
    diff::assert_eq!(counter(&machine, 1, Counter::WWPreciseConflicts), 1);
    diff::assert_eq!(counter(&machine, 1, Counter::TotalWrites), 1);
    diff::assert_eq!(counter(&machine, 1, Counter::TotalAtomicWrites), 0);
    Ok(())
}

#[test]
fn no_local_bits_survive_region_end() -> eyre::Result<()> {
    let mut machine = machine(testing::configs::mesi(2))?;
    for addr in [0, 4, 8, 12, 16] {
        machine.write(0, addr, 4, addr);
        machine.read(1, addr, 2);
    }
    machine.region_end(0);
    machine.region_end(1);
    machine.verify()?;

    for core in 0..2 {
        let proc = machine.processor(core);
        for line in proc.l1.lines().chain(proc.l2.lines()) {
            diff::assert_eq!(line.bits.local_reads, 0);
            diff::assert_eq!(line.bits.local_writes, 0);
            assert!(!line.supplied);
        }
    }
    assert!(machine.global_table.is_empty());
    diff::assert_eq!(counter(&machine, 0, Counter::RegionsWithWrites), 1);
    diff::assert_eq!(counter(&machine, 1, Counter::RegionsWithWrites), 0);
    Ok(())
}

fn run_mixed(config: config::Config) -> eyre::Result<Machine> {
    let mut machine = machine(config::Config {
        verify_every: 1,
        ..config
    })?;
    for round in 0..6u64 {
        for core in 0..2usize {
            for i in 0..8u64 {
                let addr = ((i * 7 + round * 5 + core as u64) % 24) * 4;
                if (i + round + core as u64) % 3 == 0 {
                    machine.write(core, addr, 4, round * 100 + i);
                } else {
                    machine.read(core, addr, 4);
                }
            }
            if (round + core as u64) % 2 == 0 {
                machine.region_end(core);
            }
        }
    }
    machine.verify()?;
    diff::assert_eq!(machine.stats().counters.get(Counter::RegionBoundaries), 6);
    Ok(machine)
}

#[test]
fn mixed_trace_keeps_invariants() -> eyre::Result<()> {
    run_mixed(testing::configs::mesi(2))?;
    Ok(())
}

#[test]
fn mixed_trace_keeps_invariants_with_plru() -> eyre::Result<()> {
    run_mixed(config::Config {
        use_plru: true,
        ..testing::configs::mesi(2)
    })?;
    Ok(())
}

#[test]
fn mesi_needs_a_supported_core_count() {
    testing::init_logging();
    assert!(Machine::new(testing::configs::mesi(3)).is_err());
}
