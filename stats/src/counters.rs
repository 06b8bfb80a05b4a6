use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::IntoEnumIterator;

/// Protocol event counters.
///
/// Printed with a `pc_` prefix, e.g. `pc_PreciseConflicts`.
#[derive(
    Debug,
    strum::EnumIter,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub enum Counter {
    TotalMemoryAccesses,
    TotalReads,
    TotalWrites,
    TotalAtomicReads,
    TotalAtomicWrites,
    TotalLockReads,
    TotalLockWrites,
    InstructionsExecuted,

    PreciseConflicts,
    WRPreciseConflicts,
    WWPreciseConflicts,
    RWPreciseConflicts,
    RegionBodyPreciseConflicts,
    PreCommitPreciseConflicts,
    ReadValidationPreciseConflicts,
    RegionsWithExceptions,

    ValidationAttempts,
    FailedValidations,
    RegionsWithFRVs,
    PotentialWrRdValConflicts,
    ReadValidationRetries,
    ValidatedLines,
    BloomFilterSkippedLines,

    RegionBoundaries,
    RegionsWithWrites,
    RegionHasDirtyEviction,
    LinesKeptAfterCommit,
    LinesInvalidatedAfterCommit,
    ViserWARUpgrades,
    DeferredLineFetches,
    DeferredWriteBacks,
    InvalidStateHits,
    InvalidStateFailures,
    LockOwnershipTransfers,
    NumScavenges,
    ScavengedLines,

    MESIReadRemoteHits,
    MESIWriteRemoteHits,
    MESIUpgradeMisses,
    ModifiedLineFetches,
    CEEndOfRegionMessages,
}

impl Counter {
    /// Whether the counter tracks detected conflicts or failed validations.
    #[must_use]
    pub fn is_conflict(self) -> bool {
        matches!(
            self,
            Self::PreciseConflicts
                | Self::WRPreciseConflicts
                | Self::WWPreciseConflicts
                | Self::RWPreciseConflicts
                | Self::RegionBodyPreciseConflicts
                | Self::PreCommitPreciseConflicts
                | Self::ReadValidationPreciseConflicts
                | Self::RegionsWithExceptions
                | Self::FailedValidations
        )
    }
}

impl std::fmt::Display for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "pc_{self:?}")
    }
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters(pub HashMap<Counter, usize>);

impl Counters {
    #[inline]
    pub fn inc(&mut self, counter: Counter, amount: usize) {
        *self.0.entry(counter).or_insert(0) += amount;
    }

    #[must_use]
    pub fn get(&self, counter: Counter) -> usize {
        self.0.get(&counter).copied().unwrap_or(0)
    }

    /// All counters in declaration order, including zero ones.
    pub fn iter(&self) -> impl Iterator<Item = (Counter, usize)> + '_ {
        Counter::iter().map(|counter| (counter, self.get(counter)))
    }
}

impl std::ops::AddAssign for Counters {
    fn add_assign(&mut self, other: Self) {
        for (k, v) in other.0 {
            *self.0.entry(k).or_insert(0) += v;
        }
    }
}

impl std::fmt::Debug for Counters {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut out = f.debug_struct("Counters");
        for (counter, count) in self.iter().filter(|(_, count)| *count > 0) {
            out.field(&counter.to_string(), &count);
        }
        out.finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::{Counter, Counters};

    #[test]
    fn counter_names() {
        assert_eq!(Counter::PreciseConflicts.to_string(), "pc_PreciseConflicts");
        assert_eq!(
            Counter::WRPreciseConflicts.to_string(),
            "pc_WRPreciseConflicts"
        );
    }

    #[test]
    fn add_assign_merges() {
        let mut a = Counters::default();
        a.inc(Counter::RegionBoundaries, 2);
        let mut b = Counters::default();
        b.inc(Counter::RegionBoundaries, 1);
        b.inc(Counter::NumScavenges, 1);
        a += b;
        assert_eq!(a.get(Counter::RegionBoundaries), 3);
        assert_eq!(a.get(Counter::NumScavenges), 1);
        assert_eq!(a.get(Counter::FailedValidations), 0);
    }
}
