#![allow(non_camel_case_types, clippy::upper_case_acronyms)]

pub mod cache;
pub mod counters;

pub use cache::{AccessKind, Cache, Event, PerCache};
pub use counters::{Counter, Counters};

use serde::{Deserialize, Serialize};

/// Statistics of a single simulated core.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Processor {
    pub l1: Cache,
    pub l2: Cache,
    /// Accesses this core made to the shared last level cache.
    pub l3: Cache,
    /// Accesses this core made to the AIM cache.
    pub aim: Cache,
    pub counters: Counters,
}

impl std::ops::AddAssign for Processor {
    fn add_assign(&mut self, other: Self) {
        self.l1 += other.l1;
        self.l2 += other.l2;
        self.l3 += other.l3;
        self.aim += other.aim;
        self.counters += other.counters;
    }
}

#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub l1: PerCache,
    pub l2: PerCache,
    pub l3: PerCache,
    pub aim: PerCache,
    pub counters: Counters,
}

impl Machine {
    #[must_use]
    pub fn new<'a>(processors: impl IntoIterator<Item = &'a Processor>) -> Self {
        let mut out = Self::default();
        for (id, proc) in processors.into_iter().enumerate() {
            out.l1.insert(id, proc.l1.clone());
            out.l2.insert(id, proc.l2.clone());
            out.l3.insert(id, proc.l3.clone());
            out.aim.insert(id, proc.aim.clone());
            out.counters += proc.counters.clone();
        }
        out
    }
}
