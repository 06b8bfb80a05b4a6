pub mod hierarchical;
pub mod policy;

pub use hierarchical::{HierarchicalCache, Slot};
pub use policy::{CleanFirst, EvictionPolicy, Replacement};

use crate::address;

use serde::{Deserialize, Serialize};

/// Levels of the simulated memory hierarchy, ordered from the core outwards.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CacheLevel {
    L1,
    L2,
    L3,
    MEMORY,
}

impl CacheLevel {
    #[must_use]
    pub fn is_private(self) -> bool {
        matches!(self, Self::L1 | Self::L2)
    }
}

impl std::fmt::Display for CacheLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// State shared by the line types of both protocols.
pub trait CacheLine: std::fmt::Debug + Clone {
    /// Line aligned address, `None` for a slot that never held a line.
    #[must_use]
    fn addr(&self) -> Option<address>;

    #[must_use]
    fn level(&self) -> CacheLevel;

    #[must_use]
    fn is_valid(&self) -> bool;

    /// Whether evicting the line writes back modified data.
    #[must_use]
    fn is_dirty(&self) -> bool;

    /// Drops the line's validity but keeps its address.
    fn invalidate(&mut self);

    #[must_use]
    fn has_aim_metadata(&self) -> bool;

    /// Whether any core has read or written the line in its current region.
    #[must_use]
    fn has_live_metadata(&self, epochs: &[u32]) -> bool;

    #[inline]
    #[must_use]
    fn holds(&self, addr: address) -> bool {
        self.addr() == Some(addr)
    }
}
