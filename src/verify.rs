//! Invariant checks run by tests and, optionally, every few events.

use crate::address;
use crate::cache::{CacheLevel, CacheLine, HierarchicalCache};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    #[error("{level} set {set} holds {len} lines")]
    Associativity {
        level: &'static str,
        set: usize,
        len: usize,
    },
    #[error("{level} set {set} holds {addr} twice")]
    DuplicateTag {
        level: String,
        set: usize,
        addr: address,
    },
    #[error("AIM entry {addr} is not resident in the LLC")]
    AimNotInLlc { addr: address },
    #[error("core {core}: L1 line {addr} {reason}")]
    Inclusivity {
        core: usize,
        addr: address,
        reason: String,
    },
    #[error("line {addr} is resident in both the LLC and memory")]
    ResidentTwice { addr: address },
    #[error("LLC line {addr} is deferred to core {owner} which does not hold it")]
    DeferredNotResident { addr: address, owner: usize },
    #[error("core {core}: {level} line {addr} carries metadata of region {stamp} during region {epoch}")]
    StaleMetadata {
        core: usize,
        level: CacheLevel,
        addr: address,
        stamp: u32,
        epoch: u32,
    },
    #[error("line {addr} is exclusive to core {owner} but core {other} holds a copy")]
    MultipleOwners {
        addr: address,
        owner: usize,
        other: usize,
    },
    #[error("core {core}: private line {addr} is not resident in the LLC")]
    NotInLlc { core: usize, addr: address },
    #[error("LLC line {addr} is {llc} but the private copies imply {expected}")]
    LlcState {
        addr: address,
        llc: String,
        expected: String,
    },
    #[error("core {core}: {level} line {addr} is ahead of the shared copy ({private} > {shared})")]
    VersionAhead {
        core: usize,
        level: CacheLevel,
        addr: address,
        private: u32,
        shared: u32,
    },
}

/// Every set keeps its associativity and no valid address appears twice.
pub fn verify_sets<L>(cache: &HierarchicalCache<L>, name: &str) -> Result<(), Violation>
where
    L: CacheLine,
{
    for (set_idx, set) in cache.sets().enumerate() {
        if set.len() != cache.config.associativity {
            return Err(Violation::Associativity {
                level: "cache",
                set: set_idx,
                len: set.len(),
            });
        }
        let mut seen = std::collections::HashSet::new();
        for addr in set.iter().filter_map(CacheLine::addr) {
            if !seen.insert(addr) {
                return Err(Violation::DuplicateTag {
                    level: name.to_string(),
                    set: set_idx,
                    addr,
                });
            }
        }
    }
    Ok(())
}
