#![allow(
    clippy::upper_case_acronyms,
    non_camel_case_types,
    clippy::too_many_arguments,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::too_many_lines,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap
)]

pub mod access;
pub mod aim;
pub mod bloom;
pub mod cache;
pub mod config;
pub mod mesi;
pub mod shared;
pub mod trace;
pub mod verify;
pub mod viser;

#[cfg(test)]
pub mod testing;

pub use access::{Access, AccessType, Semantics, SyncEvent};

pub type address = u64;

/// Which accesses overlapped, local access first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictKind {
    /// Local write against a remote read.
    WR,
    /// Local write against a remote write.
    WW,
    /// Local read against a remote write.
    RW,
}

impl ConflictKind {
    #[must_use]
    pub fn counter(self) -> stats::Counter {
        match self {
            Self::WR => stats::Counter::WRPreciseConflicts,
            Self::WW => stats::Counter::WWPreciseConflicts,
            Self::RW => stats::Counter::RWPreciseConflicts,
        }
    }
}

/// A simulated multicore memory system driven by trace events.
pub trait Simulator {
    #[must_use]
    fn num_cores(&self) -> usize;

    fn access(&mut self, access: Access);

    fn process_region_boundary(&mut self, core: usize, event: SyncEvent, semantics: Semantics);

    fn insns_executed(&mut self, core: usize, count: u64);

    #[must_use]
    fn stats(&self) -> stats::Machine;

    /// Checks cache invariants, see [`verify::Violation`].
    fn verify(&self) -> Result<(), verify::Violation>;
}

/// Builds the machine for the configured protocol.
pub fn build(config: config::Config) -> Result<Box<dyn Simulator>, config::Error> {
    Ok(match config.protocol {
        config::Protocol::Viser => Box::new(viser::Machine::new(config)?),
        config::Protocol::Mesi => Box::new(mesi::Machine::new(config)?),
    })
}
