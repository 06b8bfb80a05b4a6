use crate::address;
use crate::cache::{CacheLevel, CacheLine};

#[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq)]
pub enum State {
    MODIFIED,
    EXCLUSIVE,
    SHARED,
    #[default]
    INVALID,
}

impl State {
    /// Whether the holder may write without asking the other cores.
    #[inline]
    #[must_use]
    pub fn is_exclusive(self) -> bool {
        matches!(self, Self::MODIFIED | Self::EXCLUSIVE)
    }
}

/// Access bits of one core in its current region.
///
/// Remote bits are what other cores reported when this core fetched or
/// upgraded the line, minus whatever they retracted at their region end.
#[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq)]
pub struct AccessBits {
    pub local_reads: u64,
    pub local_writes: u64,
    pub remote_reads: u64,
    pub remote_writes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MesiLine {
    addr: Option<address>,
    level: CacheLevel,
    /// A shared cache line stays valid while its coherence state is `INVALID`.
    valid: bool,
    pub state: State,
    pub dirty: bool,
    pub bits: AccessBits,
    /// Another core took this line's access bits, so its region end must be announced.
    pub supplied: bool,
    /// Shared cache copy that memory also holds.
    pub in_memory: bool,
    pub has_aim_md: bool,
}

impl MesiLine {
    #[must_use]
    pub fn blank(level: CacheLevel) -> Self {
        Self {
            addr: None,
            level,
            valid: false,
            state: State::INVALID,
            dirty: false,
            bits: AccessBits::default(),
            supplied: false,
            in_memory: false,
            has_aim_md: false,
        }
    }

    /// A valid line without any private holder.
    #[must_use]
    pub fn new(addr: address, level: CacheLevel) -> Self {
        Self {
            addr: Some(addr),
            valid: true,
            ..Self::blank(level)
        }
    }

    /// A private copy of the shared line in `state`.
    #[must_use]
    pub fn private(addr: address, state: State) -> Self {
        assert_ne!(state, State::INVALID, "private line {addr} filled invalid");
        Self {
            state,
            ..Self::new(addr, CacheLevel::L2)
        }
    }

    pub fn set_level(&mut self, level: CacheLevel) {
        self.level = level;
    }

    pub fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    #[inline]
    #[must_use]
    pub fn has_local_bits(&self) -> bool {
        self.bits.local_reads != 0 || self.bits.local_writes != 0
    }

    /// Drops the bits of a region that ended.
    pub fn clear_region_metadata(&mut self) {
        self.bits.local_reads = 0;
        self.bits.local_writes = 0;
        self.supplied = false;
    }

    /// Forgets the bits a remote core retracted at its region end.
    ///
    /// Returns whether anything was cleared.
    pub fn retract_remote(&mut self, reads: u64, writes: u64) -> bool {
        let before = self.bits;
        self.bits.remote_reads &= !reads;
        self.bits.remote_writes &= !writes;
        before != self.bits
    }
}

impl CacheLine for MesiLine {
    fn addr(&self) -> Option<address> {
        self.addr
    }

    fn level(&self) -> CacheLevel {
        self.level
    }

    fn is_valid(&self) -> bool {
        self.valid
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Keeps the access bits, an invalidated copy still speaks for its
    /// core until the region ends.
    fn invalidate(&mut self) {
        self.valid = false;
        self.state = State::INVALID;
        self.dirty = false;
    }

    fn has_aim_metadata(&self) -> bool {
        self.has_aim_md
    }

    fn has_live_metadata(&self, _epochs: &[u32]) -> bool {
        self.has_local_bits()
    }
}

impl std::fmt::Display for MesiLine {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}@{:?} {:?}", self.addr, self.level, self.state)?;
        let bits = &self.bits;
        if *bits != AccessBits::default() {
            write!(
                f,
                " [lr={:#x} lw={:#x} rr={:#x} rw={:#x}]",
                bits.local_reads, bits.local_writes, bits.remote_reads, bits.remote_writes
            )?;
        }
        if self.supplied {
            write!(f, " supplied")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{MesiLine, State};
    use crate::cache::{CacheLevel, CacheLine};
    use pretty_assertions_sorted as diff;

    #[test]
    fn invalidated_private_line_keeps_its_bits() {
        let mut line = MesiLine::private(8, State::MODIFIED);
        line.bits.local_writes = 0b10;
        line.dirty = true;
        line.invalidate();
        assert!(!line.is_valid());
        assert!(!line.is_dirty());
        diff::assert_eq!(line.state, State::INVALID);
        diff::assert_eq!(line.bits.local_writes, 0b10);
        diff::assert_eq!(line.addr(), Some(8));
    }

    #[test]
    fn retract_only_clears_matching_bits() {
        let mut line = MesiLine::private(8, State::SHARED);
        line.bits.remote_reads = 0b0110;
        line.bits.remote_writes = 0b1000;
        assert!(line.retract_remote(0b0010, 0));
        diff::assert_eq!(line.bits.remote_reads, 0b0100);
        diff::assert_eq!(line.bits.remote_writes, 0b1000);
        assert!(!line.retract_remote(0b0001, 0b0001));
    }

    #[test]
    fn shared_line_can_be_valid_without_holders() {
        let line = MesiLine::new(8, CacheLevel::L3);
        assert!(line.is_valid());
        diff::assert_eq!(line.state, State::INVALID);
    }
}
