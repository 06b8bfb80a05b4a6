use crate::access::offsets;
use crate::address;
use crate::cache::{CacheLevel, CacheLine};

use smallvec::SmallVec;

#[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq)]
pub enum State {
    VALID,
    /// Possibly stale copy that is revalidated by a version check on access.
    INVALID_TENTATIVE,
    #[default]
    INVALID,
}

/// Read and write bytes of one core, valid for the region `epoch`.
#[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq)]
pub struct PerCore {
    pub read: u64,
    pub write: u64,
    pub epoch: u32,
}

impl PerCore {
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read == 0 && self.write == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViserLine {
    addr: Option<address>,
    level: CacheLevel,
    pub state: State,
    pub dirty: bool,
    pub version: u32,
    pub values: SmallVec<[u8; 64]>,
    pub last_writers: SmallVec<[Option<u16>; 64]>,
    metadata: Vec<PerCore>,
    /// Bytes read and later overwritten in the same region, see `backup_values`.
    pub backup: u64,
    /// Values that were actually read at the `backup` offsets.
    pub backup_values: SmallVec<[u8; 64]>,
    pub lock_owner: Option<usize>,
    pub deferred_owner: Option<usize>,
    pub has_aim_md: bool,
    /// Another core committed to the line while this core had written it.
    pub concurrent_remote_write: bool,
}

impl ViserLine {
    #[must_use]
    pub fn blank(level: CacheLevel, line_size: u32, num_cores: usize) -> Self {
        let line_size = line_size as usize;
        Self {
            addr: None,
            level,
            state: State::INVALID,
            dirty: false,
            version: 0,
            values: SmallVec::from_elem(0, line_size),
            last_writers: SmallVec::from_elem(None, line_size),
            metadata: vec![PerCore::default(); num_cores],
            backup: 0,
            backup_values: SmallVec::from_elem(0, line_size),
            lock_owner: None,
            deferred_owner: None,
            has_aim_md: false,
            concurrent_remote_write: false,
        }
    }

    /// A valid line fresh from memory.
    #[must_use]
    pub fn new(addr: address, level: CacheLevel, line_size: u32, num_cores: usize) -> Self {
        Self {
            addr: Some(addr),
            state: State::VALID,
            ..Self::blank(level, line_size, num_cores)
        }
    }

    #[inline]
    #[must_use]
    pub fn line_size(&self) -> usize {
        self.values.len()
    }

    pub fn set_level(&mut self, level: CacheLevel) {
        self.level = level;
    }

    #[inline]
    #[must_use]
    pub fn md(&self, core: usize) -> &PerCore {
        &self.metadata[core]
    }

    /// Metadata of `core` if it belongs to `epoch`.
    #[inline]
    #[must_use]
    pub fn live_md(&self, core: usize, epoch: u32) -> PerCore {
        let md = self.metadata[core];
        if md.epoch == epoch {
            md
        } else {
            PerCore {
                epoch,
                ..PerCore::default()
            }
        }
    }

    /// Metadata of `core` for `epoch`, dropping whatever an older region left.
    pub fn md_mut(&mut self, core: usize, epoch: u32) -> &mut PerCore {
        let md = &mut self.metadata[core];
        if md.epoch != epoch {
            *md = PerCore {
                epoch,
                ..PerCore::default()
            };
        }
        md
    }

    pub fn clear_md(&mut self, core: usize, epoch: u32) {
        self.metadata[core] = PerCore {
            epoch,
            ..PerCore::default()
        };
    }

    #[must_use]
    pub fn has_read_offsets(&self, core: usize, epoch: u32) -> bool {
        self.live_md(core, epoch).read != 0
    }

    #[must_use]
    pub fn has_written_offsets(&self, core: usize, epoch: u32) -> bool {
        self.live_md(core, epoch).write != 0
    }

    /// Whether any core other than `core` has write bits, regardless of epoch.
    #[must_use]
    pub fn written_by_others(&self, core: usize) -> bool {
        self.metadata
            .iter()
            .enumerate()
            .any(|(other, md)| other != core && md.write != 0)
    }

    /// Value this core observed at `offset`, preferring the write-after-read backup.
    #[inline]
    #[must_use]
    pub fn read_value(&self, offset: usize) -> u8 {
        if self.backup & (1 << offset) != 0 {
            self.backup_values[offset]
        } else {
            self.values[offset]
        }
    }

    /// Remembers the current values at `enc` unless already backed up.
    pub fn backup_offsets(&mut self, enc: u64) {
        for off in offsets(enc & !self.backup) {
            self.backup_values[off] = self.values[off];
        }
        self.backup |= enc;
    }

    /// Backs up the values `l1` holds at `enc` unless already backed up.
    pub fn backup_from(&mut self, l1: &ViserLine, enc: u64) {
        for off in offsets(enc & !self.backup) {
            self.backup_values[off] = l1.values[off];
        }
        self.backup |= enc;
    }

    /// Mask with one bit for every byte of the line.
    #[inline]
    #[must_use]
    pub fn full_mask(&self) -> u64 {
        crate::access::encoding(0, self.line_size() as u32)
    }

    pub fn write_bytes(&mut self, offset: u32, bytes: &[u8]) {
        let offset = offset as usize;
        self.values[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn copy_values(&mut self, from: &ViserLine, enc: u64) {
        for off in offsets(enc) {
            self.values[off] = from.values[off];
        }
    }

    pub fn set_last_writer(&mut self, enc: u64, core: usize) {
        for off in offsets(enc) {
            self.last_writers[off] = Some(core as u16);
        }
    }

    /// Clears per-core metadata from regions that have ended.
    ///
    /// Returns whether any core still has live metadata, dropping the AIM
    /// flag otherwise.
    pub fn clear_stale_metadata(&mut self, epochs: &[u32]) -> bool {
        for (core, md) in self.metadata.iter_mut().enumerate() {
            if md.epoch != epochs[core] {
                md.read = 0;
                md.write = 0;
            }
        }
        let live = self.metadata.iter().any(|md| !md.is_empty());
        if !live {
            self.has_aim_md = false;
        }
        live
    }

    /// Copy of this shared line for `core`'s private cache.
    #[must_use]
    pub fn private_copy(
        &self,
        core: usize,
        epoch: u32,
        fetch_read_bits: bool,
        fetch_write_bits: bool,
    ) -> Self {
        let own = self.live_md(core, epoch);
        let mut metadata = vec![PerCore::default(); self.metadata.len()];
        metadata[core] = PerCore {
            read: if fetch_read_bits { own.read } else { 0 },
            write: if fetch_write_bits { own.write } else { 0 },
            epoch,
        };
        let line_size = self.line_size();
        Self {
            addr: self.addr,
            level: CacheLevel::L2,
            state: State::VALID,
            dirty: metadata[core].write != 0,
            version: self.version,
            values: self.values.clone(),
            last_writers: self.last_writers.clone(),
            metadata,
            backup: 0,
            backup_values: SmallVec::from_elem(0, line_size),
            lock_owner: self.lock_owner,
            deferred_owner: None,
            has_aim_md: false,
            concurrent_remote_write: false,
        }
    }

    /// Folds an L1 copy into this L2 line.
    ///
    /// Bytes the L2 line recorded as read that L1 has since overwritten are
    /// backed up first, so validation still compares what was read.
    pub fn merge_from_l1(&mut self, l1: &ViserLine, core: usize, epoch: u32) {
        let l1_md = l1.live_md(core, epoch);
        let md = self.live_md(core, epoch);
        self.backup_offsets(l1_md.write & md.read & !md.write);
        self.copy_values(l1, l1_md.write | (l1_md.read & !md.write));
        let md = self.md_mut(core, epoch);
        md.read |= l1_md.read;
        md.write |= l1_md.write;
        self.dirty |= l1.dirty;
        self.concurrent_remote_write |= l1.concurrent_remote_write;
    }

    /// Returns to a valid state after post-commit, keeping address and values.
    pub fn reset_after_commit(&mut self, core: usize, next_epoch: u32) {
        self.clear_md(core, next_epoch);
        self.dirty = false;
        self.backup = 0;
        self.concurrent_remote_write = false;
    }
}

impl CacheLine for ViserLine {
    fn addr(&self) -> Option<address> {
        self.addr
    }

    fn level(&self) -> CacheLevel {
        self.level
    }

    fn is_valid(&self) -> bool {
        self.state == State::VALID
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn invalidate(&mut self) {
        self.state = State::INVALID;
        self.dirty = false;
        self.backup = 0;
        self.concurrent_remote_write = false;
        for md in &mut self.metadata {
            md.read = 0;
            md.write = 0;
        }
    }

    fn has_aim_metadata(&self) -> bool {
        self.has_aim_md
    }

    fn has_live_metadata(&self, epochs: &[u32]) -> bool {
        self.metadata
            .iter()
            .zip(epochs)
            .any(|(md, &epoch)| md.epoch == epoch && !md.is_empty())
    }
}

impl std::fmt::Display for ViserLine {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{:?}@{:?} {:?} v{}",
            self.addr, self.level, self.state, self.version
        )?;
        for (core, md) in self.metadata.iter().enumerate() {
            if !md.is_empty() {
                write!(f, " c{core}[r={:#x} w={:#x} e={}]", md.read, md.write, md.epoch)?;
            }
        }
        if let Some(owner) = self.deferred_owner {
            write!(f, " deferred to {owner}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{State, ViserLine};
    use crate::cache::{CacheLevel, CacheLine};
    use pretty_assertions_sorted as diff;

    #[test]
    fn stale_metadata_is_dropped() {
        let mut line = ViserLine::new(64, CacheLevel::L3, 4, 2);
        line.md_mut(0, 1).read = 0b11;
        line.md_mut(1, 1).write = 0b1;
        line.has_aim_md = true;

        // core 0 moved on to region 2
        assert!(line.clear_stale_metadata(&[2, 1]));
        diff::assert_eq!(line.md(0).read, 0);
        diff::assert_eq!(line.md(1).write, 1);
        assert!(line.has_aim_md);

        assert!(!line.clear_stale_metadata(&[2, 2]));
        assert!(!line.has_aim_md);
    }

    #[test]
    fn md_mut_resets_old_epoch() {
        let mut line = ViserLine::new(64, CacheLevel::L2, 4, 1);
        line.md_mut(0, 1).read = 0b1;
        diff::assert_eq!(line.live_md(0, 2).read, 0);
        diff::assert_eq!(line.md_mut(0, 2).read, 0);
        diff::assert_eq!(line.md(0).epoch, 2);
    }

    #[test]
    fn merge_backs_up_overwritten_reads() {
        let mut l2 = ViserLine::new(64, CacheLevel::L2, 4, 1);
        l2.write_bytes(0, &[7, 7, 7, 7]);
        l2.md_mut(0, 1).read = 0b0011;

        let mut l1 = l2.clone();
        l1.set_level(CacheLevel::L1);
        l1.clear_md(0, 1);
        l1.md_mut(0, 1).write = 0b0110;
        l1.write_bytes(1, &[9, 9]);
        l1.dirty = true;

        l2.merge_from_l1(&l1, 0, 1);
        diff::assert_eq!(l2.md(0).read, 0b0011);
        diff::assert_eq!(l2.md(0).write, 0b0110);
        diff::assert_eq!(l2.values.as_slice(), &[7, 9, 9, 7]);
        diff::assert_eq!(l2.backup, 0b0010);
        diff::assert_eq!(l2.read_value(1), 7);
        diff::assert_eq!(l2.read_value(2), 9);
        assert!(l2.is_dirty());
    }

    #[test]
    fn invalidate_keeps_address() {
        let mut line = ViserLine::new(64, CacheLevel::L1, 4, 1);
        line.md_mut(0, 1).write = 1;
        line.invalidate();
        diff::assert_eq!(line.state, State::INVALID);
        diff::assert_eq!(line.addr(), Some(64));
        assert!(line.live_md(0, 1).is_empty());
    }
}
