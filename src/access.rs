use crate::address;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Memory operation kinds delivered by the trace frontend.
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
pub enum AccessType {
    MEMORY_READ,
    MEMORY_WRITE,
    ATOMIC_READ,
    ATOMIC_WRITE,
    LOCK_ACQ_READ,
    LOCK_ACQ_WRITE,
    LOCK_REL_WRITE,
}

impl AccessType {
    #[inline]
    #[must_use]
    pub fn is_read(self) -> bool {
        matches!(
            self,
            Self::MEMORY_READ | Self::ATOMIC_READ | Self::LOCK_ACQ_READ
        )
    }

    #[inline]
    #[must_use]
    pub fn is_write(self) -> bool {
        !self.is_read()
    }

    #[inline]
    #[must_use]
    pub fn is_regular(self) -> bool {
        matches!(self, Self::MEMORY_READ | Self::MEMORY_WRITE)
    }

    #[inline]
    #[must_use]
    pub fn is_atomic(self) -> bool {
        matches!(self, Self::ATOMIC_READ | Self::ATOMIC_WRITE)
    }

    #[inline]
    #[must_use]
    pub fn is_lock(self) -> bool {
        matches!(
            self,
            Self::LOCK_ACQ_READ | Self::LOCK_ACQ_WRITE | Self::LOCK_REL_WRITE
        )
    }

    /// Folds atomic accesses into plain memory accesses.
    #[must_use]
    pub fn as_regular(self) -> Self {
        match self {
            Self::ATOMIC_READ => Self::MEMORY_READ,
            Self::ATOMIC_WRITE => Self::MEMORY_WRITE,
            other => other,
        }
    }

    /// Counter of all accesses of this kind.
    #[must_use]
    pub fn total_counter(self) -> stats::Counter {
        use stats::Counter;
        match self {
            Self::MEMORY_READ => Counter::TotalReads,
            Self::MEMORY_WRITE => Counter::TotalWrites,
            Self::ATOMIC_READ => Counter::TotalAtomicReads,
            Self::ATOMIC_WRITE => Counter::TotalAtomicWrites,
            Self::LOCK_ACQ_READ => Counter::TotalLockReads,
            Self::LOCK_ACQ_WRITE | Self::LOCK_REL_WRITE => Counter::TotalLockWrites,
        }
    }

    #[must_use]
    pub fn stats_kind(self) -> stats::AccessKind {
        if self.is_lock() {
            stats::AccessKind::Lock
        } else if self.is_atomic() {
            stats::AccessKind::Atomic
        } else {
            stats::AccessKind::Regular
        }
    }
}

/// Synchronization events that delimit regions.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncEvent {
    LOCK_ACQUIRE,
    LOCK_RELEASE,
    THREAD_START,
    THREAD_FINISH,
    THREAD_SPAWN,
    THREAD_JOIN,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum Semantics {
    REG_BEGIN,
    REG_END,
}

/// A memory access by one core, possibly spanning several lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub core: usize,
    pub addr: address,
    pub size: u32,
    pub kind: AccessType,
    /// Value written, stored little endian over the accessed bytes.
    pub value: u64,
}

impl Access {
    #[must_use]
    pub fn read(core: usize, addr: address, size: u32) -> Self {
        Self {
            core,
            addr,
            size,
            kind: AccessType::MEMORY_READ,
            value: 0,
        }
    }

    #[must_use]
    pub fn write(core: usize, addr: address, size: u32, value: u64) -> Self {
        Self {
            core,
            addr,
            size,
            kind: AccessType::MEMORY_WRITE,
            value,
        }
    }

    #[must_use]
    pub fn with_kind(mut self, kind: AccessType) -> Self {
        self.kind = kind;
        self
    }

    /// Folds atomics into plain accesses if configured and resizes lock
    /// accesses to the modeled lock word.
    #[must_use]
    pub fn normalize(self, config: &crate::config::Config) -> Self {
        let mut kind = self.kind;
        if config.treat_atomic_updates_as_regular_accesses {
            kind = kind.as_regular();
        }
        let size = if kind.is_lock() {
            config.lock_address_size
        } else {
            self.size
        };
        Self { kind, size, ..self }
    }

    /// Splits the access at line boundaries.
    #[must_use]
    pub fn split(&self, line_size: u32) -> SmallVec<[LineAccess; 2]> {
        let value = self.value.to_le_bytes();
        let mut out = SmallVec::new();
        let mut addr = self.addr;
        let mut done = 0;
        while done < self.size {
            let offset = (addr & u64::from(line_size - 1)) as u32;
            let size = (line_size - offset).min(self.size - done);
            let bytes = (done..done + size)
                .map(|i| value.get(i as usize).copied().unwrap_or(0))
                .collect();
            out.push(LineAccess {
                line_addr: addr - u64::from(offset),
                offset,
                size,
                bytes,
            });
            done += size;
            addr += u64::from(size);
        }
        out
    }
}

/// The part of an access that falls into a single line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineAccess {
    pub line_addr: address,
    pub offset: u32,
    pub size: u32,
    pub bytes: SmallVec<[u8; 8]>,
}

impl LineAccess {
    #[inline]
    #[must_use]
    pub fn encoding(&self) -> u64 {
        encoding(self.offset, self.size)
    }
}

/// One bit per byte accessed, bit `i` standing for line offset `i`.
#[inline]
#[must_use]
pub fn encoding(offset: u32, size: u32) -> u64 {
    let mask = if size >= 64 {
        u64::MAX
    } else {
        (1u64 << size) - 1
    };
    mask << offset
}

/// Iterates the offsets set in an encoding.
pub fn offsets(enc: u64) -> impl Iterator<Item = usize> {
    (0..64usize).filter(move |i| enc & (1u64 << *i) != 0)
}
