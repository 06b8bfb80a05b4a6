use crate::address;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Widest supported line, one encoding bit per byte in a `u64`.
pub const MAX_LINE_SIZE: u32 = 64;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{level}: {what} ({value}) must be a power of two")]
    NotPowerOfTwo {
        level: &'static str,
        what: &'static str,
        value: usize,
    },
    #[error("{level}: {size} bytes cannot hold {associativity} lines of {line_size} bytes")]
    TooSmall {
        level: &'static str,
        size: usize,
        line_size: u32,
        associativity: usize,
    },
    #[error("line size {0} exceeds the maximum of 64 bytes")]
    LineTooLarge(u32),
    #[error("all cache levels must share one line size (L1={l1}, L2={l2}, L3={l3})")]
    LineSizeMismatch { l1: u32, l2: u32, l3: u32 },
    #[error("no AIM metadata size for {num_cores} cores")]
    UnsupportedCoreCount { num_cores: usize },
    #[error("the AIM cache is enabled but has {0} lines")]
    EmptyAimCache(usize),
    #[error("lock address size {0} must be between 1 and the line size")]
    LockAddressSize(u32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Viser,
    Mesi,
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "viser" => Ok(Self::Viser),
            "mesi" | "ce" => Ok(Self::Mesi),
            other => Err(format!("unknown protocol {other:?}")),
        }
    }
}

/// Geometry of one set-associative cache level.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cache {
    /// Capacity in bytes.
    pub size: usize,
    pub line_size: u32,
    pub associativity: usize,
}

impl std::fmt::Display for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let size = human_bytes::human_bytes(self.size as f64);
        write!(
            f,
            "{size} ({} set, {}-way, {} byte line)",
            self.num_sets(),
            self.associativity,
            self.line_size
        )
    }
}

impl Cache {
    #[must_use]
    pub fn new(size: usize, line_size: u32, associativity: usize) -> Self {
        Self {
            size,
            line_size,
            associativity,
        }
    }

    /// Number of lines in total.
    #[inline]
    #[must_use]
    pub fn total_lines(&self) -> usize {
        self.size / self.line_size as usize
    }

    #[inline]
    #[must_use]
    pub fn num_sets(&self) -> usize {
        self.total_lines() / self.associativity
    }

    #[inline]
    #[must_use]
    pub fn line_size_log2(&self) -> u32 {
        self.line_size.trailing_zeros()
    }

    /// Line aligned address.
    #[inline]
    #[must_use]
    pub fn line_addr(&self, addr: address) -> address {
        addr & !u64::from(self.line_size - 1)
    }

    /// Byte offset of `addr` within its line.
    #[inline]
    #[must_use]
    pub fn offset(&self, addr: address) -> u32 {
        (addr & u64::from(self.line_size - 1)) as u32
    }

    #[inline]
    #[must_use]
    pub fn set_index(&self, addr: address) -> usize {
        ((addr >> self.line_size_log2()) & (self.num_sets() as u64 - 1)) as usize
    }

    fn validate(&self, level: &'static str) -> Result<(), Error> {
        if !self.line_size.is_power_of_two() {
            return Err(Error::NotPowerOfTwo {
                level,
                what: "line size",
                value: self.line_size as usize,
            });
        }
        if self.line_size > MAX_LINE_SIZE {
            return Err(Error::LineTooLarge(self.line_size));
        }
        if self.associativity == 0 || self.total_lines() < self.associativity {
            return Err(Error::TooSmall {
                level,
                size: self.size,
                line_size: self.line_size,
                associativity: self.associativity,
            });
        }
        if !self.num_sets().is_power_of_two() {
            return Err(Error::NotPowerOfTwo {
                level,
                what: "number of sets",
                value: self.num_sets(),
            });
        }
        Ok(())
    }
}

/// Geometry of the AIM cache.
///
/// The AIM is indexed with its own (coarser) line size, while entries are
/// tagged with the address of the shared cache line they shadow.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aim {
    pub num_lines: usize,
    pub associativity: usize,
    pub line_size: u32,
}

impl Default for Aim {
    fn default() -> Self {
        Self {
            num_lines: 32 * 1024,
            associativity: 4,
            line_size: 64,
        }
    }
}

impl Aim {
    #[inline]
    #[must_use]
    pub fn num_sets(&self) -> usize {
        self.num_lines / self.associativity
    }

    #[inline]
    #[must_use]
    pub fn set_index(&self, addr: address) -> usize {
        ((addr >> self.line_size.trailing_zeros()) & (self.num_sets() as u64 - 1)) as usize
    }
}

/// Bytes of metadata the AIM tracks per line, by core count.
static VISER_METADATA_BYTES: Lazy<HashMap<usize, usize>> = Lazy::new(|| {
    HashMap::from([(1, 20), (2, 36), (4, 60), (8, 100), (16, 172), (32, 308)])
});

static MESI_METADATA_BYTES: Lazy<HashMap<usize, usize>> = Lazy::new(|| {
    HashMap::from([(1, 16), (2, 32), (4, 56), (8, 96), (16, 168), (32, 304)])
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct Config {
    pub protocol: Protocol,
    pub num_cores: usize,
    pub l1: Cache,
    pub l2: Cache,
    pub l3: Cache,

    pub use_aim_cache: bool,
    pub aim: Aim,
    /// Flash clear AIM entries without live metadata at region boundaries.
    pub clear_aim_cache_at_region_boundaries: bool,

    /// Pseudo LRU replacement in all levels instead of true LRU.
    pub use_plru: bool,
    /// Prefer evicting L2 lines without writes until the region evicted a dirty line.
    pub evict_clean_line_first: bool,

    pub defer_write_backs: bool,
    pub always_invalidate_read_only_lines: bool,
    pub invalidate_written_lines_only_after_version_check: bool,
    pub invalidate_untouched_lines_optimization: bool,
    pub use_special_invalid_state: bool,
    pub use_bloom_filter: bool,
    pub skip_validating_read_lines: bool,
    pub bloom_filter_bits: usize,
    pub bloom_filter_hashes: usize,

    pub ignore_fetching_read_bits: bool,
    pub ignore_fetching_write_bits: bool,
    pub ignore_fetching_deferred_lines_during_read_validation: bool,

    pub treat_atomic_updates_as_regular_accesses: bool,
    /// Size of a modeled lock word in bytes.
    pub lock_address_size: u32,

    /// Backing memory size (in lines) that triggers a scavenge.
    pub scavenge_threshold: usize,
    /// Upper bound on read validation passes per region end.
    pub max_validation_rounds: usize,
    /// Run the verification pass every this many events (0 disables).
    pub verify_every: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protocol: Protocol::Viser,
            num_cores: 8,
            l1: Cache::new(32 * 1024, 64, 8),
            l2: Cache::new(256 * 1024, 64, 8),
            l3: Cache::new(8 * 1024 * 1024, 64, 16),
            use_aim_cache: true,
            aim: Aim::default(),
            clear_aim_cache_at_region_boundaries: false,
            use_plru: false,
            evict_clean_line_first: false,
            defer_write_backs: false,
            always_invalidate_read_only_lines: false,
            invalidate_written_lines_only_after_version_check: true,
            invalidate_untouched_lines_optimization: false,
            use_special_invalid_state: false,
            use_bloom_filter: false,
            skip_validating_read_lines: false,
            bloom_filter_bits: 4096,
            bloom_filter_hashes: 2,
            ignore_fetching_read_bits: false,
            ignore_fetching_write_bits: false,
            ignore_fetching_deferred_lines_during_read_validation: false,
            treat_atomic_updates_as_regular_accesses: false,
            lock_address_size: 2,
            scavenge_threshold: 100_000,
            max_validation_rounds: 64,
            verify_every: 0,
        }
    }
}

impl Config {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let reader = std::io::BufReader::new(std::fs::File::open(path.as_ref())?);
        let config: Self = serde_yaml::from_reader(reader)?;
        Ok(config)
    }

    #[inline]
    #[must_use]
    pub fn line_size(&self) -> u32 {
        self.l1.line_size
    }

    /// Bytes of metadata per line the AIM cache stands in for.
    pub fn aim_metadata_line_size(&self) -> Result<usize, Error> {
        let table = match self.protocol {
            Protocol::Viser => &VISER_METADATA_BYTES,
            Protocol::Mesi => &MESI_METADATA_BYTES,
        };
        table
            .get(&self.num_cores)
            .copied()
            .ok_or(Error::UnsupportedCoreCount {
                num_cores: self.num_cores,
            })
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !self.num_cores.is_power_of_two() {
            return Err(Error::NotPowerOfTwo {
                level: "machine",
                what: "number of cores",
                value: self.num_cores,
            });
        }
        self.l1.validate("L1")?;
        self.l2.validate("L2")?;
        self.l3.validate("L3")?;
        if self.l1.line_size != self.l2.line_size || self.l2.line_size != self.l3.line_size {
            return Err(Error::LineSizeMismatch {
                l1: self.l1.line_size,
                l2: self.l2.line_size,
                l3: self.l3.line_size,
            });
        }
        if self.lock_address_size == 0 || self.lock_address_size > self.line_size() {
            return Err(Error::LockAddressSize(self.lock_address_size));
        }
        if self.use_aim_cache {
            if self.aim.num_lines == 0 || self.aim.associativity == 0 {
                return Err(Error::EmptyAimCache(self.aim.num_lines));
            }
            if !self.aim.num_sets().is_power_of_two() {
                return Err(Error::NotPowerOfTwo {
                    level: "AIM",
                    what: "number of sets",
                    value: self.aim.num_sets(),
                });
            }
            if !self.aim.line_size.is_power_of_two() {
                return Err(Error::NotPowerOfTwo {
                    level: "AIM",
                    what: "line size",
                    value: self.aim.line_size as usize,
                });
            }
            self.aim_metadata_line_size()?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "{:?} with {} cores", self.protocol, self.num_cores)?;
        writeln!(f, "  L1: {}", self.l1)?;
        writeln!(f, "  L2: {}", self.l2)?;
        write!(f, "  L3: {}", self.l3)?;
        if self.use_aim_cache {
            write!(
                f,
                "\n  AIM: {} lines ({}-way)",
                self.aim.num_lines, self.aim.associativity
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Cache, Config, Error, Protocol};
    use color_eyre::eyre;
    use pretty_assertions_sorted as diff;

    #[test]
    fn set_index_and_offsets() {
        let cache = Cache::new(16, 4, 2);
        diff::assert_eq!(cache.num_sets(), 2);
        diff::assert_eq!(cache.line_addr(66), 64);
        diff::assert_eq!(cache.offset(66), 2);
        diff::assert_eq!(cache.set_index(64), 0);
        diff::assert_eq!(cache.set_index(68), 1);
        diff::assert_eq!(cache.set_index(80), 0);
    }

    #[test]
    fn default_config_is_valid() -> eyre::Result<()> {
        Config::default().validate()?;
        Ok(())
    }

    #[test]
    fn rejects_unsupported_core_count() {
        let config = Config {
            num_cores: 64,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::UnsupportedCoreCount { num_cores: 64 })
        ));

        let config = Config {
            num_cores: 3,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::NotPowerOfTwo { .. })));
    }

    #[test]
    fn rejects_bad_geometry() {
        let config = Config {
            l2: Cache::new(48, 4, 2),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn metadata_sizes() -> eyre::Result<()> {
        let mut config = Config {
            num_cores: 4,
            ..Config::default()
        };
        diff::assert_eq!(config.aim_metadata_line_size()?, 60);
        config.protocol = Protocol::Mesi;
        diff::assert_eq!(config.aim_metadata_line_size()?, 56);
        Ok(())
    }

    #[test]
    fn parses_partial_yaml() -> eyre::Result<()> {
        let yaml = "protocol: mesi\nnum_cores: 2\nuse_plru: true\n";
        let config: Config = serde_yaml::from_str(yaml)?;
        diff::assert_eq!(config.protocol, Protocol::Mesi);
        diff::assert_eq!(config.num_cores, 2);
        assert!(config.use_plru);
        diff::assert_eq!(config.l1, Config::default().l1);
        Ok(())
    }
}
