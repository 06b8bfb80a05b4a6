//! Small geometries that can be followed by hand.

use crate::config::{self, Aim, Cache, Config};

/// 4 byte lines, 2 sets of 2 ways in L1 and L2, 4 sets of 4 ways in L3.
///
/// Lines `0, 8, 16, ..` share L1/L2 set 0 and lines `0, 16, 32, ..` share L3 set 0.
#[must_use]
pub fn tiny(protocol: config::Protocol, num_cores: usize) -> Config {
    Config {
        protocol,
        num_cores,
        l1: Cache::new(16, 4, 2),
        l2: Cache::new(16, 4, 2),
        l3: Cache::new(64, 4, 4),
        use_aim_cache: true,
        aim: Aim {
            num_lines: 16,
            associativity: 2,
            line_size: 4,
        },
        ..Config::default()
    }
}

#[must_use]
pub fn viser(num_cores: usize) -> Config {
    tiny(config::Protocol::Viser, num_cores)
}

#[must_use]
pub fn mesi(num_cores: usize) -> Config {
    tiny(config::Protocol::Mesi, num_cores)
}
