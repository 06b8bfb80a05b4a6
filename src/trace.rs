//! JSON lines traces.
//!
//! Each line is one event of one core:
//!
//! ```text
//! {"core":0,"op":"write","addr":64,"size":4,"kind":"memory","value":7}
//! {"core":1,"op":"read","addr":64,"size":4}
//! {"core":0,"op":"region_end"}
//! {"core":0,"op":"insns","count":100}
//! ```

use crate::access::{Access, AccessType, Semantics, SyncEvent};
use crate::{address, Simulator};

use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("line {line}: {source}")]
    Decode {
        line: usize,
        source: serde_json::Error,
    },
    #[error("line {line}: no core {core} in a machine with {num_cores} cores")]
    CoreOutOfRange {
        line: usize,
        core: usize,
        num_cores: usize,
    },
    #[error("line {line}: {kind:?} accesses cannot read")]
    InvalidRead { line: usize, kind: Kind },
}

/// What an access is used for.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    #[default]
    Memory,
    Atomic,
    LockAcquire,
    LockRelease,
}

impl Kind {
    fn access_type(self, is_read: bool) -> Option<AccessType> {
        Some(match (self, is_read) {
            (Self::Memory, true) => AccessType::MEMORY_READ,
            (Self::Memory, false) => AccessType::MEMORY_WRITE,
            (Self::Atomic, true) => AccessType::ATOMIC_READ,
            (Self::Atomic, false) => AccessType::ATOMIC_WRITE,
            (Self::LockAcquire, true) => AccessType::LOCK_ACQ_READ,
            (Self::LockAcquire, false) => AccessType::LOCK_ACQ_WRITE,
            (Self::LockRelease, false) => AccessType::LOCK_REL_WRITE,
            (Self::LockRelease, true) => return None,
        })
    }
}

fn default_sync_event() -> SyncEvent {
    SyncEvent::LOCK_RELEASE
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    Read {
        addr: address,
        size: u32,
        #[serde(default)]
        kind: Kind,
    },
    Write {
        addr: address,
        size: u32,
        #[serde(default)]
        kind: Kind,
        #[serde(default)]
        value: u64,
    },
    RegionEnd {
        #[serde(default = "default_sync_event")]
        event: SyncEvent,
    },
    Insns {
        count: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub core: usize,
    #[serde(flatten)]
    pub op: Op,
}

impl Event {
    /// Delivers the event to `sim`. `line` is only used for error reporting.
    pub fn apply(&self, sim: &mut dyn Simulator, line: usize) -> Result<(), Error> {
        let core = self.core;
        let num_cores = sim.num_cores();
        if core >= num_cores {
            return Err(Error::CoreOutOfRange {
                line,
                core,
                num_cores,
            });
        }
        match self.op {
            Op::Read { addr, size, kind } => {
                let kind = kind
                    .access_type(true)
                    .ok_or(Error::InvalidRead { line, kind })?;
                sim.access(Access::read(core, addr, size).with_kind(kind));
            }
            Op::Write {
                addr,
                size,
                kind,
                value,
            } => {
                let kind = kind
                    .access_type(false)
                    .ok_or(Error::InvalidRead { line, kind })?;
                sim.access(Access::write(core, addr, size, value).with_kind(kind));
            }
            Op::RegionEnd { event } => {
                sim.process_region_boundary(core, event, Semantics::REG_END);
            }
            Op::Insns { count } => sim.insns_executed(core, count),
        }
        Ok(())
    }
}

/// Replays all events of `reader` into `sim` and returns how many were delivered.
///
/// A malformed last line is taken to be a truncated trace and ends the
/// replay with a warning.
pub fn replay(sim: &mut dyn Simulator, reader: impl BufRead) -> Result<usize, Error> {
    let mut lines = reader
        .lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line))
        .filter(|(_, line)| line.as_ref().map_or(true, |line| !line.trim().is_empty()))
        .peekable();

    let mut delivered = 0;
    while let Some((line_num, line)) = lines.next() {
        let line = line?;
        let event: Event = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(source) if lines.peek().is_none() => {
                log::warn!("ignoring truncated trace line {line_num}: {source}");
                break;
            }
            Err(source) => {
                return Err(Error::Decode {
                    line: line_num,
                    source,
                })
            }
        };
        event.apply(sim, line_num)?;
        delivered += 1;
    }
    log::debug!("replayed {delivered} events");
    Ok(delivered)
}

pub fn replay_file(sim: &mut dyn Simulator, path: impl AsRef<Path>) -> Result<usize, Error> {
    let file = std::fs::File::open(path.as_ref())?;
    replay(sim, std::io::BufReader::new(file))
}

#[cfg(test)]
mod tests {
    use super::{Error, Event, Kind, Op};
    use crate::testing::{self, configs};
    use crate::SyncEvent;
    use color_eyre::eyre;
    use pretty_assertions_sorted as diff;
    use stats::Counter;

    const RACY: &str = r#"
{"core":0,"op":"write","addr":64,"size":4,"value":7}
{"core":1,"op":"read","addr":64,"size":4}
{"core":0,"op":"region_end"}
{"core":1,"op":"region_end"}
{"core":1,"op":"insns","count":100}
"#;

    #[test]
    fn decodes_events() -> eyre::Result<()> {
        testing::init_logging();
        let event: Event = serde_json::from_str(
            r#"{"core":2,"op":"write","addr":64,"size":4,"kind":"atomic","value":7}"#,
        )?;
        diff::assert_eq!(
            event,
            Event {
                core: 2,
                op: Op::Write {
                    addr: 64,
                    size: 4,
                    kind: Kind::Atomic,
                    value: 7
                }
            }
        );
        let event: Event = serde_json::from_str(r#"{"core":0,"op":"region_end"}"#)?;
        diff::assert_eq!(
            event.op,
            Op::RegionEnd {
                event: SyncEvent::LOCK_RELEASE
            }
        );
        Ok(())
    }

    #[test]
    fn replays_into_both_protocols() -> eyre::Result<()> {
        testing::init_logging();
        for config in [configs::viser(2), configs::mesi(2)] {
            let protocol = config.protocol;
            let mut sim = crate::build(config)?;
            let delivered = super::replay(sim.as_mut(), RACY.as_bytes())?;
            diff::assert_eq!(delivered, 5);

            let stats = sim.stats();
            let counters = &stats.counters;
            diff::assert_eq!(counters.get(Counter::TotalMemoryAccesses), 2, "{protocol:?}");
            diff::assert_eq!(counters.get(Counter::RegionBoundaries), 2, "{protocol:?}");
            diff::assert_eq!(counters.get(Counter::InstructionsExecuted), 100, "{protocol:?}");
            sim.verify()?;
        }
        Ok(())
    }

    #[test]
    fn truncated_last_line_ends_replay() -> eyre::Result<()> {
        testing::init_logging();
        let trace = "{\"core\":0,\"op\":\"read\",\"addr\":0,\"size\":4}\n{\"core\":1,\"op\":\"wr";
        let mut sim = crate::build(configs::viser(2))?;
        diff::assert_eq!(super::replay(sim.as_mut(), trace.as_bytes())?, 1);
        Ok(())
    }

    #[test]
    fn malformed_line_in_the_middle_is_an_error() -> eyre::Result<()> {
        testing::init_logging();
        let trace = "{\"core\":0,\"op\":\"read\",\"addr\":0,\"size\":4}\nnot json\n{\"core\":0,\"op\":\"region_end\"}\n";
        let mut sim = crate::build(configs::viser(2))?;
        let err = super::replay(sim.as_mut(), trace.as_bytes());
        assert!(matches!(err, Err(Error::Decode { line: 2, .. })), "{err:?}");
        Ok(())
    }

    #[test]
    fn rejects_unknown_cores_and_lock_release_reads() -> eyre::Result<()> {
        testing::init_logging();
        let mut sim = crate::build(configs::mesi(2))?;
        let err = super::replay(
            sim.as_mut(),
            "{\"core\":2,\"op\":\"region_end\"}\n".as_bytes(),
        );
        assert!(
            matches!(
                err,
                Err(Error::CoreOutOfRange {
                    line: 1,
                    core: 2,
                    num_cores: 2
                })
            ),
            "{err:?}"
        );

        let err = super::replay(
            sim.as_mut(),
            "{\"core\":0,\"op\":\"read\",\"addr\":0,\"size\":2,\"kind\":\"lock_release\"}\n"
                .as_bytes(),
        );
        assert!(matches!(err, Err(Error::InvalidRead { line: 1, .. })), "{err:?}");
        Ok(())
    }
}
