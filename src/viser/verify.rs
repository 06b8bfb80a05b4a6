use super::Machine;
use crate::cache::CacheLine;
use crate::verify::{verify_sets, Violation};

impl Machine {
    /// Checks the structural invariants of all caches.
    ///
    /// Cheap enough for tests, too slow to run after every event of a long trace.
    pub fn verify_invariants(&self) -> Result<(), Violation> {
        verify_sets(&self.shared.l3, "L3")?;
        self.shared.verify_aim()?;

        for proc in &self.processors {
            let core = proc.id;
            let epoch = self.epoch(core);
            verify_sets(&proc.l1, &format!("core {core} L1"))?;
            verify_sets(&proc.l2, &format!("core {core} L2"))?;

            for l1 in proc.l1.lines().filter(|line| line.is_valid()) {
                let Some(addr) = l1.addr() else {
                    continue;
                };
                let reason = match proc.l2.find(addr) {
                    None => Some("has no L2 line".to_string()),
                    Some(l2) if l2.state != l1.state => {
                        Some(format!("is {:?} but L2 is {:?}", l1.state, l2.state))
                    }
                    Some(l2) if l2.version != l1.version => Some(format!(
                        "has version {} but L2 has {}",
                        l1.version, l2.version
                    )),
                    Some(_) => None,
                };
                if let Some(reason) = reason {
                    return Err(Violation::Inclusivity { core, addr, reason });
                }
            }

            for line in proc.l1.lines().chain(proc.l2.lines()) {
                let Some(addr) = line.addr().filter(|_| line.is_valid()) else {
                    continue;
                };
                let md = line.md(core);
                if md.epoch != epoch && !md.is_empty() {
                    return Err(Violation::StaleMetadata {
                        core,
                        level: line.level(),
                        addr,
                        stamp: md.epoch,
                        epoch,
                    });
                }
                if let Some((shared, _)) = self.shared.line(addr) {
                    if line.version > shared.version {
                        return Err(Violation::VersionAhead {
                            core,
                            level: line.level(),
                            addr,
                            private: line.version,
                            shared: shared.version,
                        });
                    }
                }
            }
        }

        if let Some(&addr) = self
            .shared
            .memory
            .keys()
            .find(|&&addr| self.shared.l3.lookup(addr).is_some())
        {
            return Err(Violation::ResidentTwice { addr });
        }

        let shared_lines = self
            .shared
            .l3
            .lines()
            .filter(|line| line.is_valid())
            .chain(self.shared.memory.values());
        for line in shared_lines {
            let (Some(addr), Some(owner)) = (line.addr(), line.deferred_owner) else {
                continue;
            };
            if self.processors[owner].l2.lookup(addr).is_none() {
                return Err(Violation::DeferredNotResident { addr, owner });
            }
        }
        Ok(())
    }
}
