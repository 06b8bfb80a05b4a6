use super::Machine;
use crate::cache::CacheLine;
use crate::verify::{verify_sets, Violation};

impl Machine {
    /// Checks set structure, L1/L2 inclusion, that private copies stay backed
    /// by the shared cache and that a line has at most one exclusive holder.
    pub fn verify_invariants(&self) -> Result<(), Violation> {
        verify_sets(&self.shared.l3, "L3")?;
        self.shared.verify_aim()?;

        for proc in &self.processors {
            let core = proc.id;
            verify_sets(&proc.l1, &format!("core {core} L1"))?;
            verify_sets(&proc.l2, &format!("core {core} L2"))?;

            for l1 in proc.l1.lines().filter(|line| line.is_valid()) {
                let Some(addr) = l1.addr() else {
                    continue;
                };
                let reason = match proc.l2.lookup(addr) {
                    None => Some("has no L2 line".to_string()),
                    Some(l2) if l2.state != l1.state => {
                        Some(format!("is {:?} but L2 is {:?}", l1.state, l2.state))
                    }
                    Some(l2) if l2.bits != l1.bits => {
                        Some(format!("has bits {:?} but L2 has {:?}", l1.bits, l2.bits))
                    }
                    Some(_) => None,
                };
                if let Some(reason) = reason {
                    return Err(Violation::Inclusivity { core, addr, reason });
                }
            }

            for addr in proc.l2.valid_addresses() {
                if self.shared.l3.lookup(addr).is_none() {
                    return Err(Violation::NotInLlc { core, addr });
                }
            }
        }

        for llc in self.shared.l3.lines().filter(|line| line.is_valid()) {
            let Some(addr) = llc.addr() else {
                continue;
            };
            let holders: Vec<_> = self
                .processors
                .iter()
                .filter_map(|proc| proc.l2.lookup(addr).map(|line| (proc.id, line.state)))
                .collect();
            if let Some(&(owner, _)) = holders.iter().find(|(_, state)| state.is_exclusive()) {
                if let Some(&(other, _)) = holders.iter().find(|(core, _)| *core != owner) {
                    return Err(Violation::MultipleOwners { addr, owner, other });
                }
            }
            let expected = self.holders_state(addr);
            if llc.state != expected {
                return Err(Violation::LlcState {
                    addr,
                    llc: format!("{:?}", llc.state),
                    expected: format!("{expected:?}"),
                });
            }
        }
        Ok(())
    }
}
