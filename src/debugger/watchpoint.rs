//! Hardware watchpoints backed by the x86-64 debug registers DR0-DR3/DR6/DR7.

use crate::debugger::error::Error;
use nix::sys;
use nix::unistd::Pid;
use std::ffi::c_void;

/// `offsetof(struct user, u_debugreg)` on x86-64 glibc.
const DEBUGREG_OFFSET: usize = 848;
const DR_SLOTS: usize = 4;

fn dr_offset(reg: usize) -> *mut c_void {
    (DEBUGREG_OFFSET + reg * std::mem::size_of::<u64>()) as *mut c_void
}

fn read_dr(pid: Pid, reg: usize) -> nix::Result<u64> {
    sys::ptrace::read_user(pid, dr_offset(reg)).map(|v| v as u64)
}

fn write_dr(pid: Pid, reg: usize, value: u64) -> nix::Result<()> {
    unsafe { sys::ptrace::write_user(pid, dr_offset(reg), value as *mut c_void) }
}

/// Check DR6 for a triggered watchpoint; clears the status bits when found.
pub fn dr6_hit_slot(pid: Pid) -> Option<u8> {
    let dr6 = read_dr(pid, 6).ok()?;
    let hit = (dr6 & 0b1111) != 0;
    if !hit {
        return None;
    }
    let slot = (dr6 & 0b1111).trailing_zeros() as u8;
    let _ = write_dr(pid, 6, dr6 & !0b1111);
    Some(slot)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAccess {
    Read,
    Write,
    ReadWrite,
}

impl WatchAccess {
    /// DR7 condition bits. x86 has no read-only break condition, a read
    /// watch degrades to read/write.
    fn condition_bits(self) -> u64 {
        match self {
            WatchAccess::Write => 0b01,
            WatchAccess::Read | WatchAccess::ReadWrite => 0b11,
        }
    }
}

fn len_bits(size: u8) -> Result<u64, Error> {
    match size {
        1 => Ok(0b00),
        2 => Ok(0b01),
        4 => Ok(0b11),
        8 => Ok(0b10),
        _ => Err(Error::TypeMismatch("watchpoint size must be 1, 2, 4 or 8")),
    }
}

/// One occupied debug register slot.
#[derive(Debug, Clone)]
pub struct Watchpoint {
    pub id: u32,
    pub slot: u8,
    pub addr: usize,
    pub size: u8,
    pub access: WatchAccess,
    pub variable: Option<String>,
    refs: u32,
}

/// The four debug register slots of one debuggee.
///
/// Two watch requests resolving to the same (address, size, access) share one
/// slot; the slot is freed when the last logical watchpoint is removed.
pub struct WatchpointRegistry {
    slots: [Option<Watchpoint>; DR_SLOTS],
    next_id: u32,
}

/// Watchpoint ids live above this base so they never collide with logical
/// breakpoint ids; both are removed through the same tool surface.
const WATCHPOINT_ID_BASE: u32 = 10_000;

impl WatchpointRegistry {
    pub fn new() -> Self {
        Self {
            slots: Default::default(),
            next_id: WATCHPOINT_ID_BASE,
        }
    }

    /// Arm a watchpoint on every tracee of the debuggee.
    pub fn set(
        &mut self,
        tracees: &[Pid],
        addr: usize,
        size: u8,
        access: WatchAccess,
        variable: Option<String>,
    ) -> Result<&Watchpoint, Error> {
        len_bits(size)?;

        // coalesce with an existing slot
        if let Some(idx) = self.slots.iter().position(|slot| {
            matches!(slot, Some(wp) if wp.addr == addr && wp.size == size && wp.access == access)
        }) {
            let wp = self.slots[idx].as_mut().expect("slot checked above");
            wp.refs += 1;
            return Ok(self.slots[idx].as_ref().expect("slot checked above"));
        }

        let free = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(Error::WatchpointExhausted)?;

        let id = self.next_id;
        self.next_id += 1;
        let wp = Watchpoint {
            id,
            slot: free as u8,
            addr,
            size,
            access,
            variable,
            refs: 1,
        };
        for &pid in tracees {
            arm_slot(pid, &wp)?;
        }
        self.slots[free] = Some(wp);
        Ok(self.slots[free].as_ref().expect("just filled"))
    }

    /// Drop one logical reference; the hardware slot is freed on the last one.
    pub fn remove(&mut self, tracees: &[Pid], id: u32) -> Result<(), Error> {
        let idx = self
            .slots
            .iter()
            .position(|s| matches!(s, Some(wp) if wp.id == id))
            .ok_or(Error::WatchpointNotFound(id))?;

        let wp = self.slots[idx].as_mut().expect("slot checked above");
        wp.refs -= 1;
        if wp.refs == 0 {
            let slot = wp.slot;
            for &pid in tracees {
                let _ = disarm_slot(pid, slot);
            }
            self.slots[idx] = None;
        }
        Ok(())
    }

    /// Replicate active slots into a freshly created thread.
    pub fn sync_tracee(&self, pid: Pid) {
        for wp in self.slots.iter().flatten() {
            let _ = arm_slot(pid, wp);
        }
    }

    /// Free every slot; called on session stop.
    pub fn clear(&mut self, tracees: &[Pid]) {
        for wp in self.slots.iter().flatten() {
            for &pid in tracees {
                let _ = disarm_slot(pid, wp.slot);
            }
        }
        self.slots = Default::default();
    }

    pub fn by_slot(&self, slot: u8) -> Option<&Watchpoint> {
        self.slots
            .iter()
            .flatten()
            .find(|wp| wp.slot == slot)
    }

    pub fn list(&self) -> Vec<&Watchpoint> {
        self.slots.iter().flatten().collect()
    }
}

fn arm_slot(pid: Pid, wp: &Watchpoint) -> Result<(), Error> {
    let i = wp.slot as usize;
    write_dr(pid, i, wp.addr as u64).map_err(Error::Ptrace)?;

    let mut dr7 = read_dr(pid, 7).map_err(Error::Ptrace)?;
    dr7 |= 1 << (i * 2); // local enable
    dr7 &= !(0b1111 << (16 + i * 4));
    dr7 |= wp.access.condition_bits() << (16 + i * 4);
    dr7 |= len_bits(wp.size).expect("size validated on set") << (18 + i * 4);
    write_dr(pid, 7, dr7).map_err(Error::Ptrace)
}

fn disarm_slot(pid: Pid, slot: u8) -> Result<(), Error> {
    let i = slot as usize;
    let mut dr7 = read_dr(pid, 7).map_err(Error::Ptrace)?;
    dr7 &= !(1 << (i * 2));
    dr7 &= !(0b1111 << (16 + i * 4));
    write_dr(pid, 7, dr7).map_err(Error::Ptrace)?;
    write_dr(pid, i, 0).map_err(Error::Ptrace)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_slot_coalescing_and_exhaustion() {
        let mut registry = WatchpointRegistry::new();
        let no_tracees: [Pid; 0] = [];

        let first = registry
            .set(&no_tracees, 0x1000, 8, WatchAccess::Write, None)
            .unwrap()
            .id;
        // same address+size+access coalesces into the same slot
        let second = registry
            .set(&no_tracees, 0x1000, 8, WatchAccess::Write, None)
            .unwrap()
            .id;
        assert_eq!(first, second);
        assert_eq!(registry.list().len(), 1);

        // distinct access modes never share a slot
        registry
            .set(&no_tracees, 0x1000, 8, WatchAccess::ReadWrite, None)
            .unwrap();
        registry.set(&no_tracees, 0x2000, 4, WatchAccess::Write, None).unwrap();
        registry.set(&no_tracees, 0x3000, 4, WatchAccess::Write, None).unwrap();
        assert!(matches!(
            registry.set(&no_tracees, 0x4000, 4, WatchAccess::Write, None),
            Err(Error::WatchpointExhausted)
        ));

        // the shared slot survives one removal, dies on the second
        registry.remove(&no_tracees, first).unwrap();
        assert_eq!(registry.list().len(), 4);
        registry.remove(&no_tracees, first).unwrap();
        assert_eq!(registry.list().len(), 3);
    }

    #[test]
    fn test_bad_size_rejected() {
        let mut registry = WatchpointRegistry::new();
        assert!(registry
            .set(&[], 0x1000, 3, WatchAccess::Write, None)
            .is_err());
    }
}
