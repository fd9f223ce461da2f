use crate::debugger::address::RelocatedAddress;
use crate::debugger::code::INT3;
use crate::debugger::error::Error;
use indexmap::IndexMap;
use nix::libc::c_void;
use nix::sys;
use nix::unistd::Pid;
use smallvec::SmallVec;
use std::cell::Cell;
use std::collections::HashMap;
use std::path::PathBuf;

/// An installed trap: one patched byte in debuggee memory.
pub struct Breakpoint {
    pub addr: RelocatedAddress,
    pub pid: Pid,
    pub saved_data: Cell<u8>,
    enabled: Cell<bool>,
    temporary: bool,
}

impl Breakpoint {
    pub fn new(addr: RelocatedAddress, pid: Pid) -> Self {
        Self {
            addr,
            pid,
            saved_data: Cell::default(),
            enabled: Cell::default(),
            temporary: false,
        }
    }

    pub fn new_temporary(addr: RelocatedAddress, pid: Pid) -> Self {
        Self {
            temporary: true,
            ..Self::new(addr, pid)
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    fn as_ptr(&self) -> *mut c_void {
        self.addr.as_usize() as *mut c_void
    }

    /// Write the trap opcode, remembering the original byte.
    pub fn enable(&self) -> nix::Result<()> {
        let data = sys::ptrace::read(self.pid, self.as_ptr())?;
        self.saved_data.set((data & 0xff) as u8);
        let data_with_trap = (data as u64 & !0xff) | INT3 as u64;
        unsafe {
            sys::ptrace::write(self.pid, self.as_ptr(), data_with_trap as *mut c_void)?;
        }
        self.enabled.set(true);

        Ok(())
    }

    /// Restore the original byte.
    pub fn disable(&self) -> nix::Result<()> {
        let data = sys::ptrace::read(self.pid, self.as_ptr())? as u64;
        let restored: u64 = (data & !0xff) | self.saved_data.get() as u64;
        unsafe {
            sys::ptrace::write(self.pid, self.as_ptr(), restored as *mut c_void)?;
        }
        self.enabled.set(false);

        Ok(())
    }
}

/// One patched address with all its logical owners.
///
/// The destructor restores the original byte, so dropping the registry (or a
/// single trap) can never leave an `int3` behind in debuggee memory.
struct InstalledTrap {
    brkpt: Breakpoint,
    owners: SmallVec<[u32; 2]>,
    temp_owner: bool,
}

impl Drop for InstalledTrap {
    fn drop(&mut self) {
        if self.brkpt.is_enabled() {
            let _ = self.brkpt.disable();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointKind {
    Line,
    Function,
    Instruction,
    Exception,
}

/// A user-visible breakpoint. May be backed by zero or more installed traps.
#[derive(Debug, Clone)]
pub struct LogicalBreakpoint {
    pub id: u32,
    pub kind: BreakpointKind,
    pub file: Option<PathBuf>,
    pub line: Option<u64>,
    pub function: Option<String>,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
    pub log_message: Option<String>,
    pub filters: Vec<String>,
    pub addresses: Vec<RelocatedAddress>,
    pub verified: bool,
    pub hits: u32,
}

impl LogicalBreakpoint {
    /// Check a DAP-style hit condition (`5`, `== 5`, `> 5`, `>= 5`, `% 5`)
    /// against the hit counter. Malformed conditions never suppress a stop.
    pub fn hit_condition_met(&self) -> bool {
        let Some(cond) = &self.hit_condition else {
            return true;
        };
        let cond = cond.trim();
        let (op, rest) = if let Some(r) = cond.strip_prefix(">=") {
            (">=", r)
        } else if let Some(r) = cond.strip_prefix("==") {
            ("==", r)
        } else if let Some(r) = cond.strip_prefix('>') {
            (">", r)
        } else if let Some(r) = cond.strip_prefix('%') {
            ("%", r)
        } else {
            ("==", cond)
        };
        let Ok(n) = rest.trim().parse::<u32>() else {
            return true;
        };
        match op {
            "==" => self.hits == n,
            ">" => self.hits > n,
            ">=" => self.hits >= n,
            "%" => n != 0 && self.hits % n == 0,
            _ => true,
        }
    }
}

/// Owner of every logical breakpoint and installed trap of one session.
///
/// Invariant: at most one installed trap per code address; requests for an
/// already-trapped address coalesce into the same trap with several owners.
#[derive(Default)]
pub struct BreakpointRegistry {
    logical: IndexMap<u32, LogicalBreakpoint>,
    installed: HashMap<RelocatedAddress, InstalledTrap>,
    next_id: u32,
}

impl BreakpointRegistry {
    pub fn new() -> Self {
        Self {
            logical: IndexMap::new(),
            installed: HashMap::new(),
            next_id: 1,
        }
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Register a logical breakpoint and install traps at its addresses.
    pub fn add_logical(
        &mut self,
        mut bp: LogicalBreakpoint,
        pid: Pid,
    ) -> Result<&LogicalBreakpoint, Error> {
        bp.id = self.next_id();
        for &addr in &bp.addresses {
            self.install_trap(addr, pid, bp.id)?;
        }
        bp.verified = bp.kind == BreakpointKind::Exception || !bp.addresses.is_empty();
        let id = bp.id;
        self.logical.insert(id, bp);
        Ok(&self.logical[&id])
    }

    fn install_trap(&mut self, addr: RelocatedAddress, pid: Pid, owner: u32) -> Result<(), Error> {
        match self.installed.get_mut(&addr) {
            Some(trap) => {
                if !trap.owners.contains(&owner) {
                    trap.owners.push(owner);
                }
            }
            None => {
                let brkpt = Breakpoint::new(addr, pid);
                brkpt.enable().map_err(Error::Ptrace)?;
                self.installed.insert(
                    addr,
                    InstalledTrap {
                        brkpt,
                        owners: SmallVec::from_slice(&[owner]),
                        temp_owner: false,
                    },
                );
            }
        }
        Ok(())
    }

    /// Remove a logical breakpoint; traps left without owners are restored.
    pub fn remove_logical(&mut self, id: u32) -> Result<LogicalBreakpoint, Error> {
        let bp = self
            .logical
            .shift_remove(&id)
            .ok_or(Error::BreakpointNotFound(id))?;
        for addr in &bp.addresses {
            if let Some(trap) = self.installed.get_mut(addr) {
                trap.owners.retain(|o| *o != id);
                if trap.owners.is_empty() && !trap.temp_owner {
                    // drop restores the original byte
                    self.installed.remove(addr);
                }
            }
        }
        Ok(bp)
    }

    /// Install a temporary trap used by the stepping algorithms.
    ///
    /// Returns `true` when the address was not trapped before.
    pub fn add_temporary(&mut self, addr: RelocatedAddress, pid: Pid) -> Result<bool, Error> {
        match self.installed.get_mut(&addr) {
            Some(trap) => {
                trap.temp_owner = true;
                Ok(false)
            }
            None => {
                let brkpt = Breakpoint::new_temporary(addr, pid);
                brkpt.enable().map_err(Error::Ptrace)?;
                self.installed.insert(
                    addr,
                    InstalledTrap {
                        brkpt,
                        owners: SmallVec::new(),
                        temp_owner: true,
                    },
                );
                Ok(true)
            }
        }
    }

    /// Remove a temporary trap, keeping the trap alive if logical owners remain.
    pub fn remove_temporary(&mut self, addr: RelocatedAddress) {
        if let Some(trap) = self.installed.get_mut(&addr) {
            trap.temp_owner = false;
            if trap.owners.is_empty() {
                self.installed.remove(&addr);
            }
        }
    }

    /// Remove all temporary traps (after a step completes or aborts).
    pub fn remove_all_temporary(&mut self) {
        let addrs: Vec<_> = self
            .installed
            .iter()
            .filter(|(_, t)| t.temp_owner)
            .map(|(a, _)| *a)
            .collect();
        for addr in addrs {
            self.remove_temporary(addr);
        }
    }

    pub fn get_enabled(&self, addr: RelocatedAddress) -> Option<&Breakpoint> {
        self.installed
            .get(&addr)
            .filter(|t| t.brkpt.is_enabled())
            .map(|t| &t.brkpt)
    }

    /// All installed traps, the view the tracer needs.
    pub fn active_breakpoints(&self) -> Vec<&Breakpoint> {
        self.installed.values().map(|t| &t.brkpt).collect()
    }

    /// Logical breakpoints owning a trap at `addr`.
    pub fn owners_at(&self, addr: RelocatedAddress) -> Vec<&LogicalBreakpoint> {
        let Some(trap) = self.installed.get(&addr) else {
            return vec![];
        };
        trap.owners
            .iter()
            .filter_map(|id| self.logical.get(id))
            .collect()
    }

    pub fn trap_refcount(&self, addr: RelocatedAddress) -> usize {
        self.installed.get(&addr).map_or(0, |t| t.owners.len())
    }

    pub fn get(&self, id: u32) -> Option<&LogicalBreakpoint> {
        self.logical.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut LogicalBreakpoint> {
        self.logical.get_mut(&id)
    }

    pub fn list(&self) -> Vec<&LogicalBreakpoint> {
        self.logical.values().collect()
    }

    pub fn exception_filters(&self) -> Vec<&str> {
        self.logical
            .values()
            .filter(|bp| bp.kind == BreakpointKind::Exception)
            .flat_map(|bp| bp.filters.iter().map(String::as_str))
            .collect()
    }

    /// Restore every installed trap. Called on session stop and on drop.
    pub fn clear(&mut self) {
        self.installed.clear();
        self.logical.clear();
    }

    /// Re-enable every trap after an exec (restart keeps logical breakpoints).
    pub fn reinstall(&mut self, pid: Pid) -> Result<(), Error> {
        let logical: Vec<LogicalBreakpoint> = self.logical.values().cloned().collect();
        self.installed.clear();
        for bp in &logical {
            for &addr in &bp.addresses {
                self.install_trap(addr, pid, bp.id)?;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn install_trap_unarmed(&mut self, addr: RelocatedAddress, owner: u32) {
        match self.installed.get_mut(&addr) {
            Some(trap) => {
                if !trap.owners.contains(&owner) {
                    trap.owners.push(owner);
                }
            }
            None => {
                self.installed.insert(
                    addr,
                    InstalledTrap {
                        brkpt: Breakpoint::new(addr, Pid::from_raw(0)),
                        owners: SmallVec::from_slice(&[owner]),
                        temp_owner: false,
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn line_bp(id: u32, addrs: &[usize]) -> LogicalBreakpoint {
        LogicalBreakpoint {
            id,
            kind: BreakpointKind::Line,
            file: Some(PathBuf::from("main.rs")),
            line: Some(10),
            function: None,
            condition: None,
            hit_condition: None,
            log_message: None,
            filters: vec![],
            addresses: addrs.iter().map(|a| RelocatedAddress::from(*a)).collect(),
            verified: true,
            hits: 0,
        }
    }

    #[test]
    fn test_trap_refcount_tracks_owners() {
        let mut registry = BreakpointRegistry::new();
        let addr1 = RelocatedAddress::from(0x1000_usize);
        let addr2 = RelocatedAddress::from(0x2000_usize);

        registry.logical.insert(1, line_bp(1, &[0x1000]));
        registry.install_trap_unarmed(addr1, 1);
        registry.logical.insert(2, line_bp(2, &[0x1000, 0x2000]));
        registry.install_trap_unarmed(addr1, 2);
        registry.install_trap_unarmed(addr2, 2);

        assert_eq!(registry.trap_refcount(addr1), 2);
        assert_eq!(registry.trap_refcount(addr2), 1);

        registry.remove_logical(1).unwrap();
        assert_eq!(registry.trap_refcount(addr1), 1);

        registry.remove_logical(2).unwrap();
        assert_eq!(registry.trap_refcount(addr1), 0);
        assert_eq!(registry.trap_refcount(addr2), 0);
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_temporary_trap_does_not_steal_logical_owner() {
        let mut registry = BreakpointRegistry::new();
        registry.logical.insert(1, line_bp(1, &[0x1000]));
        registry.install_trap_unarmed(RelocatedAddress::from(0x1000_usize), 1);

        let addr = RelocatedAddress::from(0x1000_usize);
        // an existing trap is reused, not re-armed
        assert!(!registry.add_temporary(addr, Pid::from_raw(0)).unwrap());
        registry.remove_temporary(addr);
        assert_eq!(registry.trap_refcount(addr), 1);
        assert!(registry.get_enabled(addr).is_none()); // unarmed in this test
        assert!(registry.installed.contains_key(&addr));
    }

    #[test]
    fn test_hit_condition() {
        let mut bp = line_bp(1, &[]);
        bp.hits = 4;

        for (cond, expect) in [
            ("4", true),
            ("== 4", true),
            ("5", false),
            ("> 3", true),
            (">= 5", false),
            ("% 2", true),
            ("% 3", false),
            ("garbage", true),
        ] {
            bp.hit_condition = Some(cond.to_string());
            assert_eq!(bp.hit_condition_met(), expect, "condition {cond}");
        }
        bp.hit_condition = None;
        assert!(bp.hit_condition_met());
    }
}
