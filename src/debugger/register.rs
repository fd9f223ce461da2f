use crate::debugger::error::Error;
use nix::libc::user_regs_struct;
use nix::sys;
use nix::unistd::Pid;
use smallvec::{smallvec, SmallVec};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

/// x86-64 general purpose register set.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, EnumString, EnumIter, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rdi,
    Rsi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Eflags,
    Cs,
    OrigRax,
    FsBase,
    GsBase,
    Fs,
    Gs,
    Ss,
    Ds,
    Es,
}

impl Register {
    /// System V AMD64 DWARF register number, if one exists.
    pub fn dwarf_register(self) -> Option<gimli::Register> {
        let n = match self {
            Register::Rax => 0,
            Register::Rdx => 1,
            Register::Rcx => 2,
            Register::Rbx => 3,
            Register::Rsi => 4,
            Register::Rdi => 5,
            Register::Rbp => 6,
            Register::Rsp => 7,
            Register::R8 => 8,
            Register::R9 => 9,
            Register::R10 => 10,
            Register::R11 => 11,
            Register::R12 => 12,
            Register::R13 => 13,
            Register::R14 => 14,
            Register::R15 => 15,
            Register::Rip => 16,
            Register::Eflags => 49,
            Register::Es => 50,
            Register::Cs => 51,
            Register::Ss => 52,
            Register::Ds => 53,
            Register::Fs => 54,
            Register::Gs => 55,
            Register::FsBase => 58,
            Register::GsBase => 59,
            Register::OrigRax => return None,
        };
        Some(gimli::Register(n))
    }

    pub fn from_dwarf(register: gimli::Register) -> Result<Register, Error> {
        Register::iter()
            .find(|r| r.dwarf_register() == Some(register))
            .ok_or(Error::RegisterNotFound(register))
    }

    pub fn from_name(name: &str) -> Result<Register, Error> {
        name.parse()
            .map_err(|_| Error::RegisterNameNotFound(name.to_string()))
    }
}

/// Machine register snapshot of a single tracee.
#[derive(Debug, Clone, Copy)]
pub struct RegisterMap {
    regs: user_regs_struct,
}

impl From<user_regs_struct> for RegisterMap {
    fn from(regs: user_regs_struct) -> Self {
        Self { regs }
    }
}

impl RegisterMap {
    pub fn current(pid: Pid) -> nix::Result<Self> {
        let regs = sys::ptrace::getregs(pid)?;
        Ok(regs.into())
    }

    pub fn value(&self, register: Register) -> u64 {
        let r = &self.regs;
        match register {
            Register::Rax => r.rax,
            Register::Rbx => r.rbx,
            Register::Rcx => r.rcx,
            Register::Rdx => r.rdx,
            Register::Rdi => r.rdi,
            Register::Rsi => r.rsi,
            Register::Rbp => r.rbp,
            Register::Rsp => r.rsp,
            Register::R8 => r.r8,
            Register::R9 => r.r9,
            Register::R10 => r.r10,
            Register::R11 => r.r11,
            Register::R12 => r.r12,
            Register::R13 => r.r13,
            Register::R14 => r.r14,
            Register::R15 => r.r15,
            Register::Rip => r.rip,
            Register::Eflags => r.eflags,
            Register::Cs => r.cs,
            Register::OrigRax => r.orig_rax,
            Register::FsBase => r.fs_base,
            Register::GsBase => r.gs_base,
            Register::Fs => r.fs,
            Register::Gs => r.gs,
            Register::Ss => r.ss,
            Register::Ds => r.ds,
            Register::Es => r.es,
        }
    }

    pub fn update(&mut self, register: Register, value: u64) {
        let r = &mut self.regs;
        match register {
            Register::Rax => r.rax = value,
            Register::Rbx => r.rbx = value,
            Register::Rcx => r.rcx = value,
            Register::Rdx => r.rdx = value,
            Register::Rdi => r.rdi = value,
            Register::Rsi => r.rsi = value,
            Register::Rbp => r.rbp = value,
            Register::Rsp => r.rsp = value,
            Register::R8 => r.r8 = value,
            Register::R9 => r.r9 = value,
            Register::R10 => r.r10 = value,
            Register::R11 => r.r11 = value,
            Register::R12 => r.r12 = value,
            Register::R13 => r.r13 = value,
            Register::R14 => r.r14 = value,
            Register::R15 => r.r15 = value,
            Register::Rip => r.rip = value,
            Register::Eflags => r.eflags = value,
            Register::Cs => r.cs = value,
            Register::OrigRax => r.orig_rax = value,
            Register::FsBase => r.fs_base = value,
            Register::GsBase => r.gs_base = value,
            Register::Fs => r.fs = value,
            Register::Gs => r.gs = value,
            Register::Ss => r.ss = value,
            Register::Ds => r.ds = value,
            Register::Es => r.es = value,
        };
    }

    pub fn persist(self, pid: Pid) -> nix::Result<()> {
        sys::ptrace::setregs(pid, self.regs)
    }

    /// Enumerate all registers with their current values.
    pub fn snapshot(&self) -> Vec<(Register, u64)> {
        Register::iter().map(|r| (r, self.value(r))).collect()
    }
}

/// Register file keyed by DWARF register numbers.
///
/// Used by the unwinder and the location evaluator; a map may describe a
/// non-innermost frame, so values must never be read from the live process
/// behind its back.
#[derive(Debug, Clone)]
pub struct DwarfRegisterMap(SmallVec<[Option<u64>; 0x40]>);

impl DwarfRegisterMap {
    pub fn value(&self, register: gimli::Register) -> Result<u64, Error> {
        self.0
            .get(register.0 as usize)
            .copied()
            .flatten()
            .ok_or(Error::RegisterNotFound(register))
    }

    pub fn update(&mut self, register: gimli::Register, value: u64) {
        let idx = register.0 as usize;
        if idx >= self.0.len() {
            self.0.resize(idx + 1, None);
        }
        self.0[idx] = Some(value);
    }

    pub fn update_from(&mut self, other: &DwarfRegisterMap) {
        for (i, value) in other.0.iter().enumerate() {
            if let Some(v) = value {
                self.update(gimli::Register(i as u16), *v);
            }
        }
    }
}

impl From<RegisterMap> for DwarfRegisterMap {
    fn from(map: RegisterMap) -> Self {
        let mut dwarf_map = DwarfRegisterMap(smallvec![None; 0x40]);
        for reg in Register::iter() {
            if let Some(dwarf_reg) = reg.dwarf_register() {
                dwarf_map.update(dwarf_reg, map.value(reg));
            }
        }
        dwarf_map
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_register_names_round_trip() {
        assert_eq!(Register::from_name("rip").unwrap(), Register::Rip);
        assert_eq!(Register::from_name("r13").unwrap(), Register::R13);
        assert_eq!(Register::Rbp.to_string(), "rbp");
        assert!(Register::from_name("xmm0").is_err());
    }

    #[test]
    fn test_dwarf_numbering() {
        assert_eq!(Register::Rax.dwarf_register(), Some(gimli::Register(0)));
        assert_eq!(Register::Rsp.dwarf_register(), Some(gimli::Register(7)));
        assert_eq!(Register::Rip.dwarf_register(), Some(gimli::Register(16)));
        assert_eq!(
            Register::from_dwarf(gimli::Register(6)).unwrap(),
            Register::Rbp
        );
        assert!(Register::from_dwarf(gimli::Register(90)).is_err());
    }
}
