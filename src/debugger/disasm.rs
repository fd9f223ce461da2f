use crate::debugger::address::RelocatedAddress;
use crate::debugger::breakpoint::Breakpoint;
use crate::debugger::error::Error;
use capstone::prelude::*;
use nix::unistd::Pid;

/// Upper bound of an x86-64 instruction.
const MAX_INSTRUCTION_LEN: usize = 16;

/// Single disassembled instruction.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub address: RelocatedAddress,
    pub mnemonic: Option<String>,
    pub operands: Option<String>,
    pub bytes: Vec<u8>,
}

pub struct Disassembler {
    cs: Capstone,
}

// `Capstone` wraps a raw handle (`*mut c_void`) owned exclusively by this
// struct; the handle is never shared across threads, only ever moved, so
// sending it is safe even though capstone-rs doesn't assert this itself.
unsafe impl Send for Disassembler {}

impl Disassembler {
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            cs: Capstone::new()
                .x86()
                .mode(arch::x86::ArchMode::Mode64)
                .syntax(arch::x86::ArchSyntax::Att)
                .build()
                .map_err(Error::DisAsmInit)?,
        })
    }

    /// Disassemble `count` instructions starting at `addr`.
    ///
    /// Installed traps in the range are replaced with the original bytes, so
    /// the listing never shows `int3` patches.
    pub fn disasm(
        &self,
        pid: Pid,
        addr: RelocatedAddress,
        count: usize,
        breakpoints: &[&Breakpoint],
    ) -> Result<Vec<Instruction>, Error> {
        let len = count * MAX_INSTRUCTION_LEN;
        let mut text = crate::debugger::read_memory_by_pid(pid, addr.as_usize(), len)
            .map_err(Error::Ptrace)?;

        breakpoints
            .iter()
            .filter(|brkpt| brkpt.is_enabled())
            .filter(|brkpt| brkpt.addr >= addr && brkpt.addr < addr.offset(len as isize))
            .for_each(|brkpt| {
                let byte_idx = brkpt.addr.as_usize() - addr.as_usize();
                text[byte_idx] = brkpt.saved_data.get();
            });

        let instructions = self
            .cs
            .disasm_count(&text, addr.as_u64(), count)
            .map_err(Error::DisAsm)?
            .iter()
            .map(|i| Instruction {
                address: RelocatedAddress::from(i.address()),
                mnemonic: i.mnemonic().map(ToString::to_string),
                operands: i.op_str().map(ToString::to_string),
                bytes: i.bytes().to_vec(),
            })
            .collect();
        Ok(instructions)
    }
}
