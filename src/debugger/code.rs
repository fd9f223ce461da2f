//! `si_code` values relevant for SIGTRAP analysis.

use nix::libc::c_int;

/// Breakpoint trap.
pub const TRAP_BRKPT: c_int = 0x1;
/// Single-step trap.
pub const TRAP_TRACE: c_int = 0x2;
/// Hardware breakpoint or watchpoint trap.
pub const TRAP_HWBKPT: c_int = 0x4;
/// Sent by the kernel (int3 on some kernel versions arrives with this code).
pub const SI_KERNEL: c_int = 0x80;

/// x86-64 software breakpoint opcode (`int3`).
pub const INT3: u8 = 0xCC;
