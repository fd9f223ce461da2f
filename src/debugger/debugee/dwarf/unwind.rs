//! Stack unwinding: CFI (`.eh_frame` / `.debug_frame`) when available, frame
//! pointer chain otherwise.
//!
//! Every produced frame carries its own register snapshot and CFA, so later
//! variable inspection in a non-innermost frame can rebuild that frame's
//! frame base without touching live thread state.

use crate::debugger::address::{GlobalAddress, RelocatedAddress};
use crate::debugger::debugee::dwarf::eval::{EvalOption, ExpressionEvaluator};
use crate::debugger::debugee::dwarf::unit::Place;
use crate::debugger::debugee::dwarf::{DebugInformation, EndianArcSlice};
use crate::debugger::error::Error;
use crate::debugger::register::{DwarfRegisterMap, Register};
use crate::weak_error;
use gimli::{CfaRule, DebugFrame, EhFrame, RegisterRule, UnwindSection};
use nix::unistd::Pid;

const MAX_FRAMES: usize = 128;

/// Detailed information about a single stack frame in the unwind path.
#[derive(Debug, Clone)]
pub struct FrameSpan {
    pub func_name: Option<String>,
    pub fn_start_ip: Option<RelocatedAddress>,
    pub ip: RelocatedAddress,
    pub place: Option<Place>,
    pub cfa: RelocatedAddress,
    /// Register file restored for this frame.
    pub registers: DwarfRegisterMap,
}

pub type Backtrace = Vec<FrameSpan>;

pub struct Unwinder<'a> {
    debug_info: &'a DebugInformation,
    mapping_offset: usize,
    pid: Pid,
}

impl<'a> Unwinder<'a> {
    pub fn new(debug_info: &'a DebugInformation, mapping_offset: usize, pid: Pid) -> Self {
        Self {
            debug_info,
            mapping_offset,
            pid,
        }
    }

    /// Unwind the call stack starting from the given register state.
    pub fn unwind(&self, initial_registers: DwarfRegisterMap) -> Result<Backtrace, Error> {
        let ip_reg = Register::Rip.dwarf_register().expect("rip maps to dwarf");
        let sp_reg = Register::Rsp.dwarf_register().expect("rsp maps to dwarf");

        let mut registers = initial_registers;
        let mut bt: Backtrace = vec![];
        let mut prev_ip: Option<u64> = None;

        while bt.len() < MAX_FRAMES {
            let ip = registers.value(ip_reg)?;
            if ip == 0 || prev_ip == Some(ip) {
                break;
            }
            prev_ip = Some(ip);

            let reloc_ip = RelocatedAddress::from(ip);
            let global_ip = reloc_ip.into_global(self.mapping_offset);

            let step = match self.cfi_step(&registers, global_ip)? {
                Some(step) => Some(step),
                None => self.fp_step(&registers),
            };

            let (cfa, return_addr, next_registers) = match step {
                Some(s) => s,
                None => {
                    // no unwind info at all: record the frame with its own
                    // registers and stop
                    bt.push(self.frame_span(reloc_ip, global_ip, registers.clone(), reloc_ip)?);
                    break;
                }
            };

            bt.push(self.frame_span(
                reloc_ip,
                global_ip,
                registers.clone(),
                RelocatedAddress::from(cfa),
            )?);

            let Some(ra) = return_addr else { break };
            if ra == 0 {
                break;
            }

            registers = next_registers;
            registers.update(ip_reg, ra);
            registers.update(sp_reg, cfa);
        }

        Ok(bt)
    }

    /// Return address of the innermost frame.
    pub fn return_address(&self, registers: DwarfRegisterMap) -> Result<Option<RelocatedAddress>, Error> {
        let ip = registers.value(Register::Rip.dwarf_register().expect("rip maps to dwarf"))?;
        let global = RelocatedAddress::from(ip).into_global(self.mapping_offset);
        let step = match self.cfi_step(&registers, global)? {
            Some(step) => Some(step),
            None => self.fp_step(&registers),
        };
        Ok(step
            .and_then(|(_, ra, _)| ra)
            .filter(|ra| *ra != 0)
            .map(RelocatedAddress::from))
    }

    fn frame_span(
        &self,
        ip: RelocatedAddress,
        global_ip: GlobalAddress,
        registers: DwarfRegisterMap,
        cfa: RelocatedAddress,
    ) -> Result<FrameSpan, Error> {
        let function = self.debug_info.find_function_by_pc(global_ip);
        let fn_start_ip = function
            .as_ref()
            .and_then(|(_, f)| f.start_pc())
            .map(|pc| pc.relocate(self.mapping_offset));
        let func_name = function.and_then(|(_, f)| f.full_name.clone().or_else(|| f.name.clone()));
        let place = self.debug_info.find_place_from_pc(global_ip)?;

        Ok(FrameSpan {
            func_name,
            fn_start_ip,
            ip,
            place,
            cfa,
            registers,
        })
    }

    /// One CFI unwind step. `None` when no FDE covers the pc.
    #[allow(clippy::type_complexity)]
    fn cfi_step(
        &self,
        registers: &DwarfRegisterMap,
        pc: GlobalAddress,
    ) -> Result<Option<(u64, Option<u64>, DwarfRegisterMap)>, Error> {
        let dwarf = self.debug_info;
        let mut ucx = Box::new(gimli::UnwindContext::new());

        let (cie_ra_register, row) = match dwarf.eh_frame.fde_for_address(
            &dwarf.bases,
            pc.into(),
            EhFrame::cie_from_offset,
        ) {
            Ok(fde) => {
                let ra = fde.cie().return_address_register();
                let row = fde
                    .unwind_info_for_address(&dwarf.eh_frame, &dwarf.bases, &mut ucx, pc.into())?
                    .clone();
                (ra, row)
            }
            Err(gimli::Error::NoUnwindInfoForAddress) => {
                let Some(debug_frame) = dwarf.debug_frame.as_ref() else {
                    return Ok(None);
                };
                let fde = match debug_frame.fde_for_address(
                    &dwarf.bases,
                    pc.into(),
                    DebugFrame::cie_from_offset,
                ) {
                    Ok(fde) => fde,
                    Err(gimli::Error::NoUnwindInfoForAddress) => return Ok(None),
                    Err(e) => return Err(e.into()),
                };
                let ra = fde.cie().return_address_register();
                let row = fde
                    .unwind_info_for_address(debug_frame, &dwarf.bases, &mut ucx, pc.into())?
                    .clone();
                (ra, row)
            }
            Err(e) => return Err(e.into()),
        };

        let cfa = match row.cfa() {
            CfaRule::RegisterAndOffset { register, offset } => {
                (registers.value(*register)? as i64 + offset) as u64
            }
            CfaRule::Expression(expr) => {
                self.evaluate_unwind_expression(registers, pc, expr.clone(), None)?
            }
        };

        let mut next_registers = registers.clone();
        for (register, rule) in row.registers() {
            let value = match rule {
                RegisterRule::Undefined => continue,
                RegisterRule::SameValue => match weak_error!(registers.value(*register)) {
                    Some(v) => v,
                    None => continue,
                },
                RegisterRule::Offset(offset) => {
                    let addr = (cfa as i64 + offset) as usize;
                    match weak_error!(self.read_word(addr)) {
                        Some(v) => v,
                        None => continue,
                    }
                }
                RegisterRule::ValOffset(offset) => (cfa as i64 + offset) as u64,
                RegisterRule::Register(reg) => match weak_error!(registers.value(*reg)) {
                    Some(v) => v,
                    None => continue,
                },
                RegisterRule::Expression(expr) => {
                    let addr = match weak_error!(self.evaluate_unwind_expression(
                        registers,
                        pc,
                        expr.clone(),
                        Some(cfa)
                    )) {
                        Some(v) => v as usize,
                        None => continue,
                    };
                    match weak_error!(self.read_word(addr)) {
                        Some(v) => v,
                        None => continue,
                    }
                }
                RegisterRule::ValExpression(expr) => {
                    match weak_error!(self.evaluate_unwind_expression(
                        registers,
                        pc,
                        expr.clone(),
                        Some(cfa)
                    )) {
                        Some(v) => v,
                        None => continue,
                    }
                }
                RegisterRule::Constant(value) => *value,
                RegisterRule::Architectural => continue,
                _ => continue,
            };
            next_registers.update(*register, value);
        }

        let return_addr = next_registers.value(cie_ra_register).ok();
        Ok(Some((cfa, return_addr, next_registers)))
    }

    /// Frame pointer chain step: `[FP]` is the next FP, `[FP + 8]` the
    /// return address.
    fn fp_step(
        &self,
        registers: &DwarfRegisterMap,
    ) -> Option<(u64, Option<u64>, DwarfRegisterMap)> {
        let fp_reg = Register::Rbp.dwarf_register().expect("rbp maps to dwarf");
        let fp = registers.value(fp_reg).ok()?;
        if fp == 0 {
            return None;
        }

        let next_fp = self.read_word(fp as usize).ok()?;
        let ra = self.read_word(fp as usize + 8).ok()?;
        if ra == 0 {
            return None;
        }

        let mut next_registers = registers.clone();
        next_registers.update(fp_reg, next_fp);

        Some((fp + 16, Some(ra), next_registers))
    }

    fn evaluate_unwind_expression(
        &self,
        registers: &DwarfRegisterMap,
        pc: GlobalAddress,
        expr: gimli::Expression<EndianArcSlice>,
        cfa: Option<u64>,
    ) -> Result<u64, Error> {
        let (_, unit) = self
            .debug_info
            .find_unit_by_pc(pc)
            .ok_or(Error::UnwindNoContext)?;
        let evaluator = ExpressionEvaluator::new(
            self.debug_info.dwarf(),
            unit,
            self.pid,
            registers,
            self.mapping_offset,
        );
        let mut opts = EvalOption::new();
        if let Some(cfa) = cfa {
            opts = opts.with_cfa(cfa);
        }
        evaluator
            .evaluate_with_opts(expr, opts)?
            .into_location_value()
    }

    fn read_word(&self, addr: usize) -> Result<u64, Error> {
        let bytes = crate::debugger::read_memory_by_pid(self.pid, addr, 8).map_err(Error::Ptrace)?;
        let arr: [u8; 8] = bytes
            .try_into()
            .map_err(|data: Vec<u8>| Error::TypeBinaryRepr("u64", data.into_boxed_slice()))?;
        Ok(u64::from_ne_bytes(arr))
    }
}
