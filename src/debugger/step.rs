//! Source level stepping for the native engine.
//!
//! `step_over` installs temporary breakpoints at every statement of the
//! current function *and* at the frame's return address: a next-line-only
//! breakpoint misses the case where the current line calls out and execution
//! blocks inside the callee.

use crate::debugger::address::RelocatedAddress;
use crate::debugger::debugee::tracer::StopReason;
use crate::debugger::error::Error;
use crate::debugger::Debugger;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

/// Result of one stepping primitive.
#[derive(Debug, Clone, Copy)]
pub enum StepResult {
    Done,
    SignalInterrupt(Pid, Signal),
    WatchpointInterrupt(Pid, RelocatedAddress, u8),
    Exited(i32),
}

impl Debugger {
    /// Single instruction step, transparently stepping over an installed
    /// breakpoint at the current pc.
    ///
    /// An exit of the whole debuggee during the step is reported as a
    /// [`StopReason::DebugeeExit`], never as an error.
    pub(super) fn single_step_instruction(&mut self) -> Result<Option<StopReason>, Error> {
        let loc = self.ecx().location;
        let result = if self.breakpoints.get_enabled(loc.pc).is_some() {
            self.step_over_breakpoint()
        } else {
            let breakpoints = self.breakpoints.active_breakpoints();
            let ctx = crate::debugger::debugee::tracer::TraceContext::new(&breakpoints);
            self.debugee.tracer_mut().single_step(ctx, loc.pid)
        };
        let reason = match result {
            Ok(reason) => reason,
            Err(Error::ProcessExit(code)) => {
                self.debugee.execution_status =
                    crate::debugger::debugee::ExecutionStatus::Exited(code);
                return Ok(Some(StopReason::DebugeeExit(code)));
            }
            Err(e) => return Err(e),
        };
        self.ecx_update_location()?;
        Ok(reason)
    }

    /// If the focused thread sits on an enabled breakpoint, step through it:
    /// restore the byte, single-step, re-arm.
    pub(super) fn step_over_breakpoint(&mut self) -> Result<Option<StopReason>, Error> {
        let pid = self.ecx().location.pid;
        let pc = self
            .debugee
            .tracee_ctl()
            .tracee_ensure(pid)
            .pc()
            .map_err(Error::Ptrace)?;

        if let Some(brkpt) = self.breakpoints.get_enabled(pc) {
            if brkpt.is_enabled() {
                brkpt.disable().map_err(Error::Ptrace)?;
                let breakpoints = self.breakpoints.active_breakpoints();
                let ctx = crate::debugger::debugee::tracer::TraceContext::new(&breakpoints);
                let reason = self.debugee.tracer_mut().single_step(ctx, pid)?;
                if let Some(brkpt) = self.breakpoints.get_enabled(pc) {
                    brkpt.enable().map_err(Error::Ptrace)?;
                }
                self.ecx_update_location()?;
                return Ok(reason);
            }
        }
        Ok(None)
    }

    /// Step until the debuggee reaches a different source line (or the same
    /// line in a different frame).
    pub(super) fn step_in(&mut self) -> Result<StepResult, Error> {
        // find the starting place, stepping through code without line info
        let start_place = loop {
            let loc = self.ecx().location;
            if let Some(place) = self
                .debugee
                .debug_info()
                .find_place_from_pc(loc.global_pc)?
            {
                break place;
            }
            match self.single_step_instruction()? {
                Some(StopReason::SignalStop(pid, sign)) => {
                    return Ok(StepResult::SignalInterrupt(pid, sign));
                }
                Some(StopReason::Watchpoint(pid, addr, slot)) => {
                    return Ok(StepResult::WatchpointInterrupt(pid, addr, slot));
                }
                Some(StopReason::DebugeeExit(code)) => return Ok(StepResult::Exited(code)),
                _ => {}
            }
        };

        let start_cfa = self.current_frame_cfa()?;

        loop {
            match self.single_step_instruction()? {
                Some(StopReason::SignalStop(pid, sign)) => {
                    return Ok(StepResult::SignalInterrupt(pid, sign));
                }
                Some(StopReason::Watchpoint(pid, addr, slot)) => {
                    return Ok(StepResult::WatchpointInterrupt(pid, addr, slot));
                }
                Some(StopReason::DebugeeExit(code)) => return Ok(StepResult::Exited(code)),
                _ => {}
            }
            if self.debugee.is_exited() {
                return Ok(StepResult::Exited(0));
            }

            let loc = self.ecx().location;
            let debug_info = self.debugee.debug_info();
            let Some(place) = debug_info.find_exact_place_from_pc(loc.global_pc)? else {
                continue;
            };
            if !place.is_stmt {
                continue;
            }

            // skip function prologues
            if let Some((unit_idx, func)) = debug_info.find_function_by_pc(loc.global_pc) {
                if let Some(prolog_end) = debug_info.prolog_end(unit_idx, func) {
                    if loc.global_pc < prolog_end {
                        continue;
                    }
                }
            }

            let same_place = place.file == start_place.file
                && place.line_number == start_place.line_number;
            if !same_place {
                break;
            }
            let next_cfa = self.current_frame_cfa()?;
            if next_cfa != start_cfa {
                break;
            }
        }

        self.ecx_update_location()?;
        Ok(StepResult::Done)
    }

    /// Run until the current frame returns.
    pub(super) fn step_out_frame(&mut self) -> Result<StepResult, Error> {
        let pid = self.ecx().location.pid;

        if let Some(ret_addr) = self.debugee.return_addr(pid)? {
            let already_trapped = self.breakpoints.get_enabled(ret_addr).is_some();
            if !already_trapped {
                self.breakpoints
                    .add_temporary(ret_addr, self.debugee.proc_pid())?;
            }
            let reason = self.continue_raw()?;
            self.breakpoints.remove_all_temporary();

            match reason {
                StopReason::DebugeeExit(code) => return Ok(StepResult::Exited(code)),
                StopReason::SignalStop(pid, sign) => {
                    return Ok(StepResult::SignalInterrupt(pid, sign));
                }
                StopReason::Watchpoint(pid, addr, slot) => {
                    return Ok(StepResult::WatchpointInterrupt(pid, addr, slot));
                }
                _ => {}
            }
        }

        if self.debugee.is_exited() {
            return Ok(StepResult::Exited(0));
        }
        self.ecx_update_location()?;
        Ok(StepResult::Done)
    }

    /// Step to the next source line of the current function, without
    /// descending into callees.
    pub(super) fn step_over_line(&mut self) -> Result<StepResult, Error> {
        let proc_pid = self.debugee.proc_pid();

        // find the current function, stepping while there is no line info
        let (unit_idx, current_place) = loop {
            let loc = self.ecx().location;
            let debug_info = self.debugee.debug_info();
            if let Some((unit_idx, _)) = debug_info.find_function_by_pc(loc.global_pc) {
                let place = debug_info
                    .find_place_from_pc(loc.global_pc)?
                    .ok_or(Error::PlaceNotFound(loc.global_pc))?;
                break (unit_idx, place);
            }
            match self.single_step_instruction()? {
                Some(StopReason::SignalStop(pid, sign)) => {
                    return Ok(StepResult::SignalInterrupt(pid, sign));
                }
                Some(StopReason::Watchpoint(pid, addr, slot)) => {
                    return Ok(StepResult::WatchpointInterrupt(pid, addr, slot));
                }
                Some(StopReason::DebugeeExit(code)) => return Ok(StepResult::Exited(code)),
                _ => {}
            }
        };

        let loc = self.ecx().location;
        let mapping_offset = self.debugee.mapping_offset();

        let debug_info = self.debugee.debug_info();
        let (_, func) = debug_info.function_by_pc_ensure(loc.global_pc)?;
        let statement_places = debug_info.function_statement_places(unit_idx, func);

        let mut trap_addrs: Vec<RelocatedAddress> = statement_places
            .iter()
            .filter(|place| {
                place.address != current_place.address
                    && place.line_number != current_place.line_number
            })
            .map(|place| place.address.relocate(mapping_offset))
            .collect();

        let return_addr = self.debugee.return_addr(loc.pid)?;
        if let Some(ret) = return_addr {
            trap_addrs.push(ret);
        }

        for addr in trap_addrs {
            if self.breakpoints.get_enabled(addr).is_none() {
                self.breakpoints.add_temporary(addr, proc_pid)?;
            }
        }

        let reason = self.continue_raw()?;
        self.breakpoints.remove_all_temporary();

        match reason {
            StopReason::DebugeeExit(code) => return Ok(StepResult::Exited(code)),
            StopReason::SignalStop(pid, sign) => {
                return Ok(StepResult::SignalInterrupt(pid, sign));
            }
            StopReason::Watchpoint(pid, addr, slot) => {
                return Ok(StepResult::WatchpointInterrupt(pid, addr, slot));
            }
            _ => {}
        }

        // when the return-address trap fired mid-line (the line ended in a
        // call that completed), finish stepping to the next statement
        let new_loc = self.ecx().location;
        if Some(new_loc.pc) == return_addr {
            let place = self
                .debugee
                .debug_info()
                .find_place_from_pc(new_loc.global_pc)?;
            if let Some(place) = place {
                if place.address != new_loc.global_pc {
                    return self.step_in();
                }
            }
        }

        if self.debugee.is_exited() {
            return Ok(StepResult::Exited(0));
        }
        self.ecx_update_location()?;
        Ok(StepResult::Done)
    }
}
