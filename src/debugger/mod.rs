//! Native debugging engine: ptrace process control composed with the DWARF
//! reader, expression evaluation, stack unwinding and breakpoint management.

pub mod address;
pub mod breakpoint;
pub mod code;
pub mod debugee;
pub mod disasm;
pub mod error;
pub mod expr;
pub mod process;
pub mod register;
mod step;
pub mod variable;
pub mod watchpoint;

pub use step::StepResult;

use crate::debugger::address::{GlobalAddress, RelocatedAddress};
use crate::debugger::breakpoint::{
    BreakpointKind, BreakpointRegistry, LogicalBreakpoint,
};
use crate::debugger::debugee::dwarf::unwind::{Backtrace, FrameSpan};
use crate::debugger::debugee::tracee::Tracee;
use crate::debugger::debugee::tracer::{StopReason, TraceContext};
use crate::debugger::debugee::{Debugee, Location};
use crate::debugger::disasm::{Disassembler, Instruction};
use crate::debugger::error::Error;
use crate::debugger::expr::{DivisionSemantics, ExprValue};
use crate::debugger::process::{Child, Installed};
use crate::debugger::register::{Register, RegisterMap};
use crate::debugger::variable::{FrameContext, VariableView};
use crate::debugger::watchpoint::{WatchAccess, WatchpointRegistry};
use log::info;
use nix::libc::c_long;
use nix::sys;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::ffi::c_void;
use std::mem;
use std::path::Path;

/// Position of the debugger's attention: a thread and a frame.
#[derive(Debug, Clone, Copy)]
pub struct ExplorationContext {
    pub location: Location,
    pub frame_num: u32,
}

impl ExplorationContext {
    pub fn new(location: Location, frame_num: u32) -> Self {
        Self { location, frame_num }
    }
}

/// Options shared by all breakpoint constructors.
#[derive(Debug, Clone, Default)]
pub struct BreakpointOptions {
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
    pub log_message: Option<String>,
}

/// Outcome of a `continue` visible to the driver.
#[derive(Debug, Clone)]
pub enum ContinueOutcome {
    Breakpoint(Pid, RelocatedAddress, Vec<u32>),
    Signal(Pid, Signal),
    Watchpoint(Pid, RelocatedAddress, Option<u32>),
    Exited(i32),
    EntryPoint(Pid),
}

pub struct Debugger {
    pub(crate) debugee: Debugee,
    pub(crate) breakpoints: BreakpointRegistry,
    watchpoints: WatchpointRegistry,
    ecx: ExplorationContext,
    division: DivisionSemantics,
    disassembler: Disassembler,
    /// Breakpoint log-message output produced during transparent continues.
    messages: Vec<String>,
}

impl Debugger {
    pub fn new(process: Child<Installed>) -> Result<Self, Error> {
        let pid = process.pid();
        let debugee = Debugee::new(process)?;
        Ok(Self::with_debugee(debugee, pid))
    }

    pub fn new_attached(process: Child<Installed>) -> Result<Self, Error> {
        let pid = process.pid();
        let debugee = Debugee::new_attached(process)?;
        Ok(Self::with_debugee(debugee, pid))
    }

    fn with_debugee(debugee: Debugee, pid: Pid) -> Self {
        Self {
            debugee,
            breakpoints: BreakpointRegistry::new(),
            watchpoints: WatchpointRegistry::new(),
            ecx: ExplorationContext::new(
                Location {
                    pc: RelocatedAddress::from(0_usize),
                    global_pc: GlobalAddress::from(0_usize),
                    pid,
                },
                0,
            ),
            division: DivisionSemantics::Truncating,
            disassembler: Disassembler::new().expect("capstone must initialize"),
            messages: vec![],
        }
    }

    pub fn set_division_semantics(&mut self, semantics: DivisionSemantics) {
        self.division = semantics;
    }

    pub fn ecx(&self) -> &ExplorationContext {
        &self.ecx
    }

    pub fn debugee(&self) -> &Debugee {
        &self.debugee
    }

    pub(crate) fn ecx_update_location(&mut self) -> Result<(), Error> {
        if self.debugee.is_exited() {
            return Ok(());
        }
        let pid = self.debugee.tracee_ctl().tracee_in_focus().pid;
        let location = self.debugee.tracee_location(pid)?;
        self.ecx = ExplorationContext::new(location, 0);
        Ok(())
    }

    fn set_focus(&mut self, pid: Pid) -> Result<(), Error> {
        self.debugee.tracee_ctl_mut().set_tracee_to_focus(pid);
        self.ecx_update_location()
    }

    /// Run the freshly spawned debuggee until it stops at its entry point.
    pub fn start_debugee(&mut self) -> Result<(), Error> {
        let breakpoints = self.breakpoints.active_breakpoints();
        let ctx = TraceContext::new(&breakpoints);
        match self.debugee.trace_until_stop(ctx)? {
            StopReason::DebugeeStart => {
                info!(target: "debugger", "debuggee started, entry stop");
                self.ecx_update_location()?;
                Ok(())
            }
            StopReason::DebugeeExit(code) => Err(Error::SpawnFailed(format!(
                "debuggee exited with code {code} before reaching its entry point"
            ))),
            other => Err(Error::SpawnFailed(format!(
                "unexpected stop while starting debuggee: {other:?}"
            ))),
        }
    }

    /// Low level continue: steps over the current breakpoint if any, then
    /// resumes until the tracer reports a stop.
    pub(crate) fn continue_raw(&mut self) -> Result<StopReason, Error> {
        // stepping over the current trap may itself be interrupted
        let step = match self.step_over_breakpoint() {
            Ok(reason) => reason,
            Err(Error::ProcessExit(code)) => {
                self.debugee.execution_status = debugee::ExecutionStatus::Exited(code);
                return Ok(StopReason::DebugeeExit(code));
            }
            Err(e) => return Err(e),
        };
        if let Some(reason) = step {
            match reason {
                StopReason::SignalStop(pid, _) | StopReason::Watchpoint(pid, _, _) => {
                    self.set_focus(pid)?;
                    return Ok(reason);
                }
                StopReason::DebugeeExit(_) => return Ok(reason),
                _ => {}
            }
        }
        if self.debugee.is_exited() {
            return Ok(StopReason::DebugeeExit(0));
        }

        let breakpoints = self.breakpoints.active_breakpoints();
        let ctx = TraceContext::new(&breakpoints);
        let reason = self.debugee.trace_until_stop(ctx)?;

        match reason {
            StopReason::Breakpoint(pid, _)
            | StopReason::SignalStop(pid, _)
            | StopReason::Watchpoint(pid, _, _) => {
                self.set_focus(pid)?;
            }
            _ => {}
        }
        Ok(reason)
    }

    /// Continue execution, applying conditions, hit counts and log messages
    /// of logical breakpoints. Transparent stops are consumed internally.
    pub fn continue_debugee(&mut self) -> Result<ContinueOutcome, Error> {
        loop {
            let reason = match self.continue_raw() {
                Ok(reason) => reason,
                Err(Error::ProcessExit(code)) => {
                    self.debugee.execution_status = debugee::ExecutionStatus::Exited(code);
                    return Ok(ContinueOutcome::Exited(code));
                }
                Err(e) => return Err(e),
            };
            match reason {
                StopReason::DebugeeExit(code) => return Ok(ContinueOutcome::Exited(code)),
                StopReason::NoSuchProcess(_) => return Ok(ContinueOutcome::Exited(0)),
                StopReason::DebugeeStart => {
                    return Ok(ContinueOutcome::EntryPoint(self.ecx.location.pid))
                }
                StopReason::SignalStop(pid, signal) => {
                    return Ok(ContinueOutcome::Signal(pid, signal))
                }
                StopReason::Watchpoint(pid, addr, slot) => {
                    let id = self.watchpoints.by_slot(slot).map(|wp| wp.id);
                    return Ok(ContinueOutcome::Watchpoint(pid, addr, id));
                }
                StopReason::Breakpoint(pid, addr) => {
                    let ids: Vec<u32> = self
                        .breakpoints
                        .owners_at(addr)
                        .iter()
                        .map(|bp| bp.id)
                        .collect();
                    if ids.is_empty() {
                        // a temporary (stepping) trap or an unknown int3
                        return Ok(ContinueOutcome::Breakpoint(pid, addr, ids));
                    }

                    let mut stop = false;
                    for id in &ids {
                        if let Some(bp) = self.breakpoints.get_mut(*id) {
                            bp.hits += 1;
                        }
                        if self.breakpoint_wants_stop(*id)? {
                            stop = true;
                        }
                    }
                    if stop {
                        return Ok(ContinueOutcome::Breakpoint(pid, addr, ids));
                    }
                    // transparent: conditions rejected the stop, resume
                }
            }
        }
    }

    fn breakpoint_wants_stop(&mut self, id: u32) -> Result<bool, Error> {
        let Some(bp) = self.breakpoints.get(id) else {
            return Ok(true);
        };
        if !bp.hit_condition_met() {
            return Ok(false);
        }

        if let Some(condition) = bp.condition.clone() {
            let truthy = match self.evaluate_expression(&condition, 0) {
                Ok(value) => expr_is_truthy(&value),
                // a broken condition must not suppress the stop
                Err(_) => true,
            };
            if !truthy {
                return Ok(false);
            }
        }

        if let Some(template) = self.breakpoints.get(id).and_then(|bp| bp.log_message.clone()) {
            let rendered = self.render_log_message(&template);
            self.messages.push(rendered);
            return Ok(false);
        }

        Ok(true)
    }

    fn render_log_message(&mut self, template: &str) -> String {
        let mut out = String::new();
        let mut rest = template;
        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let Some(end) = rest[start..].find('}') else {
                rest = &rest[start..];
                break;
            };
            let expr = &rest[start + 1..start + end];
            match self.evaluate_expression(expr, 0) {
                Ok(value) => out.push_str(&value.render()),
                Err(_) => {
                    out.push('{');
                    out.push_str(expr);
                    out.push('}');
                }
            }
            rest = &rest[start + end + 1..];
        }
        out.push_str(rest);
        out
    }

    /// Log-message output accumulated since the last drain.
    pub fn drain_messages(&mut self) -> Vec<String> {
        mem::take(&mut self.messages)
    }

    // ---------------------------------- stepping ------------------------------------------------

    pub fn step_into(&mut self) -> Result<StepResult, Error> {
        self.ensure_stopped()?;
        self.step_in()
    }

    pub fn step_over(&mut self) -> Result<StepResult, Error> {
        self.ensure_stopped()?;
        self.step_over_line()
    }

    pub fn step_out(&mut self) -> Result<StepResult, Error> {
        self.ensure_stopped()?;
        self.step_out_frame()
    }

    pub fn step_instruction(&mut self) -> Result<StepResult, Error> {
        self.ensure_stopped()?;
        match self.single_step_instruction()? {
            Some(StopReason::SignalStop(pid, sign)) => Ok(StepResult::SignalInterrupt(pid, sign)),
            Some(StopReason::Watchpoint(pid, addr, slot)) => {
                Ok(StepResult::WatchpointInterrupt(pid, addr, slot))
            }
            Some(StopReason::DebugeeExit(code)) => Ok(StepResult::Exited(code)),
            _ => Ok(StepResult::Done),
        }
    }

    /// Move the program counter of the focused thread to the first address
    /// of a source line, without executing the code in between.
    pub fn jump_to_line(&mut self, file: &Path, line: u64) -> Result<(), Error> {
        self.ensure_stopped()?;
        let places = self.debugee.debug_info().find_places_for_line(file, line);
        let place = places.first().ok_or(Error::NoSuitablePlace)?;
        let addr = place.address.relocate(self.debugee.mapping_offset());
        let pid = self.ecx.location.pid;
        self.debugee
            .tracee_ctl()
            .tracee_ensure(pid)
            .set_pc(addr.as_u64())
            .map_err(Error::Ptrace)?;
        self.ecx_update_location()
    }

    fn ensure_stopped(&self) -> Result<(), Error> {
        if self.debugee.is_exited() {
            return Err(Error::ProcessExit(self.exit_code().unwrap_or(0)));
        }
        if !self.debugee.is_in_progress() {
            return Err(Error::ProcessNotStarted);
        }
        Ok(())
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.debugee.execution_status {
            debugee::ExecutionStatus::Exited(code) => Some(code),
            _ => None,
        }
    }

    // ---------------------------------- breakpoints ---------------------------------------------

    pub fn set_breakpoint_at_line(
        &mut self,
        file: &Path,
        line: u64,
        opts: BreakpointOptions,
    ) -> Result<LogicalBreakpoint, Error> {
        let places = self.debugee.debug_info().find_places_for_line(file, line);
        if places.is_empty() {
            return Err(Error::NoSuitablePlace);
        }
        let mapping_offset = self.debugee.mapping_offset();
        let addresses = places
            .iter()
            .map(|p| p.address.relocate(mapping_offset))
            .collect();

        let bp = LogicalBreakpoint {
            id: 0,
            kind: BreakpointKind::Line,
            file: Some(file.to_path_buf()),
            line: places.first().map(|p| p.line_number),
            function: None,
            condition: opts.condition,
            hit_condition: opts.hit_condition,
            log_message: opts.log_message,
            filters: vec![],
            addresses,
            verified: false,
            hits: 0,
        };
        self.breakpoints
            .add_logical(bp, self.debugee.proc_pid())
            .cloned()
    }

    pub fn set_breakpoint_at_fn(
        &mut self,
        name: &str,
        opts: BreakpointOptions,
    ) -> Result<LogicalBreakpoint, Error> {
        let debug_info = self.debugee.debug_info();
        let (unit_idx, func) = debug_info.find_function_by_name(name)?;
        let addr = debug_info
            .prolog_end(unit_idx, func)
            .or_else(|| func.start_pc())
            .ok_or(Error::NoSuitablePlace)?;
        let place = debug_info.find_place_from_pc(addr)?;
        let addr = addr.relocate(self.debugee.mapping_offset());

        let bp = LogicalBreakpoint {
            id: 0,
            kind: BreakpointKind::Function,
            file: place.as_ref().map(|p| p.file.clone()),
            line: place.map(|p| p.line_number),
            function: Some(name.to_string()),
            condition: opts.condition,
            hit_condition: opts.hit_condition,
            log_message: opts.log_message,
            filters: vec![],
            addresses: vec![addr],
            verified: false,
            hits: 0,
        };
        self.breakpoints
            .add_logical(bp, self.debugee.proc_pid())
            .cloned()
    }

    pub fn set_breakpoint_at_address(
        &mut self,
        addr: RelocatedAddress,
        opts: BreakpointOptions,
    ) -> Result<LogicalBreakpoint, Error> {
        let place = self
            .debugee
            .debug_info()
            .find_place_from_pc(addr.into_global(self.debugee.mapping_offset()))?;

        let bp = LogicalBreakpoint {
            id: 0,
            kind: BreakpointKind::Instruction,
            file: place.as_ref().map(|p| p.file.clone()),
            line: place.map(|p| p.line_number),
            function: None,
            condition: opts.condition,
            hit_condition: opts.hit_condition,
            log_message: opts.log_message,
            filters: vec![],
            addresses: vec![addr],
            verified: false,
            hits: 0,
        };
        self.breakpoints
            .add_logical(bp, self.debugee.proc_pid())
            .cloned()
    }

    /// Exception breakpoints are purely logical on the native engine: they
    /// decide whether a signal stop is surfaced to the client.
    pub fn set_exception_breakpoint(
        &mut self,
        filters: Vec<String>,
    ) -> Result<LogicalBreakpoint, Error> {
        let bp = LogicalBreakpoint {
            id: 0,
            kind: BreakpointKind::Exception,
            file: None,
            line: None,
            function: None,
            condition: None,
            hit_condition: None,
            log_message: None,
            filters,
            addresses: vec![],
            verified: false,
            hits: 0,
        };
        self.breakpoints
            .add_logical(bp, self.debugee.proc_pid())
            .cloned()
    }

    pub fn remove_breakpoint(&mut self, id: u32) -> Result<LogicalBreakpoint, Error> {
        self.breakpoints.remove_logical(id)
    }

    pub fn breakpoints_list(&self) -> Vec<LogicalBreakpoint> {
        self.breakpoints.list().into_iter().cloned().collect()
    }

    /// Valid breakpoint positions for a line range.
    pub fn breakpoint_locations(
        &self,
        file: &Path,
        line: u64,
        end_line: u64,
    ) -> Vec<debugee::dwarf::unit::Place> {
        self.debugee
            .debug_info()
            .breakpoint_locations(file, line, end_line)
    }

    // ---------------------------------- watchpoints ---------------------------------------------

    pub fn set_watchpoint_at_address(
        &mut self,
        addr: usize,
        size: u8,
        access: WatchAccess,
        variable: Option<String>,
    ) -> Result<u32, Error> {
        self.ensure_stopped()?;
        let tracees: Vec<Pid> = self
            .debugee
            .tracee_ctl()
            .snapshot()
            .iter()
            .map(|t| t.pid)
            .collect();
        self.watchpoints
            .set(&tracees, addr, size, access, variable)
            .map(|wp| wp.id)
    }

    pub fn set_watchpoint_on_variable(
        &mut self,
        name: &str,
        frame_num: u32,
        access: WatchAccess,
    ) -> Result<u32, Error> {
        let view = self.read_variable(name, frame_num)?;
        let addr = view.address.ok_or(Error::NotAddressable)?;
        let size = match view.byte_size {
            s @ (1 | 2 | 4 | 8) => s as u8,
            _ => 8,
        };
        self.set_watchpoint_at_address(addr, size, access, Some(name.to_string()))
    }

    pub fn remove_watchpoint(&mut self, id: u32) -> Result<(), Error> {
        let tracees: Vec<Pid> = self
            .debugee
            .tracee_ctl()
            .snapshot()
            .iter()
            .map(|t| t.pid)
            .collect();
        self.watchpoints.remove(&tracees, id)
    }

    pub fn watchpoints_list(&self) -> Vec<watchpoint::Watchpoint> {
        self.watchpoints.list().into_iter().cloned().collect()
    }

    // ---------------------------------- inspection ----------------------------------------------

    pub fn backtrace(&self, pid: Pid) -> Result<Backtrace, Error> {
        self.ensure_stopped()?;
        self.debugee.unwind(pid)
    }

    /// CFA of the innermost frame of the focused thread.
    pub(crate) fn current_frame_cfa(&self) -> Result<RelocatedAddress, Error> {
        let bt = self.debugee.unwind(self.ecx.location.pid)?;
        bt.first()
            .map(|frame| frame.cfa)
            .ok_or(Error::UnwindNoContext)
    }

    pub fn frame(&self, frame_num: u32) -> Result<FrameSpan, Error> {
        let bt = self.backtrace(self.ecx.location.pid)?;
        bt.into_iter()
            .nth(frame_num as usize)
            .ok_or(Error::FrameNotFound(frame_num))
    }

    fn frame_ctx<'a>(&'a self, frame: &'a FrameSpan) -> Result<FrameContext<'a>, Error> {
        let mapping_offset = self.debugee.mapping_offset();
        let global_pc = frame.ip.into_global(mapping_offset);
        let debug_info = self.debugee.debug_info();

        let function = debug_info.find_function_by_pc(global_pc);
        let (unit_idx, func) = match function {
            Some((unit_idx, func)) => (unit_idx, Some(func)),
            None => (
                debug_info.find_unit_by_pc(global_pc).map(|(i, _)| i).unwrap_or(0),
                None,
            ),
        };

        let frame_base = match func.and_then(|f| f.frame_base.clone()) {
            Some(gimli::AttributeValue::Exprloc(expr)) => {
                let evaluator = debugee::dwarf::eval::ExpressionEvaluator::new(
                    debug_info.dwarf(),
                    debug_info.unit(unit_idx),
                    self.ecx.location.pid,
                    &frame.registers,
                    mapping_offset,
                );
                let opts = debugee::dwarf::eval::EvalOption::new().with_cfa(frame.cfa.as_u64());
                evaluator
                    .evaluate_with_opts(expr, opts)?
                    .into_location_value()
                    .ok()
            }
            _ => None,
        };

        Ok(FrameContext {
            debugee: &self.debugee,
            pid: self.ecx.location.pid,
            frame,
            global_pc,
            unit_idx,
            func,
            frame_base,
        })
    }

    pub fn read_variable(&self, name: &str, frame_num: u32) -> Result<VariableView, Error> {
        let frame = self.frame(frame_num)?;
        let ctx = self.frame_ctx(&frame)?;
        variable::read_variable(&ctx, name)
    }

    /// All parameters and in-scope locals of a frame.
    pub fn frame_variables(&self, frame_num: u32) -> Result<Vec<VariableView>, Error> {
        let frame = self.frame(frame_num)?;
        let ctx = self.frame_ctx(&frame)?;
        let Some(func) = ctx.func else {
            return Ok(vec![]);
        };

        let mut views = vec![];
        for die in func.parameters.iter().chain(func.variables.iter()) {
            if die.name.is_none() {
                continue;
            }
            if let Some(scope) = &die.lexical_scope {
                if !ctx.global_pc.in_ranges(scope) {
                    continue;
                }
            }
            if let Some(view) =
                crate::muted_error!(variable::read_variable_die(&ctx, ctx.unit_idx, die))
            {
                views.push(view);
            }
        }
        Ok(views)
    }

    pub fn evaluate_expression(&mut self, source: &str, frame_num: u32) -> Result<ExprValue, Error> {
        let parsed = expr::parse(source)?;
        let frame = self.frame(frame_num)?;
        let ctx = self.frame_ctx(&frame)?;
        expr::evaluate(&ctx, &parsed, self.division)
    }

    pub fn variable_children(&self, view: &VariableView) -> Result<Vec<VariableView>, Error> {
        variable::children(&self.debugee, self.ecx.location.pid, view)
    }

    pub fn set_variable(&mut self, name: &str, value: &str, frame_num: u32) -> Result<VariableView, Error> {
        let view = self.read_variable(name, frame_num)?;
        variable::write_value(&self.debugee, self.ecx.location.pid, &view, value)?;
        self.read_variable(name, frame_num)
    }

    /// Assign to the location an expression resolves to.
    pub fn set_expression(&mut self, source: &str, value: &str, frame_num: u32) -> Result<VariableView, Error> {
        let target = match self.evaluate_expression(source, frame_num)? {
            ExprValue::Var(view) => view,
            _ => return Err(Error::NotAddressable),
        };
        variable::write_value(&self.debugee, self.ecx.location.pid, &target, value)?;
        match self.evaluate_expression(source, frame_num)? {
            ExprValue::Var(view) => Ok(view),
            _ => Err(Error::NotAddressable),
        }
    }

    /// Resolve the location of a variable without reading it.
    pub fn variable_location(&self, name: &str, frame_num: u32) -> Result<Option<usize>, Error> {
        Ok(self.read_variable(name, frame_num)?.address)
    }

    pub fn threads(&self) -> Result<Vec<(Tracee, Option<String>)>, Error> {
        Ok(self
            .debugee
            .tracee_ctl()
            .snapshot()
            .into_iter()
            .map(|t| {
                let name = t.name();
                (t, name)
            })
            .collect())
    }

    pub fn set_focus_thread(&mut self, pid: Pid) -> Result<(), Error> {
        if self.debugee.tracee_ctl().tracee(pid).is_none() {
            return Err(Error::TraceeNotFound(pid.as_raw()));
        }
        self.set_focus(pid)
    }

    pub fn read_memory(&self, addr: usize, size: usize) -> Result<Vec<u8>, Error> {
        self.ensure_stopped()?;
        read_memory_by_pid(self.debugee.proc_pid(), addr, size)
            .map_err(|_| Error::MemoryAccess(addr))
    }

    pub fn write_memory(&self, addr: usize, data: &[u8]) -> Result<(), Error> {
        self.ensure_stopped()?;
        write_memory_by_pid(self.debugee.proc_pid(), addr, data)
            .map_err(|_| Error::MemoryAccess(addr))
    }

    pub fn current_thread_registers(&self, pid: Option<Pid>) -> Result<Vec<(String, u64)>, Error> {
        self.ensure_stopped()?;
        let pid = pid.unwrap_or(self.ecx.location.pid);
        let map = RegisterMap::current(pid).map_err(Error::Ptrace)?;
        Ok(map
            .snapshot()
            .into_iter()
            .map(|(reg, value)| (reg.to_string(), value))
            .collect())
    }

    pub fn set_register_value(&self, name: &str, value: u64, pid: Option<Pid>) -> Result<(), Error> {
        self.ensure_stopped()?;
        let pid = pid.unwrap_or(self.ecx.location.pid);
        let register = Register::from_name(name)?;
        let mut map = RegisterMap::current(pid).map_err(Error::Ptrace)?;
        map.update(register, value);
        map.persist(pid).map_err(Error::Ptrace)
    }

    pub fn disasm(&self, addr: RelocatedAddress, count: usize) -> Result<Vec<Instruction>, Error> {
        self.ensure_stopped()?;
        let breakpoints = self.breakpoints.active_breakpoints();
        self.disassembler
            .disasm(self.debugee.proc_pid(), addr, count, &breakpoints)
    }

    /// Annotate an instruction address with the owning function, if known.
    pub fn symbol_at(&self, addr: RelocatedAddress) -> Option<String> {
        let global = addr.into_global(self.debugee.mapping_offset());
        self.debugee
            .debug_info()
            .find_function_by_pc(global)
            .and_then(|(_, f)| f.full_name.clone().or_else(|| f.name.clone()))
    }

    pub fn find_symbols(&self, pattern: &str) -> Result<Vec<debugee::dwarf::Symbol>, Error> {
        Ok(self
            .debugee
            .debug_info()
            .find_symbols(pattern)?
            .into_iter()
            .cloned()
            .collect())
    }

    // ---------------------------------- lifecycle -----------------------------------------------

    /// Tear the session down: restore every trap, free debug registers and
    /// either kill the spawned debuggee or detach from an attached one.
    pub fn stop_debugee(&mut self, terminate: bool) -> Result<(), Error> {
        let tracees: Vec<Pid> = self
            .debugee
            .tracee_ctl()
            .snapshot()
            .iter()
            .map(|t| t.pid)
            .collect();

        if !self.debugee.is_exited() {
            self.watchpoints.clear(&tracees);
            self.breakpoints.clear();

            let proc_pid = self.debugee.proc_pid();
            if terminate {
                let _ = sys::signal::kill(proc_pid, Signal::SIGKILL);
                let _ = nix::sys::wait::waitpid(proc_pid, None);
            } else {
                for pid in tracees {
                    let _ = sys::ptrace::detach(pid, None);
                }
            }
            self.debugee.execution_status = debugee::ExecutionStatus::Exited(0);
        } else {
            self.watchpoints = WatchpointRegistry::new();
            self.breakpoints.clear();
        }
        Ok(())
    }
}

impl Drop for Debugger {
    fn drop(&mut self) {
        let terminate = !self.debugee.process().is_external();
        let _ = self.stop_debugee(terminate);
    }
}

fn expr_is_truthy(value: &ExprValue) -> bool {
    match value {
        ExprValue::Int(v) => *v != 0,
        ExprValue::Float(v) => *v != 0.0,
        ExprValue::Var(view) => view
            .raw
            .as_ref()
            .map(|raw| raw.iter().any(|b| *b != 0))
            .unwrap_or(false),
    }
}

/// Read N bytes from the `pid` process address space.
///
/// Bulk reads go through `process_vm_readv`; a ptrace word loop is the
/// fallback when the fast path is unavailable.
pub fn read_memory_by_pid(pid: Pid, addr: usize, read_n: usize) -> nix::Result<Vec<u8>> {
    if read_n == 0 {
        return Ok(vec![]);
    }

    let mut buf = vec![0u8; read_n];
    let remote = nix::sys::uio::RemoteIoVec {
        base: addr,
        len: read_n,
    };
    match nix::sys::uio::process_vm_readv(
        pid,
        &mut [std::io::IoSliceMut::new(&mut buf)],
        &[remote],
    ) {
        Ok(n) if n == read_n => return Ok(buf),
        _ => {}
    }

    let mut result = Vec::with_capacity(read_n);
    let mut read_reminder = read_n as isize;
    let single_read_size = mem::size_of::<c_long>();

    let mut addr = addr as *mut c_long;
    while read_reminder > 0 {
        let value = sys::ptrace::read(pid, addr as *mut c_void)?;
        result.extend(value.to_ne_bytes().into_iter().take(read_reminder as usize));

        read_reminder -= single_read_size as isize;
        addr = unsafe { addr.offset(1) };
    }

    debug_assert!(result.len() == read_n);
    Ok(result)
}

/// Write bytes into the `pid` process address space, preserving the bytes
/// around an unaligned tail.
pub fn write_memory_by_pid(pid: Pid, addr: usize, data: &[u8]) -> nix::Result<()> {
    let word = mem::size_of::<c_long>();
    let mut offset = 0;

    while offset < data.len() {
        let remaining = data.len() - offset;
        let cur = (addr + offset) as *mut c_void;
        if remaining >= word {
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&data[offset..offset + word]);
            unsafe {
                sys::ptrace::write(pid, cur, u64::from_ne_bytes(chunk) as *mut c_void)?;
            }
            offset += word;
        } else {
            let existing = sys::ptrace::read(pid, cur)? as u64;
            let mut bytes = existing.to_ne_bytes();
            bytes[..remaining].copy_from_slice(&data[offset..]);
            unsafe {
                sys::ptrace::write(pid, cur, u64::from_ne_bytes(bytes) as *mut c_void)?;
            }
            offset += remaining;
        }
    }
    Ok(())
}
