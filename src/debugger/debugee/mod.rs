pub mod dwarf;
pub mod tracee;
pub mod tracer;

use crate::debugger::address::{GlobalAddress, RelocatedAddress};
use crate::debugger::debugee::dwarf::unwind::{Backtrace, Unwinder};
use crate::debugger::debugee::dwarf::DebugInformation;
use crate::debugger::debugee::tracee::TraceeCtl;
use crate::debugger::debugee::tracer::{StopReason, TraceContext, Tracer};
use crate::debugger::error::Error;
use crate::debugger::error::Error::MappingOffsetNotFound;
use crate::debugger::process::{Child, Installed};
use crate::debugger::register::{DwarfRegisterMap, RegisterMap};
use log::debug;
use nix::unistd::Pid;
use object::Object;
use std::path::{Path, PathBuf};

/// Thread position: the same pc in both address spaces.
#[derive(Debug, Clone, Copy)]
pub struct Location {
    pub pc: RelocatedAddress,
    pub global_pc: GlobalAddress,
    pub pid: Pid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Process attached but has not reached its entry point yet.
    Unload,
    InProgress,
    Exited(i32),
}

/// A debuggee process with its debug information and tracer.
pub struct Debugee {
    process: Child<Installed>,
    pub execution_status: ExecutionStatus,
    debug_info: DebugInformation,
    /// VAS offset of the executable mapping (0 for non-PIE binaries).
    mapping_offset: Option<usize>,
    relocatable: bool,
    tracer: Tracer,
}

impl Debugee {
    pub fn new(process: Child<Installed>) -> Result<Self, Error> {
        let program = PathBuf::from(&process.program);
        let debug_info = DebugInformation::load(&program)?;
        let relocatable = is_relocatable(&program)?;
        let pid = process.pid();

        Ok(Self {
            process,
            execution_status: ExecutionStatus::Unload,
            debug_info,
            mapping_offset: None,
            relocatable,
            tracer: Tracer::new(pid),
        })
    }

    /// Create a debuggee from an attached process; the process is already
    /// running, so the mapping offset is computed immediately.
    pub fn new_attached(process: Child<Installed>) -> Result<Self, Error> {
        let mut this = Self::new(process)?;
        this.execution_status = ExecutionStatus::InProgress;
        this.update_mapping_offset()?;
        Ok(this)
    }

    pub fn program_path(&self) -> &Path {
        self.debug_info.pathname()
    }

    pub fn debug_info(&self) -> &DebugInformation {
        &self.debug_info
    }

    pub fn tracer_mut(&mut self) -> &mut Tracer {
        &mut self.tracer
    }

    pub fn tracee_ctl(&self) -> &TraceeCtl {
        &self.tracer.tracee_ctl
    }

    pub fn tracee_ctl_mut(&mut self) -> &mut TraceeCtl {
        &mut self.tracer.tracee_ctl
    }

    pub fn proc_pid(&self) -> Pid {
        self.tracee_ctl().proc_pid()
    }

    pub fn is_exited(&self) -> bool {
        matches!(self.execution_status, ExecutionStatus::Exited(_))
    }

    pub fn is_in_progress(&self) -> bool {
        self.execution_status == ExecutionStatus::InProgress
    }

    pub fn process(&self) -> &Child<Installed> {
        &self.process
    }

    pub fn mapping_offset(&self) -> usize {
        self.mapping_offset.unwrap_or(0)
    }

    /// Continue execution until the next client visible stop.
    pub fn trace_until_stop(&mut self, ctx: TraceContext) -> Result<StopReason, Error> {
        let reason = self.tracer.resume(ctx)?;
        match reason {
            StopReason::DebugeeExit(code) => {
                self.execution_status = ExecutionStatus::Exited(code);
            }
            StopReason::DebugeeStart => {
                self.execution_status = ExecutionStatus::InProgress;
                self.update_mapping_offset()?;
            }
            StopReason::NoSuchProcess(_) => {
                self.execution_status = ExecutionStatus::Exited(0);
            }
            _ => {}
        }
        Ok(reason)
    }

    fn update_mapping_offset(&mut self) -> Result<(), Error> {
        if !self.relocatable {
            self.mapping_offset = Some(0);
            return Ok(());
        }

        let pid = self.proc_pid();
        let maps = proc_maps::get_process_maps(pid.as_raw())
            .map_err(|_| MappingOffsetNotFound("read /proc maps"))?;
        let program = self
            .debug_info
            .pathname()
            .canonicalize()
            .unwrap_or_else(|_| self.debug_info.pathname().to_path_buf());

        let base = maps
            .iter()
            .filter(|map| map.filename() == Some(program.as_path()))
            .map(|map| map.start())
            .min()
            .ok_or(MappingOffsetNotFound("no executable mapping"))?;

        debug!(target: "debugger", "debuggee mapping offset: {base:#x}");
        self.mapping_offset = Some(base);
        Ok(())
    }

    /// Current location of a stopped tracee.
    pub fn tracee_location(&self, pid: Pid) -> Result<Location, Error> {
        let tracee = self.tracee_ctl().tracee_ensure(pid);
        tracee.location(self.mapping_offset()).map_err(Error::Ptrace)
    }

    /// Unwind a thread stack and return the backtrace.
    pub fn unwind(&self, pid: Pid) -> Result<Backtrace, Error> {
        let registers = DwarfRegisterMap::from(RegisterMap::current(pid).map_err(Error::Ptrace)?);
        let unwinder = Unwinder::new(&self.debug_info, self.mapping_offset(), pid);
        unwinder.unwind(registers)
    }

    /// Return address of the innermost frame of a thread.
    pub fn return_addr(&self, pid: Pid) -> Result<Option<RelocatedAddress>, Error> {
        let registers = DwarfRegisterMap::from(RegisterMap::current(pid).map_err(Error::Ptrace)?);
        let unwinder = Unwinder::new(&self.debug_info, self.mapping_offset(), pid);
        unwinder.return_address(registers)
    }
}

fn is_relocatable(program: &Path) -> Result<bool, Error> {
    let file = std::fs::File::open(program)?;
    let mmap = unsafe { memmap2::Mmap::map(&file)? };
    let object = object::File::parse(&*mmap)?;
    Ok(object.kind() == object::ObjectKind::Dynamic)
}
