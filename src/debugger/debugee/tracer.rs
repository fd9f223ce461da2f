use crate::debugger::address::RelocatedAddress;
use crate::debugger::breakpoint::Breakpoint;
use crate::debugger::code;
use crate::debugger::debugee::tracee::{StopType, TraceeCtl};
use crate::debugger::error::Error;
use crate::debugger::error::Error::{MultipleErrors, ProcessExit, Ptrace, Waitpid};
use crate::debugger::watchpoint;
use log::{debug, warn};
use nix::errno::Errno;
use nix::libc::pid_t;
use nix::sys;
use nix::sys::signal::{Signal, SIGSTOP};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use nix::libc;
use std::collections::VecDeque;

/// Signals that don't interrupt the debugging process; they are forwarded
/// to the debuggee directly on fire.
static QUIET_SIGNALS: [Signal; 6] = [
    Signal::SIGALRM,
    Signal::SIGURG,
    Signal::SIGCHLD,
    Signal::SIGIO,
    Signal::SIGVTALRM,
    Signal::SIGPROF,
];

#[derive(Debug, Clone, Copy)]
pub enum StopReason {
    /// Whole debuggee process exited with code.
    DebugeeExit(i32),
    /// Debuggee stopped just before executing any user code.
    DebugeeStart,
    /// Debuggee stopped at a software breakpoint.
    Breakpoint(Pid, RelocatedAddress),
    /// Debuggee stopped at a hardware watchpoint (debug register index attached).
    Watchpoint(Pid, RelocatedAddress, u8),
    /// Debuggee stopped with an OS signal.
    SignalStop(Pid, Signal),
    /// Debuggee vanished (Errno::ESRCH).
    NoSuchProcess(Pid),
}

#[derive(Clone, Copy)]
pub struct TraceContext<'a> {
    pub breakpoints: &'a Vec<&'a Breakpoint>,
}

impl<'a> TraceContext<'a> {
    pub fn new(breakpoints: &'a Vec<&'a Breakpoint>) -> Self {
        Self { breakpoints }
    }
}

/// Ptrace tracer: the only place where `waitpid` for the whole debuggee happens.
pub struct Tracer {
    pub(super) tracee_ctl: TraceeCtl,

    signal_queue: VecDeque<(Pid, Signal)>,
    group_stop_guard: bool,
}

impl Tracer {
    pub fn new(proc_pid: Pid) -> Self {
        Self {
            tracee_ctl: TraceeCtl::new(proc_pid),
            signal_queue: VecDeque::new(),
            group_stop_guard: false,
        }
    }

    /// Continue debuggee execution until a stop happens.
    pub fn resume(&mut self, ctx: TraceContext) -> Result<StopReason, Error> {
        loop {
            if let Some(req) = self.signal_queue.pop_front() {
                self.tracee_ctl
                    .cont_stopped_ex(
                        Some(req),
                        self.signal_queue.iter().map(|(pid, _)| *pid).collect(),
                    )
                    .map_err(MultipleErrors)?;

                if let Some((pid, sign)) = self.signal_queue.front().copied() {
                    // if there are more pending signals, stop the debuggee again
                    self.group_stop_interrupt(ctx, Pid::from_raw(-1))?;
                    return Ok(StopReason::SignalStop(pid, sign));
                }
            } else {
                self.tracee_ctl.cont_stopped().map_err(MultipleErrors)?;
            }

            debug!(target: "tracer", "resume debuggee execution, wait for updates");
            let status = match waitpid(Pid::from_raw(-1), None) {
                Ok(status) => status,
                Err(Errno::ECHILD) => {
                    return Ok(StopReason::NoSuchProcess(self.tracee_ctl.proc_pid()))
                }
                Err(e) => return Err(Waitpid(e)),
            };

            debug!(target: "tracer", "received new thread status: {status:?}");
            if let Some(stop) = self.apply_new_status(ctx, status)? {
                // quiet signal stops re-inject the signal and resume on the next turn
                if let StopReason::SignalStop(_, signal) = stop {
                    if QUIET_SIGNALS.contains(&signal) {
                        continue;
                    }
                }

                debug!(target: "tracer", "debuggee stopped, reason: {stop:?}");
                return Ok(stop);
            }
        }
    }

    fn group_stop_in_progress(&self) -> bool {
        self.group_stop_guard
    }

    fn lock_group_stop(&mut self) {
        self.group_stop_guard = true
    }

    fn unlock_group_stop(&mut self) {
        self.group_stop_guard = false
    }

    /// Stop all running tracees one by one with PTRACE_INTERRUPT.
    ///
    /// # Arguments
    ///
    /// * `initiator_pid`: tracee with this id is already stopped, no need to interrupt it.
    fn group_stop_interrupt(&mut self, ctx: TraceContext, initiator_pid: Pid) -> Result<(), Error> {
        if self.group_stop_in_progress() {
            return Ok(());
        }
        self.lock_group_stop();

        debug!(
            target: "tracer",
            "initiate group stop, initiator: {initiator_pid}",
        );

        let non_stopped_exists = self
            .tracee_ctl
            .snapshot()
            .into_iter()
            .any(|t| t.pid != initiator_pid && !t.is_stopped());
        if !non_stopped_exists {
            self.unlock_group_stop();
            return Ok(());
        }

        // two rounds, new tracees may appear while the first round runs
        for _ in 0..2 {
            let tracees = self.tracee_ctl.snapshot();

            for tid in tracees.into_iter().map(|t| t.pid) {
                let mut tracee = match self.tracee_ctl.tracee(tid) {
                    None => continue,
                    Some(tracee) => {
                        if tracee.is_stopped() {
                            continue;
                        }
                        tracee.clone()
                    }
                };

                if let Err(e) = sys::ptrace::interrupt(tracee.pid) {
                    // no such process: it will be removed later on PTRACE_EVENT_EXIT
                    if Errno::ESRCH == e {
                        warn!(target: "tracer", "thread {} not found, ESRCH", tracee.pid);
                        if let Some(t) = self.tracee_ctl.tracee_mut(tracee.pid) {
                            t.set_stop(StopType::Interrupt);
                        }
                        continue;
                    }
                    return Err(Ptrace(e));
                }

                let mut wait = tracee.wait_one()?;

                while !matches!(wait, WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_STOP)) {
                    let stop = self.apply_new_status(ctx, wait)?;
                    match stop {
                        None => {}
                        Some(StopReason::Breakpoint(pid, _))
                        | Some(StopReason::Watchpoint(pid, _, _)) => {
                            // tracee is already stopped by a trap
                            if pid == tracee.pid {
                                break;
                            }
                        }
                        Some(StopReason::DebugeeExit(code)) => return Err(ProcessExit(code)),
                        Some(StopReason::DebugeeStart) => {
                            unreachable!("stop at debuggee entry point twice")
                        }
                        Some(StopReason::SignalStop(_, _)) => {
                            // tracee in signal-stop
                            break;
                        }
                        Some(StopReason::NoSuchProcess(_)) => {
                            // expect that tracee will be removed later
                            break;
                        }
                    }

                    // reload tracee, its state may change while signals are handled
                    tracee = match self.tracee_ctl.tracee(tracee.pid).cloned() {
                        None => break,
                        Some(t) => t,
                    };
                    if tracee.is_stopped() {
                        break;
                    }

                    wait = tracee.wait_one()?;
                }

                if let Some(t) = self.tracee_ctl.tracee_mut(tracee.pid) {
                    if !t.is_stopped() {
                        t.set_stop(StopType::Interrupt);
                    }
                }
            }
        }

        self.unlock_group_stop();
        debug!(target: "tracer", "group stop complete");
        Ok(())
    }

    /// Handle a tracee event fired by the `wait` syscall.
    ///
    /// After this function returns the tracee bookkeeping is consistent.
    /// If a debuggee process stop was detected, the stop reason is returned.
    fn apply_new_status(
        &mut self,
        ctx: TraceContext,
        status: WaitStatus,
    ) -> Result<Option<StopReason>, Error> {
        match status {
            WaitStatus::Exited(pid, code) => {
                self.tracee_ctl.remove(pid);
                if pid == self.tracee_ctl.proc_pid() {
                    return Ok(Some(StopReason::DebugeeExit(code)));
                }
                Ok(None)
            }
            WaitStatus::PtraceEvent(pid, _signal, event) => {
                match event {
                    libc::PTRACE_EVENT_EXEC => {
                        // fires just before the debuggee starts executing user code
                        self.tracee_ctl
                            .tracee_ensure_mut(pid)
                            .set_stop(StopType::Interrupt);
                        return Ok(Some(StopReason::DebugeeStart));
                    }
                    libc::PTRACE_EVENT_CLONE => {
                        // fires just before a new thread is created
                        self.tracee_ctl
                            .tracee_ensure_mut(pid)
                            .set_stop(StopType::Interrupt);
                        let new_thread_id =
                            Pid::from_raw(sys::ptrace::getevent(pid).map_err(Ptrace)? as pid_t);

                        // PTRACE_EVENT_STOP may arrive first and register the tracee already
                        if self.tracee_ctl.tracee_mut(new_thread_id).is_none() {
                            let new_tracee = self.tracee_ctl.add(new_thread_id);
                            let _ = new_tracee.wait_one()?;
                        }
                    }
                    libc::PTRACE_EVENT_STOP => {
                        // fires right after thread creation or PTRACE_INTERRUPT
                        match self.tracee_ctl.tracee_mut(pid) {
                            Some(tracee) => tracee.set_stop(StopType::Interrupt),
                            None => {
                                self.tracee_ctl.add(pid);
                            }
                        }
                    }
                    libc::PTRACE_EVENT_EXIT => {
                        // stop the tracee at exit
                        let tracee = self.tracee_ctl.remove(pid);
                        if let Some(mut tracee) = tracee {
                            tracee.r#continue(None).map_err(Ptrace)?;
                        }
                    }
                    _ => {
                        warn!(target: "tracer", "unsupported (ignored) ptrace event, code: {event}");
                    }
                }
                Ok(None)
            }
            WaitStatus::Stopped(pid, signal) => {
                let info = match sys::ptrace::getsiginfo(pid) {
                    Ok(info) => info,
                    Err(Errno::ESRCH) => return Ok(Some(StopReason::NoSuchProcess(pid))),
                    Err(e) => return Err(Ptrace(e)),
                };

                match signal {
                    Signal::SIGTRAP => match info.si_code {
                        code::TRAP_TRACE | code::TRAP_HWBKPT => {
                            if let Some(slot) = watchpoint::dr6_hit_slot(pid) {
                                let pc = self.tracee_ctl.tracee_ensure(pid).pc().map_err(Ptrace)?;
                                self.tracee_ctl
                                    .tracee_ensure_mut(pid)
                                    .set_stop(StopType::Interrupt);
                                self.group_stop_interrupt(ctx, pid)?;
                                return Ok(Some(StopReason::Watchpoint(pid, pc, slot)));
                            }
                            // a stray single-step trap: consume it
                            self.tracee_ctl
                                .tracee_ensure_mut(pid)
                                .set_stop(StopType::Interrupt);
                            Ok(None)
                        }
                        code::TRAP_BRKPT | code::SI_KERNEL => {
                            let current_pc = {
                                let tracee = self.tracee_ctl.tracee_ensure(pid);
                                tracee.set_pc(tracee.pc().map_err(Ptrace)?.as_u64() - 1)
                                    .map_err(Ptrace)?;
                                tracee.pc().map_err(Ptrace)?
                            };

                            // a temporary (stepping) breakpoint hit by a thread it was not
                            // meant for is stepped over transparently
                            let hit_foreign_tmp = ctx.breakpoints.iter().any(|brkpt| {
                                brkpt.addr == current_pc
                                    && brkpt.is_temporary()
                                    && brkpt.pid != pid
                            });
                            if hit_foreign_tmp {
                                let brkpt = ctx
                                    .breakpoints
                                    .iter()
                                    .find(|brkpt| brkpt.addr == current_pc)
                                    .expect("breakpoint must exist");
                                if brkpt.is_enabled() {
                                    brkpt.disable().map_err(Ptrace)?;
                                    while self.single_step(ctx, pid)?.is_some() {}
                                    brkpt.enable().map_err(Ptrace)?;
                                }
                                self.tracee_ctl
                                    .tracee_ensure_mut(pid)
                                    .set_stop(StopType::Interrupt);
                                return Ok(None);
                            }

                            self.tracee_ctl
                                .tracee_ensure_mut(pid)
                                .set_stop(StopType::Interrupt);
                            self.group_stop_interrupt(ctx, pid)?;

                            Ok(Some(StopReason::Breakpoint(pid, current_pc)))
                        }
                        code => {
                            debug!(target: "tracer", "unexpected SIGTRAP code {code}");
                            Ok(None)
                        }
                    },
                    _ => {
                        self.signal_queue.push_back((pid, signal));
                        self.tracee_ctl
                            .tracee_ensure_mut(pid)
                            .set_stop(StopType::SignalStop(signal));

                        if !QUIET_SIGNALS.contains(&signal) {
                            self.group_stop_interrupt(ctx, pid)?;
                        }

                        Ok(Some(StopReason::SignalStop(pid, signal)))
                    }
                }
            }
            WaitStatus::Signaled(_, _, _) => Ok(None),
            _ => {
                warn!(target: "tracer", "unexpected wait status: {status:?}");
                Ok(None)
            }
        }
    }

    /// Execute the next instruction of a tracee, then stop with `TRAP_TRACE`.
    ///
    /// Returns `None` if the step completed. A [`StopReason::SignalStop`] or
    /// [`StopReason::Watchpoint`] is returned when the step was interrupted.
    pub fn single_step(
        &mut self,
        ctx: TraceContext,
        pid: Pid,
    ) -> Result<Option<StopReason>, Error> {
        let tracee = self.tracee_ctl.tracee_ensure(pid);
        let initial_pc = tracee.pc().map_err(Ptrace)?;
        tracee.step(None).map_err(Ptrace)?;

        let reason = loop {
            let tracee = self.tracee_ctl.tracee_ensure_mut(pid);
            let status = tracee.wait_one()?;
            let info = sys::ptrace::getsiginfo(pid).map_err(Ptrace)?;

            let in_trap = matches!(status, WaitStatus::Stopped(_, Signal::SIGTRAP))
                && (info.si_code == code::TRAP_TRACE
                    || info.si_code == code::TRAP_BRKPT
                    || info.si_code == code::SI_KERNEL
                    || info.si_code == code::TRAP_HWBKPT);
            if in_trap {
                if let Some(slot) = watchpoint::dr6_hit_slot(pid) {
                    let pc = tracee.pc().map_err(Ptrace)?;
                    tracee.set_stop(StopType::Interrupt);
                    break Some(StopReason::Watchpoint(pid, pc, slot));
                }

                // still on the original pc: the step has not happened yet
                if tracee.pc().map_err(Ptrace)? == initial_pc {
                    tracee.step(None).map_err(Ptrace)?;
                    continue;
                }

                tracee.set_stop(StopType::Interrupt);
                break None;
            }

            let is_interrupt = matches!(
                status,
                WaitStatus::PtraceEvent(p, SIGSTOP, libc::PTRACE_EVENT_STOP) if pid == p,
            );
            if is_interrupt {
                tracee.set_stop(StopType::Interrupt);
                break None;
            }

            let stop = self.apply_new_status(ctx, status)?;
            match stop {
                None => {}
                Some(StopReason::Breakpoint(_, _)) => {
                    unreachable!("breakpoints are stepped over by the caller");
                }
                Some(StopReason::Watchpoint(pid, addr, slot)) => {
                    break Some(StopReason::Watchpoint(pid, addr, slot));
                }
                Some(StopReason::DebugeeExit(code)) => return Err(ProcessExit(code)),
                Some(StopReason::DebugeeStart) => {
                    unreachable!("stop at debuggee entry point twice")
                }
                Some(StopReason::SignalStop(_, signal)) => {
                    if QUIET_SIGNALS.contains(&signal) {
                        self.tracee_ctl
                            .tracee_ensure(pid)
                            .step(Some(signal))
                            .map_err(Ptrace)?;
                        continue;
                    }

                    // tracee is in a signal-stop
                    break stop;
                }
                Some(StopReason::NoSuchProcess(_)) => {
                    // expect that tracee will be removed later
                    break None;
                }
            }
        };
        Ok(reason)
    }
}
