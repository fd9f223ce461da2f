use crate::debugger::address::RelocatedAddress;
use crate::debugger::register::{Register, RegisterMap};
use itertools::Itertools;
use log::warn;
use nix::errno::Errno;
use nix::sys;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashMap;

use super::Location;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StopType {
    Interrupt,
    SignalStop(Signal),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TraceeStatus {
    Stopped(StopType),
    Running,
}

/// Single thread of the debuggee process.
#[derive(Clone, Debug, PartialEq)]
pub struct Tracee {
    pub pid: Pid,
    pub number: u32,
    pub status: TraceeStatus,
}

impl Tracee {
    /// Wait for this tracee status change.
    pub fn wait_one(&self) -> Result<WaitStatus, crate::debugger::error::Error> {
        waitpid(self.pid, None).map_err(crate::debugger::error::Error::Waitpid)
    }

    /// Continue tracee execution.
    pub fn r#continue(&mut self, sig: Option<Signal>) -> nix::Result<()> {
        sys::ptrace::cont(self.pid, sig).map(|_| {
            self.status = TraceeStatus::Running;
        })
    }

    /// Execute one instruction, stop does not await here.
    pub fn step(&self, sig: Option<Signal>) -> nix::Result<()> {
        sys::ptrace::step(self.pid, sig)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.status, TraceeStatus::Stopped(_))
    }

    pub fn set_stop(&mut self, ty: StopType) {
        self.status = TraceeStatus::Stopped(ty);
    }

    pub fn set_running(&mut self) {
        self.status = TraceeStatus::Running;
    }

    /// Current program counter value.
    pub fn pc(&self) -> nix::Result<RelocatedAddress> {
        RegisterMap::current(self.pid)
            .map(|map| RelocatedAddress::from(map.value(Register::Rip)))
    }

    /// Rewrite program counter.
    pub fn set_pc(&self, value: u64) -> nix::Result<()> {
        let mut map = RegisterMap::current(self.pid)?;
        map.update(Register::Rip, value);
        map.persist(self.pid)
    }

    /// Thread name from procfs, if still available.
    pub fn name(&self) -> Option<String> {
        std::fs::read_to_string(format!("/proc/{}/comm", self.pid))
            .ok()
            .map(|s| s.trim_end().to_string())
    }

    pub fn location(&self, mapping_offset: usize) -> nix::Result<Location> {
        let pc = self.pc()?;
        Ok(Location {
            pid: self.pid,
            pc,
            global_pc: pc.into_global(mapping_offset),
        })
    }
}

/// Bookkeeping for every thread of the debuggee.
pub struct TraceeCtl {
    process_pid: Pid,
    tracee_in_focus: Pid,
    next_number: u32,
    threads_state: HashMap<Pid, Tracee>,
}

impl TraceeCtl {
    pub fn new(proc_pid: Pid) -> TraceeCtl {
        Self {
            process_pid: proc_pid,
            tracee_in_focus: proc_pid,
            next_number: 2,
            threads_state: HashMap::from([(
                proc_pid,
                Tracee {
                    pid: proc_pid,
                    number: 1,
                    status: TraceeStatus::Stopped(StopType::Interrupt),
                },
            )]),
        }
    }

    /// Return pid of the debuggee process main thread.
    pub fn proc_pid(&self) -> Pid {
        self.process_pid
    }

    pub fn tracee(&self, pid: Pid) -> Option<&Tracee> {
        self.threads_state.get(&pid)
    }

    pub fn tracee_mut(&mut self, pid: Pid) -> Option<&mut Tracee> {
        self.threads_state.get_mut(&pid)
    }

    pub fn tracee_ensure(&self, pid: Pid) -> &Tracee {
        &self.threads_state[&pid]
    }

    pub fn tracee_ensure_mut(&mut self, pid: Pid) -> &mut Tracee {
        self.threads_state
            .get_mut(&pid)
            .expect("tracee must be registered")
    }

    /// Set tracee into focus.
    pub fn set_tracee_to_focus(&mut self, tid: Pid) {
        self.tracee_in_focus = tid
    }

    pub fn tracee_in_focus(&self) -> &Tracee {
        &self.threads_state[&self.tracee_in_focus]
    }

    /// Register a new thread (on PTRACE_EVENT_CLONE or PTRACE_EVENT_STOP).
    pub fn add(&mut self, pid: Pid) -> &Tracee {
        let new = Tracee {
            pid,
            number: self.next_number,
            status: TraceeStatus::Stopped(StopType::Interrupt),
        };
        self.next_number += 1;
        self.threads_state.insert(pid, new);
        &self.threads_state[&pid]
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Tracee> {
        if self.tracee_in_focus == pid && pid != self.process_pid {
            self.tracee_in_focus = self.process_pid;
        }
        self.threads_state.remove(&pid)
    }

    /// Continue all currently stopped tracees.
    pub fn cont_stopped(&mut self) -> Result<(), Vec<crate::debugger::error::Error>> {
        let mut errors = vec![];

        self.threads_state.values_mut().for_each(|tracee| {
            if tracee.is_stopped() {
                if let Err(e) = tracee.r#continue(None) {
                    // if no such process - ok, it will be removed later on PTRACE_EVENT_EXIT
                    if Errno::ESRCH == e {
                        warn!(target: "tracer", "thread {} not found, ESRCH", tracee.pid);
                        return;
                    }
                    errors.push(crate::debugger::error::Error::Ptrace(e));
                }
            }
        });

        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(())
    }

    /// Continue all stopped tracees, injecting a queued signal into one of them.
    pub fn cont_stopped_ex(
        &mut self,
        inject: Option<(Pid, Signal)>,
        keep_stopped: Vec<Pid>,
    ) -> Result<(), Vec<crate::debugger::error::Error>> {
        let mut errors = vec![];

        self.threads_state.values_mut().for_each(|tracee| {
            if keep_stopped.contains(&tracee.pid) {
                return;
            }
            if tracee.is_stopped() {
                let sig = match inject {
                    Some((pid, sig)) if pid == tracee.pid => Some(sig),
                    _ => None,
                };
                if let Err(e) = tracee.r#continue(sig) {
                    if Errno::ESRCH == e {
                        warn!(target: "tracer", "thread {} not found, ESRCH", tracee.pid);
                        return;
                    }
                    errors.push(crate::debugger::error::Error::Ptrace(e));
                }
            }
        });

        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<Tracee> {
        self.threads_state
            .values()
            .cloned()
            .sorted_by_key(|t| t.number)
            .collect()
    }
}
