//! The native engine behind the [`Driver`] contract.

use crate::debugger::address::RelocatedAddress;
use crate::debugger::breakpoint::{BreakpointKind, LogicalBreakpoint};
use crate::debugger::debugee::dwarf::unwind::FrameSpan;
use crate::debugger::expr::ExprValue;
use crate::debugger::process::Child;
use crate::debugger::variable::VariableView;
use crate::debugger::watchpoint::WatchAccess;
use crate::debugger::{
    BreakpointOptions, ContinueOutcome, Debugger, StepResult,
};
use crate::driver::{
    AttachRequest, BreakpointInfo, BreakpointSpec, CancelToken, CapSet, CompletionItem, Driver,
    DriverKind, EvaluatedValue, EventQueue, ExceptionDetails, FrameInfo, GotoTarget,
    InspectRequest, InstructionInfo, LaunchRequest, RegisterInfo, RunAction, RunOptions,
    ScopeInfo, StopContext, SymbolInfo, ThreadInfo, VariableDescriptor, VariableLocationInfo,
    WatchTarget,
};
use crate::protocol::{SessionEvent, StopReason, ToolError};
use log::warn;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Shared handle the daemon uses to interrupt a blocked session thread.
///
/// Each driver installs a hook at launch: SIGSTOP injection for the native
/// engine, a fire-and-forget `pause` request for adapters.
#[derive(Default)]
pub struct OutOfBand {
    hook: Mutex<Option<Box<dyn Fn() + Send>>>,
}

impl OutOfBand {
    pub fn set_pause_hook(&self, hook: impl Fn() + Send + 'static) {
        *self.hook.lock().expect("oob lock poisoned") = Some(Box::new(hook));
    }

    /// Interrupt whatever the session thread is blocked on.
    pub fn pause(&self) {
        if let Some(hook) = self.hook.lock().expect("oob lock poisoned").as_ref() {
            hook();
        }
    }
}

enum VarRefEntry {
    Var(VariableView),
    Scope {
        pid: i32,
        frame_num: u32,
        arguments: bool,
    },
}

pub struct NativeDriver {
    debugger: Option<Debugger>,
    events: Arc<EventQueue>,
    oob: Arc<OutOfBand>,
    caps: CapSet,
    /// Incremented on every resume; all frame and variable handles carry it.
    stop_epoch: u64,
    frame_table: HashMap<i64, (i32, u32, u64)>,
    next_frame_id: i64,
    varrefs: HashMap<i64, (VarRefEntry, u64)>,
    next_varref: i64,
    output_readers: Vec<JoinHandle<()>>,
    last_stop: Option<StopContext>,
    last_signal: Option<Signal>,
    exception_filters: Vec<String>,
}

impl NativeDriver {
    pub fn new(events: Arc<EventQueue>, oob: Arc<OutOfBand>) -> Self {
        Self {
            debugger: None,
            events,
            oob,
            caps: native_caps(),
            stop_epoch: 0,
            frame_table: HashMap::new(),
            next_frame_id: 1000,
            varrefs: HashMap::new(),
            next_varref: 1,
            output_readers: vec![],
            last_stop: None,
            last_signal: None,
            exception_filters: vec![],
        }
    }

    fn debugger(&mut self) -> Result<&mut Debugger, ToolError> {
        self.debugger
            .as_mut()
            .ok_or_else(|| ToolError::InvalidState("no debuggee launched".to_string()))
    }

    fn spawn_output_reader(
        &mut self,
        mut reader: os_pipe::PipeReader,
        category: &'static str,
    ) {
        let events = Arc::clone(&self.events);
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]).to_string();
                        events.push(SessionEvent::Output {
                            category: category.to_string(),
                            output: chunk,
                        });
                    }
                }
            }
        });
        self.output_readers.push(handle);
    }

    /// Block until all captured output reached the event queue. Called when
    /// the debuggee is gone, so the readers are at (or racing towards) EOF.
    fn drain_output(&mut self) {
        for handle in self.output_readers.drain(..) {
            let _ = handle.join();
        }
    }

    fn begin_resume(&mut self) {
        self.stop_epoch += 1;
        self.frame_table.clear();
        self.varrefs.clear();
        self.events.push(SessionEvent::Continued {
            thread_id: None,
            all_threads_continued: true,
        });
    }

    fn mark_exited(&mut self, code: i32) -> StopContext {
        // all captured output must be queued before the exit is announced,
        // and the exit is final: the terminated event follows immediately
        self.drain_output();
        self.events.push(SessionEvent::Exited { exit_code: code });
        self.events.push(SessionEvent::Terminated);
        let ctx = StopContext::exited(code);
        self.last_stop = Some(ctx.clone());
        ctx
    }

    fn signal_is_exception(&self, signal: Signal) -> bool {
        if self.exception_filters.is_empty() {
            return false;
        }
        matches!(
            signal,
            Signal::SIGSEGV | Signal::SIGBUS | Signal::SIGFPE | Signal::SIGILL | Signal::SIGABRT
        )
    }

    fn stop_context(&mut self, reason: StopReason, pid: Pid, hit_ids: Vec<u32>) -> StopContext {
        let mut ctx = StopContext::new(reason);
        ctx.thread_id = Some(pid.as_raw() as i64);
        ctx.hit_breakpoint_ids = hit_ids;

        if let Some(debugger) = self.debugger.as_ref() {
            let loc = debugger.ecx().location;
            ctx.pc = Some(format!("{:#x}", loc.pc.as_usize()));
            if let Ok(Some(place)) = debugger
                .debugee()
                .debug_info()
                .find_place_from_pc(loc.global_pc)
            {
                ctx.source = Some(place.file.to_string_lossy().to_string());
                ctx.line = Some(place.line_number);
            }
        }

        self.events.push(SessionEvent::Stopped {
            reason,
            thread_id: ctx.thread_id,
            description: ctx.description.clone(),
            hit_breakpoint_ids: (!ctx.hit_breakpoint_ids.is_empty())
                .then(|| ctx.hit_breakpoint_ids.clone()),
        });
        self.last_stop = Some(ctx.clone());
        ctx
    }

    fn outcome_to_stop(&mut self, outcome: ContinueOutcome) -> StopContext {
        self.flush_messages();
        match outcome {
            ContinueOutcome::Exited(code) => self.mark_exited(code),
            ContinueOutcome::EntryPoint(pid) => self.stop_context(StopReason::Entry, pid, vec![]),
            ContinueOutcome::Breakpoint(pid, _, ids) => {
                self.stop_context(StopReason::Breakpoint, pid, ids)
            }
            ContinueOutcome::Watchpoint(pid, _, id) => {
                let ids = id.map(|id| vec![id]).unwrap_or_default();
                self.stop_context(StopReason::Watchpoint, pid, ids)
            }
            ContinueOutcome::Signal(pid, signal) => {
                self.last_signal = Some(signal);
                let reason = if signal == Signal::SIGSTOP {
                    StopReason::Pause
                } else if self.signal_is_exception(signal) {
                    StopReason::Exception
                } else {
                    StopReason::Signal
                };
                let mut ctx = self.stop_context(reason, pid, vec![]);
                ctx.description = Some(signal.to_string());
                self.last_stop = Some(ctx.clone());
                ctx
            }
        }
    }

    fn step_result_to_stop(&mut self, result: StepResult) -> StopContext {
        self.flush_messages();
        match result {
            StepResult::Done => {
                let pid = self
                    .debugger
                    .as_ref()
                    .map(|d| d.ecx().location.pid)
                    .unwrap_or(Pid::from_raw(0));
                self.stop_context(StopReason::Step, pid, vec![])
            }
            StepResult::Exited(code) => self.mark_exited(code),
            StepResult::SignalInterrupt(pid, signal) => {
                self.outcome_to_stop(ContinueOutcome::Signal(pid, signal))
            }
            StepResult::WatchpointInterrupt(pid, addr, slot) => {
                let _ = (addr, slot);
                self.stop_context(StopReason::Watchpoint, pid, vec![])
            }
        }
    }

    fn flush_messages(&mut self) {
        if let Some(debugger) = self.debugger.as_mut() {
            for message in debugger.drain_messages() {
                self.events.push(SessionEvent::Output {
                    category: "console".to_string(),
                    output: format!("{message}\n"),
                });
            }
        }
    }

    fn alloc_frame_id(&mut self, pid: i32, frame_num: u32) -> i64 {
        let id = self.next_frame_id;
        self.next_frame_id += 1;
        self.frame_table.insert(id, (pid, frame_num, self.stop_epoch));
        id
    }

    fn resolve_frame_id(&mut self, frame_id: Option<i64>) -> Result<u32, ToolError> {
        let Some(frame_id) = frame_id else {
            return Ok(0);
        };
        let (pid, frame_num, epoch) = *self
            .frame_table
            .get(&frame_id)
            .ok_or_else(|| ToolError::InvalidState("unknown or stale frame id".to_string()))?;
        if epoch != self.stop_epoch {
            return Err(ToolError::InvalidState(
                "frame id is stale: the debuggee has resumed since".to_string(),
            ));
        }
        let debugger = self.debugger()?;
        debugger
            .set_focus_thread(Pid::from_raw(pid))
            .map_err(ToolError::from)?;
        Ok(frame_num)
    }

    fn alloc_varref(&mut self, entry: VarRefEntry) -> i64 {
        let id = self.next_varref;
        self.next_varref += 1;
        self.varrefs.insert(id, (entry, self.stop_epoch));
        id
    }

    fn describe(&mut self, view: VariableView) -> VariableDescriptor {
        let children = self
            .debugger
            .as_ref()
            .map(|d| view.children_count(d.debugee()))
            .unwrap_or(0);
        let memory_reference = view.address.map(|a| format!("{a:#x}"));
        let name = view.name.clone();
        let value = view.value.clone();
        let type_name = view.type_name.clone();
        let variables_reference = if children > 0 {
            self.alloc_varref(VarRefEntry::Var(view))
        } else {
            0
        };
        VariableDescriptor {
            name,
            value,
            type_name: Some(type_name),
            variables_reference,
            memory_reference,
        }
    }

    fn reinstall_breakpoints(
        &mut self,
        specs: Vec<LogicalBreakpoint>,
    ) -> Result<(), ToolError> {
        for bp in specs {
            let opts = BreakpointOptions {
                condition: bp.condition.clone(),
                hit_condition: bp.hit_condition.clone(),
                log_message: bp.log_message.clone(),
            };
            let debugger = self.debugger()?;
            let result = match bp.kind {
                BreakpointKind::Line => match (&bp.file, bp.line) {
                    (Some(file), Some(line)) => {
                        debugger.set_breakpoint_at_line(file, line, opts).map(|_| ())
                    }
                    _ => Ok(()),
                },
                BreakpointKind::Function => match &bp.function {
                    Some(name) => debugger.set_breakpoint_at_fn(name, opts).map(|_| ()),
                    None => Ok(()),
                },
                BreakpointKind::Instruction => match bp.addresses.first() {
                    Some(addr) => debugger.set_breakpoint_at_address(*addr, opts).map(|_| ()),
                    None => Ok(()),
                },
                BreakpointKind::Exception => debugger
                    .set_exception_breakpoint(bp.filters.clone())
                    .map(|_| ()),
            };
            if let Err(e) = result {
                warn!(target: "debugger", "breakpoint was not restored after restart: {e:#}");
            }
        }
        Ok(())
    }

    fn bp_info(bp: &LogicalBreakpoint) -> BreakpointInfo {
        BreakpointInfo {
            id: bp.id,
            verified: bp.verified,
            message: None,
            source: bp.file.as_ref().map(|f| f.to_string_lossy().to_string()),
            line: bp.line,
            function: bp.function.clone(),
            addresses: bp
                .addresses
                .iter()
                .map(|a| format!("{:#x}", a.as_usize()))
                .collect(),
        }
    }
}

impl Driver for NativeDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Native
    }

    fn capabilities(&self) -> CapSet {
        self.caps.clone()
    }

    fn launch(&mut self, req: &LaunchRequest) -> Result<StopContext, ToolError> {
        if self.debugger.is_some() {
            return Err(ToolError::InvalidState(
                "session already owns a debuggee".to_string(),
            ));
        }

        let (stdout_reader, stdout_writer) =
            os_pipe::pipe().map_err(|e| ToolError::Internal(e.to_string()))?;
        let (stderr_reader, stderr_writer) =
            os_pipe::pipe().map_err(|e| ToolError::Internal(e.to_string()))?;
        self.spawn_output_reader(stdout_reader, "stdout");
        self.spawn_output_reader(stderr_reader, "stderr");

        let template = Child::new(
            req.program.clone(),
            req.args.clone(),
            req.env.clone(),
            req.cwd.clone().map(PathBuf::from),
            stdout_writer,
            stderr_writer,
        );
        let process = template.install().map_err(ToolError::from)?;
        // the template holds the only remaining pipe writer ends; drop it so
        // the output readers observe EOF once the debuggee exits
        drop(template);
        let debuggee_pid = process.pid().as_raw();
        self.oob.set_pause_hook(move || {
            let _ = nix::sys::signal::kill(Pid::from_raw(debuggee_pid), Signal::SIGSTOP);
        });

        let mut debugger = Debugger::new(process).map_err(ToolError::from)?;
        debugger.start_debugee().map_err(ToolError::from)?;
        let pid = debugger.ecx().location.pid;
        self.debugger = Some(debugger);
        self.stop_epoch += 1;

        if req.stop_on_entry {
            Ok(self.stop_context(StopReason::Entry, pid, vec![]))
        } else {
            // no entry stop requested: run until the first real stop
            let outcome = self
                .debugger()?
                .continue_debugee()
                .map_err(ToolError::from)?;
            Ok(self.outcome_to_stop(outcome))
        }
    }

    fn attach(&mut self, req: &AttachRequest) -> Result<StopContext, ToolError> {
        let pid = req
            .pid
            .ok_or_else(|| ToolError::InvalidParams("attach requires `pid`".to_string()))?;
        let process = Child::attach(Pid::from_raw(pid)).map_err(ToolError::from)?;
        let debuggee_pid = process.pid().as_raw();
        self.oob.set_pause_hook(move || {
            let _ = nix::sys::signal::kill(Pid::from_raw(debuggee_pid), Signal::SIGSTOP);
        });
        let debugger = Debugger::new_attached(process).map_err(ToolError::from)?;
        let pid = debugger.ecx().location.pid;
        self.debugger = Some(debugger);
        self.stop_epoch += 1;
        self.debugger()?.ecx_update_location().map_err(ToolError::from)?;
        Ok(self.stop_context(StopReason::Entry, pid, vec![]))
    }

    fn set_breakpoint(&mut self, spec: BreakpointSpec) -> Result<BreakpointInfo, ToolError> {
        if let BreakpointSpec::Exception { filters } = &spec {
            self.exception_filters = filters.clone();
        }
        let debugger = self.debugger()?;
        let bp = match spec {
            BreakpointSpec::Line { path, line, props } => debugger.set_breakpoint_at_line(
                &path,
                line,
                BreakpointOptions {
                    condition: props.condition,
                    hit_condition: props.hit_condition,
                    log_message: props.log_message,
                },
            ),
            BreakpointSpec::Function { name, props } => debugger.set_breakpoint_at_fn(
                &name,
                BreakpointOptions {
                    condition: props.condition,
                    hit_condition: props.hit_condition,
                    log_message: props.log_message,
                },
            ),
            BreakpointSpec::Instruction { address, props } => debugger.set_breakpoint_at_address(
                RelocatedAddress::from(address),
                BreakpointOptions {
                    condition: props.condition,
                    hit_condition: props.hit_condition,
                    log_message: props.log_message,
                },
            ),
            BreakpointSpec::Exception { filters } => debugger.set_exception_breakpoint(filters),
        }
        .map_err(ToolError::from)?;
        Ok(Self::bp_info(&bp))
    }

    fn remove_breakpoint(&mut self, id: u32) -> Result<(), ToolError> {
        let debugger = self.debugger()?;
        match debugger.remove_breakpoint(id) {
            Ok(bp) => {
                if bp.kind == BreakpointKind::Exception {
                    self.exception_filters.clear();
                }
                Ok(())
            }
            // a data breakpoint id belongs to the watchpoint registry
            Err(crate::debugger::error::Error::BreakpointNotFound(_)) => {
                debugger.remove_watchpoint(id).map_err(ToolError::from)
            }
            Err(e) => Err(ToolError::from(e)),
        }
    }

    fn list_breakpoints(&mut self) -> Result<Vec<BreakpointInfo>, ToolError> {
        let debugger = self.debugger()?;
        let mut infos: Vec<BreakpointInfo> = debugger
            .breakpoints_list()
            .iter()
            .map(Self::bp_info)
            .collect();
        infos.extend(debugger.watchpoints_list().iter().map(|wp| BreakpointInfo {
            id: wp.id,
            verified: true,
            message: None,
            source: None,
            line: None,
            function: wp.variable.clone(),
            addresses: vec![format!("{:#x}", wp.addr)],
        }));
        Ok(infos)
    }

    fn breakpoint_locations(
        &mut self,
        path: &Path,
        line: u64,
        end_line: u64,
    ) -> Result<Vec<(u64, u64)>, ToolError> {
        let debugger = self.debugger()?;
        Ok(debugger
            .breakpoint_locations(path, line, end_line)
            .into_iter()
            .map(|place| (place.line_number, place.column_number))
            .collect())
    }

    fn run(
        &mut self,
        action: RunAction,
        opts: &RunOptions,
        cancel: &CancelToken,
    ) -> Result<StopContext, ToolError> {
        cancel.check()?;
        if let Some(tid) = opts.thread_id {
            let debugger = self.debugger()?;
            debugger
                .set_focus_thread(Pid::from_raw(tid as i32))
                .map_err(ToolError::from)?;
        }

        match action {
            RunAction::Continue => {
                self.begin_resume();
                let outcome = self
                    .debugger()?
                    .continue_debugee()
                    .map_err(ToolError::from)?;
                Ok(self.outcome_to_stop(outcome))
            }
            RunAction::StepInto | RunAction::StepOver | RunAction::StepOut => {
                self.begin_resume();
                let instruction = opts.granularity == super::Granularity::Instruction;
                let debugger = self.debugger()?;
                let result = match (action, instruction) {
                    (_, true) => debugger.step_instruction(),
                    (RunAction::StepInto, _) => debugger.step_into(),
                    (RunAction::StepOver, _) => debugger.step_over(),
                    (RunAction::StepOut, _) => debugger.step_out(),
                    _ => unreachable!("matched above"),
                }
                .map_err(ToolError::from)?;
                Ok(self.step_result_to_stop(result))
            }
            // a pause that reaches the worker means the debuggee is already
            // stopped; report the stop it is sitting on
            RunAction::Pause => self.last_stop.clone().ok_or_else(|| {
                ToolError::InvalidState("debuggee is already stopped".to_string())
            }),
            RunAction::Restart => self.restart(),
            RunAction::Goto => {
                let (file, line) = match (&opts.file, opts.line) {
                    (Some(file), Some(line)) => (file.clone(), line),
                    _ => {
                        return Err(ToolError::InvalidParams(
                            "goto requires `file` and `line`".to_string(),
                        ))
                    }
                };
                let debugger = self.debugger()?;
                debugger
                    .jump_to_line(&file, line)
                    .map_err(ToolError::from)?;
                self.stop_epoch += 1;
                self.frame_table.clear();
                self.varrefs.clear();
                let pid = self.debugger()?.ecx().location.pid;
                Ok(self.stop_context(StopReason::Goto, pid, vec![]))
            }
            RunAction::ReverseContinue | RunAction::StepBack => {
                Err(ToolError::NotSupported("reverse execution"))
            }
        }
    }

    fn pause(&mut self, _thread_id: Option<i64>) -> Result<(), ToolError> {
        self.oob.pause();
        Ok(())
    }

    fn inspect(&mut self, req: &InspectRequest) -> Result<EvaluatedValue, ToolError> {
        if let Some(varref) = req.variable_ref {
            enum Planned {
                Children(VariableView),
                Scope {
                    pid: i32,
                    frame_num: u32,
                    arguments: bool,
                },
            }

            let planned = {
                let (entry, epoch) = self.varrefs.get(&varref).ok_or_else(|| {
                    ToolError::InvalidState("unknown variable reference".to_string())
                })?;
                if *epoch != self.stop_epoch {
                    return Err(ToolError::InvalidState(
                        "variable reference is stale: the debuggee has resumed since".to_string(),
                    ));
                }
                match entry {
                    VarRefEntry::Var(view) => Planned::Children(view.clone()),
                    VarRefEntry::Scope {
                        pid,
                        frame_num,
                        arguments,
                    } => Planned::Scope {
                        pid: *pid,
                        frame_num: *frame_num,
                        arguments: *arguments,
                    },
                }
            };

            let views = match planned {
                Planned::Children(view) => {
                    let debugger = self.debugger()?;
                    debugger.variable_children(&view).map_err(ToolError::from)?
                }
                Planned::Scope {
                    pid,
                    frame_num,
                    arguments,
                } => {
                    let debugger = self.debugger()?;
                    debugger
                        .set_focus_thread(Pid::from_raw(pid))
                        .map_err(ToolError::from)?;
                    let all = debugger
                        .frame_variables(frame_num)
                        .map_err(ToolError::from)?;
                    let params: std::collections::HashSet<String> = debugger
                        .frame(frame_num)
                        .ok()
                        .and_then(|frame| {
                            let global = frame
                                .ip
                                .into_global(debugger.debugee().mapping_offset());
                            debugger
                                .debugee()
                                .debug_info()
                                .find_function_by_pc(global)
                                .map(|(_, f)| {
                                    f.parameters
                                        .iter()
                                        .filter_map(|p| p.name.clone())
                                        .collect()
                                })
                        })
                        .unwrap_or_default();
                    all.into_iter()
                        .filter(|v| params.contains(&v.name) == arguments)
                        .collect()
                }
            };

            let children: Vec<VariableDescriptor> =
                views.into_iter().map(|v| self.describe(v)).collect();
            return Ok(EvaluatedValue {
                result: format!("{} children", children.len()),
                type_name: None,
                variables_reference: varref,
                memory_reference: None,
                children: Some(children),
            });
        }

        if let Some(scope) = &req.scope {
            let arguments = scope.eq_ignore_ascii_case("arguments");
            let frame_num = self.resolve_frame_id(req.frame_id)?;
            let pid = self.debugger()?.ecx().location.pid.as_raw();
            let varref = self.alloc_varref(VarRefEntry::Scope {
                pid,
                frame_num,
                arguments,
            });
            return self.inspect(&InspectRequest {
                variable_ref: Some(varref),
                ..Default::default()
            });
        }

        let expression = req
            .expression
            .as_deref()
            .ok_or_else(|| {
                ToolError::InvalidParams(
                    "inspect requires one of `expression`, `variable_ref`, `scope`".to_string(),
                )
            })?
            .to_string();
        let frame_num = self.resolve_frame_id(req.frame_id)?;
        let value = self
            .debugger()?
            .evaluate_expression(&expression, frame_num)
            .map_err(ToolError::from)?;

        Ok(match value {
            ExprValue::Var(view) => {
                let descriptor = self.describe(view);
                EvaluatedValue {
                    result: descriptor.value,
                    type_name: descriptor.type_name,
                    variables_reference: descriptor.variables_reference,
                    memory_reference: descriptor.memory_reference,
                    children: None,
                }
            }
            other => EvaluatedValue {
                result: other.render(),
                type_name: Some(other.type_name()),
                variables_reference: 0,
                memory_reference: None,
                children: None,
            },
        })
    }

    fn set_variable(
        &mut self,
        name: &str,
        value: &str,
        frame_id: Option<i64>,
    ) -> Result<(String, Option<String>), ToolError> {
        let frame_num = self.resolve_frame_id(frame_id)?;
        let view = self
            .debugger()?
            .set_variable(name, value, frame_num)
            .map_err(ToolError::from)?;
        Ok((view.value, Some(view.type_name)))
    }

    fn set_expression(
        &mut self,
        expression: &str,
        value: &str,
        frame_id: Option<i64>,
    ) -> Result<(String, Option<String>), ToolError> {
        let frame_num = self.resolve_frame_id(frame_id)?;
        let view = self
            .debugger()?
            .set_expression(expression, value, frame_num)
            .map_err(ToolError::from)?;
        Ok((view.value, Some(view.type_name)))
    }

    fn threads(&mut self) -> Result<Vec<ThreadInfo>, ToolError> {
        let debugger = self.debugger()?;
        Ok(debugger
            .threads()
            .map_err(ToolError::from)?
            .into_iter()
            .map(|(tracee, name)| ThreadInfo {
                id: tracee.pid.as_raw() as i64,
                name: name.unwrap_or_else(|| format!("thread {}", tracee.number)),
            })
            .collect())
    }

    fn stacktrace(
        &mut self,
        thread_id: Option<i64>,
        start_frame: usize,
        levels: usize,
    ) -> Result<Vec<FrameInfo>, ToolError> {
        let debugger = self.debugger()?;
        let pid = thread_id
            .map(|tid| Pid::from_raw(tid as i32))
            .unwrap_or(debugger.ecx().location.pid);
        let bt = debugger.backtrace(pid).map_err(ToolError::from)?;

        let levels = if levels == 0 { usize::MAX } else { levels };
        let frames: Vec<(usize, FrameSpan)> = bt
            .into_iter()
            .enumerate()
            .skip(start_frame)
            .take(levels)
            .collect();

        Ok(frames
            .into_iter()
            .map(|(num, span)| {
                let id = self.alloc_frame_id(pid.as_raw(), num as u32);
                FrameInfo {
                    id,
                    name: span
                        .func_name
                        .unwrap_or_else(|| format!("{:#x}", span.ip.as_usize())),
                    source: span
                        .place
                        .as_ref()
                        .map(|p| p.file.to_string_lossy().to_string()),
                    line: span.place.as_ref().map(|p| p.line_number).unwrap_or(0),
                    column: span.place.as_ref().map(|p| p.column_number).unwrap_or(0),
                    instruction_pointer_reference: Some(format!("{:#x}", span.ip.as_usize())),
                }
            })
            .collect())
    }

    fn scopes(&mut self, frame_id: i64) -> Result<Vec<ScopeInfo>, ToolError> {
        let frame_num = self.resolve_frame_id(Some(frame_id))?;
        let pid = self.debugger()?.ecx().location.pid.as_raw();
        let arguments = self.alloc_varref(VarRefEntry::Scope {
            pid,
            frame_num,
            arguments: true,
        });
        let locals = self.alloc_varref(VarRefEntry::Scope {
            pid,
            frame_num,
            arguments: false,
        });
        Ok(vec![
            ScopeInfo {
                name: "Arguments".to_string(),
                variables_reference: arguments,
                expensive: false,
            },
            ScopeInfo {
                name: "Locals".to_string(),
                variables_reference: locals,
                expensive: false,
            },
        ])
    }

    fn memory_read(&mut self, address: u64, size: usize) -> Result<Vec<u8>, ToolError> {
        self.debugger()?
            .read_memory(address as usize, size)
            .map_err(ToolError::from)
    }

    fn memory_write(&mut self, address: u64, data: &[u8]) -> Result<(), ToolError> {
        self.debugger()?
            .write_memory(address as usize, data)
            .map_err(ToolError::from)
    }

    fn disassemble(
        &mut self,
        address: u64,
        count: usize,
        resolve_symbols: bool,
    ) -> Result<Vec<InstructionInfo>, ToolError> {
        let debugger = self.debugger()?;
        let instructions = debugger
            .disasm(RelocatedAddress::from(address), count)
            .map_err(ToolError::from)?;
        Ok(instructions
            .into_iter()
            .map(|i| {
                let symbol = resolve_symbols
                    .then(|| debugger.symbol_at(i.address))
                    .flatten();
                InstructionInfo {
                    address: format!("{:#x}", i.address.as_usize()),
                    instruction: match (&i.mnemonic, &i.operands) {
                        (Some(m), Some(o)) if !o.is_empty() => format!("{m} {o}"),
                        (Some(m), _) => m.clone(),
                        _ => "<unknown>".to_string(),
                    },
                    instruction_bytes: Some(
                        i.bytes
                            .iter()
                            .map(|b| format!("{b:02x}"))
                            .collect::<Vec<_>>()
                            .join(" "),
                    ),
                    symbol,
                }
            })
            .collect())
    }

    fn registers(&mut self, thread_id: Option<i64>) -> Result<Vec<RegisterInfo>, ToolError> {
        let debugger = self.debugger()?;
        let pid = thread_id.map(|tid| Pid::from_raw(tid as i32));
        Ok(debugger
            .current_thread_registers(pid)
            .map_err(ToolError::from)?
            .into_iter()
            .map(|(name, value)| RegisterInfo {
                name,
                value: format!("{value:#x}"),
            })
            .collect())
    }

    fn write_register(
        &mut self,
        name: &str,
        value: u64,
        thread_id: Option<i64>,
    ) -> Result<(), ToolError> {
        let debugger = self.debugger()?;
        let pid = thread_id.map(|tid| Pid::from_raw(tid as i32));
        debugger
            .set_register_value(name, value, pid)
            .map_err(ToolError::from)
    }

    fn modules(&mut self) -> Result<Vec<Value>, ToolError> {
        let debugger = self.debugger()?;
        let path = debugger.debugee().program_path();
        Ok(vec![json!({
            "id": 1,
            "name": path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default(),
            "path": path.to_string_lossy(),
        })])
    }

    fn loaded_sources(&mut self) -> Result<Vec<Value>, ToolError> {
        let debugger = self.debugger()?;
        let debug_info = debugger.debugee().debug_info();
        let mut sources: Vec<String> = (0..debug_info.unit_count())
            .flat_map(|i| {
                debug_info
                    .unit(i)
                    .files
                    .iter()
                    .map(|f| f.to_string_lossy().to_string())
                    .collect::<Vec<_>>()
            })
            .collect();
        sources.sort();
        sources.dedup();
        Ok(sources
            .into_iter()
            .map(|path| json!({"name": path, "path": path}))
            .collect())
    }

    fn source(&mut self, _source_reference: i64, path: Option<&str>) -> Result<String, ToolError> {
        let path = path.ok_or_else(|| {
            ToolError::InvalidParams("native sources are file backed, `path` required".to_string())
        })?;
        std::fs::read_to_string(path).map_err(|e| ToolError::Internal(e.to_string()))
    }

    fn completions(
        &mut self,
        text: &str,
        column: u64,
        frame_id: Option<i64>,
    ) -> Result<Vec<CompletionItem>, ToolError> {
        let frame_num = self.resolve_frame_id(frame_id)?;
        let prefix_end = (column as usize).saturating_sub(1).min(text.len());
        let prefix: String = text[..prefix_end]
            .chars()
            .rev()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        let debugger = self.debugger()?;
        let variables = debugger
            .frame_variables(frame_num)
            .map_err(ToolError::from)?;
        Ok(variables
            .into_iter()
            .filter(|v| v.name.starts_with(&prefix))
            .map(|v| CompletionItem {
                label: v.name,
                kind: Some("variable".to_string()),
            })
            .collect())
    }

    fn exception_info(&mut self, _thread_id: Option<i64>) -> Result<ExceptionDetails, ToolError> {
        let signal = self.last_signal.ok_or_else(|| {
            ToolError::InvalidState("no exception or signal has been observed".to_string())
        })?;
        Ok(ExceptionDetails {
            exception_id: signal.to_string(),
            description: Some(format!("debuggee stopped by {signal}")),
            break_mode: if self.exception_filters.is_empty() {
                "unhandled".to_string()
            } else {
                "always".to_string()
            },
        })
    }

    fn goto_targets(&mut self, path: &Path, line: u64) -> Result<Vec<GotoTarget>, ToolError> {
        let debugger = self.debugger()?;
        let places = debugger
            .debugee()
            .debug_info()
            .find_places_for_line(path, line);
        Ok(places
            .into_iter()
            .enumerate()
            .map(|(i, place)| GotoTarget {
                id: i as i64 + 1,
                label: format!(
                    "{}:{}",
                    place.file.to_string_lossy(),
                    place.line_number
                ),
                line: place.line_number,
            })
            .collect())
    }

    fn watchpoint(
        &mut self,
        target: WatchTarget,
        access: &str,
        frame_id: Option<i64>,
    ) -> Result<BreakpointInfo, ToolError> {
        let access = match access {
            "read" => WatchAccess::Read,
            "write" => WatchAccess::Write,
            "readWrite" => WatchAccess::ReadWrite,
            other => {
                return Err(ToolError::InvalidParams(format!(
                    "unknown access type `{other}`"
                )))
            }
        };

        let id = match target {
            WatchTarget::Variable(name) => {
                let frame_num = self.resolve_frame_id(frame_id)?;
                self.debugger()?
                    .set_watchpoint_on_variable(name, frame_num, access)
                    .map_err(ToolError::from)?
            }
            WatchTarget::Address(addr) => self
                .debugger()?
                .set_watchpoint_at_address(addr as usize, 8, access, None)
                .map_err(ToolError::from)?,
        };

        Ok(BreakpointInfo {
            id,
            verified: true,
            message: None,
            source: None,
            line: None,
            function: match target {
                WatchTarget::Variable(name) => Some(name.to_string()),
                WatchTarget::Address(_) => None,
            },
            addresses: vec![],
        })
    }

    fn find_symbol(&mut self, name: &str) -> Result<Vec<SymbolInfo>, ToolError> {
        let debugger = self.debugger()?;
        Ok(debugger
            .find_symbols(name)
            .map_err(ToolError::from)?
            .into_iter()
            .map(|sym| SymbolInfo {
                name: sym.name,
                address: format!("{:#x}", sym.addr),
                size: sym.size,
            })
            .collect())
    }

    fn variable_location(
        &mut self,
        name: &str,
        frame_id: Option<i64>,
    ) -> Result<VariableLocationInfo, ToolError> {
        let frame_num = self.resolve_frame_id(frame_id)?;
        let view = self
            .debugger()?
            .read_variable(name, frame_num)
            .map_err(ToolError::from)?;
        Ok(VariableLocationInfo {
            address: view.address.map(|a| format!("{a:#x}")),
            size: Some(view.byte_size as u64),
            description: match view.address {
                Some(addr) => format!("{name} resides at {addr:#x}"),
                None => format!("{name} has no memory location (register or constant)"),
            },
        })
    }

    fn restart(&mut self) -> Result<StopContext, ToolError> {
        let specs = self.debugger()?.breakpoints_list();

        let (stdout_reader, stdout_writer) =
            os_pipe::pipe().map_err(|e| ToolError::Internal(e.to_string()))?;
        let (stderr_reader, stderr_writer) =
            os_pipe::pipe().map_err(|e| ToolError::Internal(e.to_string()))?;

        let template = {
            let debugger = self.debugger()?;
            debugger
                .debugee()
                .process()
                .to_template(stdout_writer, stderr_writer)
                .map_err(ToolError::from)?
        };

        // drop the old engine first: traps restored, debuggee killed
        self.debugger = None;
        self.drain_output();

        self.spawn_output_reader(stdout_reader, "stdout");
        self.spawn_output_reader(stderr_reader, "stderr");

        let process = template.install().map_err(ToolError::from)?;
        drop(template);
        let debuggee_pid = process.pid().as_raw();
        self.oob.set_pause_hook(move || {
            let _ = nix::sys::signal::kill(Pid::from_raw(debuggee_pid), Signal::SIGSTOP);
        });
        let mut debugger = Debugger::new(process).map_err(ToolError::from)?;
        debugger.start_debugee().map_err(ToolError::from)?;
        let pid = debugger.ecx().location.pid;
        self.debugger = Some(debugger);

        self.stop_epoch += 1;
        self.frame_table.clear();
        self.varrefs.clear();
        self.reinstall_breakpoints(specs)?;

        Ok(self.stop_context(StopReason::Entry, pid, vec![]))
    }

    fn stop(&mut self, detach: bool, _terminate_only: bool) -> Result<(), ToolError> {
        if let Some(mut debugger) = self.debugger.take() {
            debugger.stop_debugee(!detach).map_err(ToolError::from)?;
        }
        self.drain_output();
        self.events.push(SessionEvent::Terminated);
        Ok(())
    }
}

fn native_caps() -> CapSet {
    CapSet {
        supports_configuration_done_request: true,
        supports_function_breakpoints: true,
        supports_conditional_breakpoints: true,
        supports_hit_conditional_breakpoints: true,
        supports_log_points: true,
        supports_evaluate_for_hovers: true,
        supports_set_variable: true,
        supports_set_expression: true,
        supports_restart_frame: false,
        supports_goto_targets_request: true,
        supports_step_in_targets_request: false,
        supports_completions_request: true,
        supports_modules_request: true,
        supports_loaded_sources_request: true,
        supports_read_memory_request: true,
        supports_write_memory_request: true,
        supports_disassemble_request: true,
        supports_instruction_breakpoints: true,
        supports_data_breakpoints: true,
        supports_exception_info_request: true,
        supports_terminate_threads_request: false,
        supports_restart_request: true,
        supports_cancel_request: true,
        supports_stepping_granularity: true,
        supports_breakpoint_locations_request: true,
        supports_step_back: false,
    }
}
