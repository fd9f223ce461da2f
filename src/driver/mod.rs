//! Backend-neutral driver contract.
//!
//! A [`Driver`] is one debuggee behind a uniform control surface; concrete
//! implementations are the native ptrace engine and the external adapter
//! drivers (DAP, CDP). Operations a backend cannot perform return
//! [`ToolError::NotSupported`], never a silent success.

pub mod cdp;
pub mod dap;
pub mod native;

use crate::protocol::{SessionEvent, StopReason, ToolError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Native,
    Dap,
    Cdp,
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverKind::Native => f.write_str("native"),
            DriverKind::Dap => f.write_str("dap"),
            DriverKind::Cdp => f.write_str("cdp"),
        }
    }
}

/// Cancellation token attached to every outstanding request.
#[derive(Debug, Default)]
pub struct CancelToken {
    flag: AtomicBool,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), ToolError> {
        if self.is_cancelled() {
            Err(ToolError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Per-session event queue; drivers push, `poll_events` drains.
///
/// `terminated` is final: it is enqueued at most once per session, no matter
/// how many teardown paths (reader thread, driver stop, worker cleanup)
/// report it.
#[derive(Default)]
pub struct EventQueue {
    inner: Mutex<VecDeque<SessionEvent>>,
    terminated: AtomicBool,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: SessionEvent) {
        if matches!(event, SessionEvent::Terminated)
            && self.terminated.swap(true, Ordering::SeqCst)
        {
            return;
        }
        self.inner
            .lock()
            .expect("event queue lock poisoned")
            .push_back(event);
    }

    pub fn drain(&self) -> Vec<SessionEvent> {
        self.inner
            .lock()
            .expect("event queue lock poisoned")
            .drain(..)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .lock()
            .expect("event queue lock poisoned")
            .is_empty()
    }

    /// True once a `terminated` event has ever been enqueued, drained or not.
    pub fn terminated_enqueued(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LaunchRequest {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub stop_on_entry: bool,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachRequest {
    #[serde(default)]
    pub pid: Option<i32>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BreakpointProps {
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub hit_condition: Option<String>,
    #[serde(default)]
    pub log_message: Option<String>,
}

#[derive(Debug, Clone)]
pub enum BreakpointSpec {
    Line {
        path: PathBuf,
        line: u64,
        props: BreakpointProps,
    },
    Function {
        name: String,
        props: BreakpointProps,
    },
    Instruction {
        address: u64,
        props: BreakpointProps,
    },
    Exception {
        filters: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTarget<'a> {
    Variable(&'a str),
    Address(u64),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointInfo {
    pub id: u32,
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunAction {
    Continue,
    StepInto,
    StepOver,
    StepOut,
    Pause,
    Restart,
    Goto,
    ReverseContinue,
    StepBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    #[default]
    Statement,
    Line,
    Instruction,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunOptions {
    #[serde(default)]
    pub granularity: Granularity,
    #[serde(default)]
    pub thread_id: Option<i64>,
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub line: Option<u64>,
    #[serde(default)]
    pub target_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopContext {
    pub reason: StopReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub hit_breakpoint_ids: Vec<u32>,
}

impl StopContext {
    pub fn new(reason: StopReason) -> Self {
        Self {
            reason,
            thread_id: None,
            pc: None,
            source: None,
            line: None,
            description: None,
            exit_code: None,
            hit_breakpoint_ids: vec![],
        }
    }

    pub fn exited(code: i32) -> Self {
        let mut ctx = Self::new(StopReason::Exit);
        ctx.exit_code = Some(code);
        ctx
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InspectRequest {
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub variable_ref: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub frame_id: Option<i64>,
    #[serde(default)]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDescriptor {
    pub name: String,
    pub value: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    pub variables_reference: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_reference: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluatedValue {
    pub result: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    pub variables_reference: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<VariableDescriptor>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadInfo {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameInfo {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub line: u64,
    pub column: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instruction_pointer_reference: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeInfo {
    pub name: String,
    pub variables_reference: i64,
    pub expensive: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionInfo {
    pub address: String,
    pub instruction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instruction_bytes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterInfo {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionItem {
    pub label: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionDetails {
    pub exception_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub break_mode: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GotoTarget {
    pub id: i64,
    pub label: String,
    pub line: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepInTarget {
    pub id: i64,
    pub label: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub name: String,
    pub address: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableLocationInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub description: String,
}

/// Capability set, DAP field names verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CapSet {
    pub supports_configuration_done_request: bool,
    pub supports_function_breakpoints: bool,
    pub supports_conditional_breakpoints: bool,
    pub supports_hit_conditional_breakpoints: bool,
    pub supports_log_points: bool,
    pub supports_evaluate_for_hovers: bool,
    pub supports_set_variable: bool,
    pub supports_set_expression: bool,
    pub supports_restart_frame: bool,
    pub supports_goto_targets_request: bool,
    pub supports_step_in_targets_request: bool,
    pub supports_completions_request: bool,
    pub supports_modules_request: bool,
    pub supports_loaded_sources_request: bool,
    pub supports_read_memory_request: bool,
    pub supports_write_memory_request: bool,
    pub supports_disassemble_request: bool,
    pub supports_instruction_breakpoints: bool,
    pub supports_data_breakpoints: bool,
    pub supports_exception_info_request: bool,
    pub supports_terminate_threads_request: bool,
    pub supports_restart_request: bool,
    pub supports_cancel_request: bool,
    pub supports_stepping_granularity: bool,
    pub supports_breakpoint_locations_request: bool,
    pub supports_step_back: bool,
}

/// The uniform per-session control surface.
///
/// Implementations must translate every call either into native primitives
/// or into adapter requests; anything else returns `NotSupported`.
#[allow(clippy::too_many_arguments)]
pub trait Driver: Send {
    fn kind(&self) -> DriverKind;
    fn capabilities(&self) -> CapSet;

    fn launch(&mut self, req: &LaunchRequest) -> Result<StopContext, ToolError>;
    fn attach(&mut self, req: &AttachRequest) -> Result<StopContext, ToolError>;

    fn set_breakpoint(&mut self, spec: BreakpointSpec) -> Result<BreakpointInfo, ToolError>;
    fn remove_breakpoint(&mut self, id: u32) -> Result<(), ToolError>;
    fn list_breakpoints(&mut self) -> Result<Vec<BreakpointInfo>, ToolError>;
    fn breakpoint_locations(
        &mut self,
        path: &std::path::Path,
        line: u64,
        end_line: u64,
    ) -> Result<Vec<(u64, u64)>, ToolError> {
        let _ = (path, line, end_line);
        Err(ToolError::NotSupported("breakpoint_locations"))
    }

    fn run(
        &mut self,
        action: RunAction,
        opts: &RunOptions,
        cancel: &CancelToken,
    ) -> Result<StopContext, ToolError>;
    fn pause(&mut self, thread_id: Option<i64>) -> Result<(), ToolError>;

    fn inspect(&mut self, req: &InspectRequest) -> Result<EvaluatedValue, ToolError>;
    fn set_variable(
        &mut self,
        name: &str,
        value: &str,
        frame_id: Option<i64>,
    ) -> Result<(String, Option<String>), ToolError>;
    fn set_expression(
        &mut self,
        expression: &str,
        value: &str,
        frame_id: Option<i64>,
    ) -> Result<(String, Option<String>), ToolError> {
        let _ = (expression, value, frame_id);
        Err(ToolError::NotSupported("set_expression"))
    }

    fn threads(&mut self) -> Result<Vec<ThreadInfo>, ToolError>;
    fn stacktrace(
        &mut self,
        thread_id: Option<i64>,
        start_frame: usize,
        levels: usize,
    ) -> Result<Vec<FrameInfo>, ToolError>;
    fn scopes(&mut self, frame_id: i64) -> Result<Vec<ScopeInfo>, ToolError>;

    fn memory_read(&mut self, address: u64, size: usize) -> Result<Vec<u8>, ToolError> {
        let _ = (address, size);
        Err(ToolError::NotSupported("memory read"))
    }
    fn memory_write(&mut self, address: u64, data: &[u8]) -> Result<(), ToolError> {
        let _ = (address, data);
        Err(ToolError::NotSupported("memory write"))
    }
    fn disassemble(
        &mut self,
        address: u64,
        count: usize,
        resolve_symbols: bool,
    ) -> Result<Vec<InstructionInfo>, ToolError> {
        let _ = (address, count, resolve_symbols);
        Err(ToolError::NotSupported("disassemble"))
    }
    fn registers(&mut self, thread_id: Option<i64>) -> Result<Vec<RegisterInfo>, ToolError> {
        let _ = thread_id;
        Err(ToolError::NotSupported("registers"))
    }
    fn write_register(
        &mut self,
        name: &str,
        value: u64,
        thread_id: Option<i64>,
    ) -> Result<(), ToolError> {
        let _ = (name, value, thread_id);
        Err(ToolError::NotSupported("write_register"))
    }

    fn modules(&mut self) -> Result<Vec<Value>, ToolError> {
        Err(ToolError::NotSupported("modules"))
    }
    fn loaded_sources(&mut self) -> Result<Vec<Value>, ToolError> {
        Err(ToolError::NotSupported("loaded_sources"))
    }
    fn source(&mut self, source_reference: i64, path: Option<&str>) -> Result<String, ToolError> {
        let _ = (source_reference, path);
        Err(ToolError::NotSupported("source"))
    }
    fn completions(
        &mut self,
        text: &str,
        column: u64,
        frame_id: Option<i64>,
    ) -> Result<Vec<CompletionItem>, ToolError> {
        let _ = (text, column, frame_id);
        Err(ToolError::NotSupported("completions"))
    }
    fn exception_info(&mut self, thread_id: Option<i64>) -> Result<ExceptionDetails, ToolError> {
        let _ = thread_id;
        Err(ToolError::NotSupported("exception_info"))
    }
    fn goto_targets(
        &mut self,
        path: &std::path::Path,
        line: u64,
    ) -> Result<Vec<GotoTarget>, ToolError> {
        let _ = (path, line);
        Err(ToolError::NotSupported("goto_targets"))
    }
    fn step_in_targets(&mut self, frame_id: i64) -> Result<Vec<StepInTarget>, ToolError> {
        let _ = frame_id;
        Err(ToolError::NotSupported("step_in_targets"))
    }
    fn restart_frame(&mut self, frame_id: i64) -> Result<(), ToolError> {
        let _ = frame_id;
        Err(ToolError::NotSupported("restart_frame"))
    }

    fn watchpoint(
        &mut self,
        target: WatchTarget,
        access: &str,
        frame_id: Option<i64>,
    ) -> Result<BreakpointInfo, ToolError> {
        let _ = (target, access, frame_id);
        Err(ToolError::NotSupported("watchpoint"))
    }
    fn find_symbol(&mut self, name: &str) -> Result<Vec<SymbolInfo>, ToolError> {
        let _ = name;
        Err(ToolError::NotSupported("find_symbol"))
    }
    fn variable_location(
        &mut self,
        name: &str,
        frame_id: Option<i64>,
    ) -> Result<VariableLocationInfo, ToolError> {
        let _ = (name, frame_id);
        Err(ToolError::NotSupported("variable_location"))
    }

    fn cancel(&mut self, request_id: Option<i64>, progress_id: Option<String>) -> Result<(), ToolError> {
        let _ = (request_id, progress_id);
        Ok(())
    }
    fn terminate_threads(&mut self, thread_ids: &[i64]) -> Result<(), ToolError> {
        let _ = thread_ids;
        Err(ToolError::NotSupported("terminate_threads"))
    }

    fn restart(&mut self) -> Result<StopContext, ToolError> {
        Err(ToolError::NotSupported("restart"))
    }
    fn stop(&mut self, detach: bool, terminate_only: bool) -> Result<(), ToolError>;
}

/// Classify a native engine failure into the uniform error surface.
impl From<crate::debugger::error::Error> for ToolError {
    fn from(e: crate::debugger::error::Error) -> Self {
        use crate::debugger::error::Error as E;
        match e {
            E::AlreadyRun | E::ProcessNotStarted => ToolError::InvalidState(e.to_string()),
            E::ProcessExit(_) => ToolError::InvalidState(e.to_string()),
            E::FrameNotFound(_) | E::TraceeNotFound(_) => ToolError::InvalidState(e.to_string()),
            E::NoSuitablePlace | E::PlaceNotFound(_) | E::FunctionNotFound(_) => {
                ToolError::BreakpointUnverified(e.to_string())
            }
            E::MemoryAccess(addr) => ToolError::MemoryAccess(addr as u64),
            E::UnknownAddress => ToolError::MemoryAccess(0),
            E::WatchpointExhausted => {
                ToolError::NotSupported("hardware watchpoint slots exhausted")
            }
            E::ExpressionParse(_)
            | E::UnboundIdentifier(_)
            | E::NotAddressable
            | E::TypeMismatch(_)
            | E::DivideByZero
            | E::RegisterNameNotFound(_) => ToolError::InvalidParams(e.to_string()),
            E::SpawnFailed(_) | E::Attach(_) | E::AttachedProcessNotFound(_) => {
                ToolError::Internal(e.to_string())
            }
            other => ToolError::Internal(other.to_string()),
        }
    }
}
