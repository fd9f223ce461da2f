use crate::debugger::address::GlobalAddress;
use gimli::UnitOffset;
use nix::unistd::Pid;
use std::str::Utf8Error;
use std::string::FromUtf8Error;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error("debuggee already run")]
    AlreadyRun,
    #[error("program is not being started")]
    ProcessNotStarted,
    #[error("debuggee process exited with code {0}")]
    ProcessExit(i32),
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Utf8(#[from] Utf8Error),
    #[error(transparent)]
    FromUtf8(#[from] FromUtf8Error),
    #[error(transparent)]
    RegEx(#[from] regex::Error),

    // --------------------------------- debugger entity not found----------------------------------
    #[error("no debug information for {0}")]
    NoDebugInformation(&'static str),
    #[error("unknown register {0:?}")]
    RegisterNotFound(gimli::Register),
    #[error("unknown register {0:?}")]
    RegisterNameNotFound(String),
    #[error("source place not found at address {0}")]
    PlaceNotFound(GlobalAddress),
    #[error("there are no suitable places for this request")]
    NoSuitablePlace,
    #[error("function `{0}` not found")]
    FunctionNotFound(String),
    #[error("function not found at address {0}")]
    NoFunctionAtAddress(GlobalAddress),
    #[error("type not found")]
    TypeNotFound,
    #[error("frame number {0} not found")]
    FrameNotFound(u32),
    #[error("tracee {0} not found")]
    TraceeNotFound(i32),
    #[error("debug information entry (die) not found, offset: {0:?}")]
    DieNotFound(UnitOffset),
    #[error("section \"{0}\" not found")]
    SectionNotFound(&'static str),

    // --------------------------------- remote memory errors --------------------------------------
    #[error("invalid binary representation of type `{0}`: {1:?}")]
    TypeBinaryRepr(&'static str, Box<[u8]>),
    #[error("unknown address")]
    UnknownAddress,
    #[error("memory access error at {0:#x}")]
    MemoryAccess(usize),
    #[error("memory region offset not found ({0})")]
    MappingOffsetNotFound(&'static str),

    // --------------------------------- syscall errors --------------------------------------------
    #[error("waitpid syscall error: {0}")]
    Waitpid(nix::Error),
    #[error("ptrace syscall error: {0}")]
    Ptrace(nix::Error),
    #[error("{0} syscall error: {1}")]
    Syscall(&'static str, nix::Error),
    #[error("multiple syscall errors {0:?}")]
    MultipleErrors(Vec<Self>),

    // --------------------------------- parsing errors --------------------------------------------
    #[error("dwarf parsing error: {0}")]
    DwarfParsing(#[from] gimli::Error),
    #[error("object file parsing error: {0}")]
    ObjParsing(#[from] object::Error),

    // --------------------------------- unwind errors ---------------------------------------------
    #[error("unwind: no unwind context")]
    UnwindNoContext,
    #[error("unwind: too deep frame number")]
    UnwindTooDeepFrame,

    // --------------------------------- dwarf evaluation errors -----------------------------------
    #[error("dwarf expression evaluation: eval option `{0}` required")]
    EvalOptionRequired(&'static str),
    #[error("dwarf expression evaluation: unsupported evaluation require ({0})")]
    EvalUnsupportedRequire(String),
    #[error("no frame base address")]
    NoFBA,
    #[error("frame base address attribute not an expression")]
    FBANotAnExpression,
    #[error("range information for function `{0:?}` not exists")]
    NoFunctionRanges(Option<String>),
    #[error("die type not exists")]
    NoDieType,

    // --------------------------------- source expression errors ----------------------------------
    #[error("expression parse error: {0}")]
    ExpressionParse(String),
    #[error("unbound identifier `{0}`")]
    UnboundIdentifier(String),
    #[error("value is not addressable")]
    NotAddressable,
    #[error("type mismatch: {0}")]
    TypeMismatch(&'static str),
    #[error("division by zero")]
    DivideByZero,

    // --------------------------------- breakpoint/watchpoint errors ------------------------------
    #[error("breakpoint {0} not found")]
    BreakpointNotFound(u32),
    #[error("hardware debug registers exhausted")]
    WatchpointExhausted,
    #[error("watchpoint {0} not found")]
    WatchpointNotFound(u32),

    // --------------------------------- disasm ----------------------------------------------------
    #[error("install disassembler: {0}")]
    DisAsmInit(capstone::Error),
    #[error("instructions disassembly error: {0}")]
    DisAsm(capstone::Error),

    // --------------------------------- spawn/attach errors ---------------------------------------
    #[error("spawn failed: {0}")]
    SpawnFailed(String),
    #[error("process pid {0} not found")]
    AttachedProcessNotFound(Pid),
    #[error("attach a running process: {0}")]
    Attach(nix::Error),
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
