//! Framed JSON-RPC 2.0 protocol spoken between the client and the daemon.

pub mod transport;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// A single client request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Request {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<i64>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(id: i64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }
}

/// A response for a [`Request`], either a result or an error.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn result(id: Option<i64>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<i64>, e: &ToolError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code: e.code(),
                message: e.to_string(),
                data: None,
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Uniform error surface of the tool API.
///
/// Every driver failure is classified into one of these kinds before it
/// leaves the daemon; the JSON-RPC code mapping lives in [`ToolError::code`]
/// and nowhere else.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("unknown tool: {0}")]
    MethodNotFound(String),
    #[error("not supported by this backend: {0}")]
    NotSupported(&'static str),
    #[error("{0}")]
    Internal(String),
    #[error("unknown session: {0}")]
    SessionNotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("breakpoint location could not be resolved: {0}")]
    BreakpointUnverified(String),
    #[error("memory access error at {0:#x}")]
    MemoryAccess(u64),
    #[error("request deadline exceeded")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
}

impl ToolError {
    pub fn code(&self) -> i32 {
        match self {
            ToolError::InvalidParams(_) => -32602,
            ToolError::MethodNotFound(_) => -32601,
            ToolError::NotSupported(_) => -32001,
            ToolError::Internal(_) => -32603,
            ToolError::SessionNotFound(_) => -32002,
            ToolError::InvalidState(_) => -32003,
            ToolError::BreakpointUnverified(_) => -32004,
            ToolError::MemoryAccess(_) => -32005,
            ToolError::Timeout => -32006,
            ToolError::Cancelled => -32007,
        }
    }
}

impl From<std::io::Error> for ToolError {
    fn from(e: std::io::Error) -> Self {
        ToolError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(e: serde_json::Error) -> Self {
        ToolError::InvalidParams(e.to_string())
    }
}

/// Why a debuggee is currently halted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Entry,
    Breakpoint,
    Step,
    Exception,
    Signal,
    Exit,
    Pause,
    Watchpoint,
    Goto,
}

/// Asynchronous session event, returned from `poll_events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SessionEvent {
    Stopped {
        reason: StopReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        thread_id: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        hit_breakpoint_ids: Option<Vec<u32>>,
    },
    Continued {
        #[serde(skip_serializing_if = "Option::is_none")]
        thread_id: Option<i64>,
        all_threads_continued: bool,
    },
    Output {
        category: String,
        output: String,
    },
    Thread {
        reason: String,
        thread_id: i64,
    },
    Breakpoint {
        reason: String,
        breakpoint: Value,
    },
    Module {
        reason: String,
        module: Value,
    },
    LoadedSource {
        reason: String,
        source: Value,
    },
    Exited {
        exit_code: i32,
    },
    Terminated,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases: [(ToolError, i32); 10] = [
            (ToolError::InvalidParams("x".into()), -32602),
            (ToolError::MethodNotFound("x".into()), -32601),
            (ToolError::NotSupported("registers"), -32001),
            (ToolError::Internal("x".into()), -32603),
            (ToolError::SessionNotFound("session-1".into()), -32002),
            (ToolError::InvalidState("running".into()), -32003),
            (ToolError::BreakpointUnverified("x".into()), -32004),
            (ToolError::MemoryAccess(0xdead), -32005),
            (ToolError::Timeout, -32006),
            (ToolError::Cancelled, -32007),
        ];
        for (err, code) in cases {
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn test_event_serde_shape() {
        let ev = SessionEvent::Stopped {
            reason: StopReason::Breakpoint,
            thread_id: Some(42),
            description: None,
            hit_breakpoint_ids: Some(vec![1]),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "stopped");
        assert_eq!(json["reason"], "breakpoint");
        assert_eq!(json["threadId"], 42);
        assert!(json.get("description").is_none());
    }
}
