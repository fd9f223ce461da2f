use gumshoe::daemon::session::Session;
use gumshoe::driver::{CancelToken, DriverKind};
use gumshoe::tools::Tool;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub struct TestSession {
    session: Arc<Session>,
    stopped: bool,
}

impl TestSession {
    /// Launch a native session for a fixture binary, stopped at entry.
    pub fn launch(program: &str) -> TestSession {
        Self::launch_with(program, json!({"program": program, "stop_on_entry": true}))
    }

    pub fn launch_with(program: &str, params: Value) -> TestSession {
        let session = Session::spawn("session-test".to_string(), DriverKind::Native, None);
        let result = session.call(
            Tool::Launch,
            params,
            Arc::new(CancelToken::new()),
            Some(Duration::from_secs(30)),
        );
        result.unwrap_or_else(|e| panic!("launch {program}: {e}"));
        TestSession {
            session,
            stopped: false,
        }
    }

    pub fn call(&self, tool: Tool, params: Value) -> Result<Value, gumshoe::protocol::ToolError> {
        self.session.call(
            tool,
            params,
            Arc::new(CancelToken::new()),
            Some(Duration::from_secs(30)),
        )
    }

    pub fn call_ok(&self, tool: Tool, params: Value) -> Value {
        self.call(tool, params.clone())
            .unwrap_or_else(|e| panic!("{tool} {params}: {e}"))
    }

    pub fn set_line_breakpoint(&self, file: &str, line: u64) -> Value {
        self.call_ok(
            Tool::Breakpoint,
            json!({"action": "set", "file": file, "line": line}),
        )
    }

    pub fn set_fn_breakpoint(&self, function: &str) -> Value {
        self.call_ok(
            Tool::Breakpoint,
            json!({"action": "set_function", "function": function}),
        )
    }

    /// Continue and return the stop context.
    pub fn cont(&self) -> Value {
        self.call_ok(Tool::Run, json!({"action": "continue"}))
    }

    pub fn step(&self, action: &str) -> Value {
        self.call_ok(Tool::Run, json!({"action": action}))
    }

    /// Evaluate an expression in the innermost frame and return the rendered
    /// result string.
    pub fn inspect(&self, expression: &str) -> String {
        let value = self.call_ok(Tool::Inspect, json!({"expression": expression}));
        value["result"]
            .as_str()
            .unwrap_or_else(|| panic!("inspect({expression}) has no result: {value}"))
            .to_string()
    }

    pub fn events(&self) -> Vec<gumshoe::protocol::SessionEvent> {
        self.session.events.drain()
    }

    pub fn session_oob(&self) -> Arc<gumshoe::driver::native::OutOfBand> {
        Arc::clone(&self.session.oob)
    }

    pub fn stop(&mut self) {
        if !self.stopped {
            let _ = self.call(Tool::Stop, json!({}));
            self.stopped = true;
        }
    }
}

impl Drop for TestSession {
    fn drop(&mut self) {
        self.stop();
    }
}

pub fn assert_stop_reason(stop: &Value, expected: &str) {
    assert_eq!(
        stop["reason"].as_str(),
        Some(expected),
        "unexpected stop context: {stop}"
    );
}
