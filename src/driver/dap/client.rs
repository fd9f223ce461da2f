//! DAP client transport: spawns or connects to an adapter, correlates
//! responses to requests by sequence number and pumps adapter events into
//! the session queue.

use crate::driver::{CancelToken, EventQueue};
use crate::protocol::transport;
use crate::protocol::{SessionEvent, ToolError};
use log::{debug, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::process::{Child, Stdio};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

const DEFAULT_DEADLINE: Duration = Duration::from_secs(60);
const POLL_TICK: Duration = Duration::from_millis(50);

/// An in-flight request whose response has not been awaited yet.
pub struct PendingRequest {
    seq: i64,
    command: String,
    rx: mpsc::Receiver<Value>,
}

pub struct DapClient {
    writer: Mutex<Box<dyn Write + Send>>,
    pending: Arc<Mutex<HashMap<i64, mpsc::Sender<Value>>>>,
    seq: AtomicI64,
    /// `stopped`/`exited`/`terminated` events for synchronous run waits.
    stop_rx: Mutex<mpsc::Receiver<Value>>,
    initialized: Arc<(Mutex<bool>, Condvar)>,
    child: Mutex<Option<Child>>,
}

impl DapClient {
    /// Spawn an adapter that listens on a TCP port and connect to it.
    pub fn connect_tcp(
        command: &std::path::Path,
        argv: &[String],
        port: u16,
        events: Arc<EventQueue>,
    ) -> Result<Arc<Self>, ToolError> {
        let child = std::process::Command::new(command)
            .args(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ToolError::Internal(format!("spawn adapter: {e}")))?;

        // the adapter needs a moment to bind its socket
        let deadline = Instant::now() + Duration::from_secs(10);
        let stream = loop {
            match TcpStream::connect(("127.0.0.1", port)) {
                Ok(stream) => break stream,
                Err(e) if Instant::now() >= deadline => {
                    return Err(ToolError::Internal(format!(
                        "adapter did not open port {port}: {e}"
                    )));
                }
                Err(_) => std::thread::sleep(Duration::from_millis(100)),
            }
        };
        stream
            .set_nodelay(true)
            .map_err(|e| ToolError::Internal(e.to_string()))?;
        let reader = BufReader::new(
            stream
                .try_clone()
                .map_err(|e| ToolError::Internal(e.to_string()))?,
        );

        Ok(Self::start(
            Box::new(stream),
            Box::new(reader),
            Some(child),
            events,
        ))
    }

    /// Spawn an adapter speaking DAP over its stdio.
    pub fn connect_stdio(
        command: &std::path::Path,
        argv: &[String],
        events: Arc<EventQueue>,
    ) -> Result<Arc<Self>, ToolError> {
        let mut child = std::process::Command::new(command)
            .args(argv)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ToolError::Internal(format!("spawn adapter: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ToolError::Internal("adapter stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolError::Internal("adapter stdout unavailable".to_string()))?;

        Ok(Self::start(
            Box::new(stdin),
            Box::new(BufReader::new(stdout)),
            Some(child),
            events,
        ))
    }

    fn start(
        writer: Box<dyn Write + Send>,
        mut reader: Box<dyn BufRead + Send>,
        child: Option<Child>,
        events: Arc<EventQueue>,
    ) -> Arc<Self> {
        let (stop_tx, stop_rx) = mpsc::channel();
        let client = Arc::new(Self {
            writer: Mutex::new(writer),
            pending: Arc::new(Mutex::new(HashMap::new())),
            seq: AtomicI64::new(1),
            stop_rx: Mutex::new(stop_rx),
            initialized: Arc::new((Mutex::new(false), Condvar::new())),
            child: Mutex::new(child),
        });

        let pending = Arc::clone(&client.pending);
        let initialized = Arc::clone(&client.initialized);
        let reader_client = Arc::clone(&client);
        std::thread::spawn(move || loop {
            let message: Value = match transport::read_message(&mut reader) {
                Ok(Some(message)) => message,
                Ok(None) => {
                    debug!(target: "dap", "adapter stream closed");
                    events.push(SessionEvent::Terminated);
                    let _ = stop_tx.send(json!({"event": "terminated"}));
                    break;
                }
                Err(e) => {
                    warn!(target: "dap", "adapter read error: {e}");
                    events.push(SessionEvent::Terminated);
                    let _ = stop_tx.send(json!({"event": "terminated"}));
                    break;
                }
            };

            match message.get("type").and_then(Value::as_str) {
                Some("response") => {
                    let request_seq = message
                        .get("request_seq")
                        .and_then(Value::as_i64)
                        .unwrap_or(-1);
                    let sender = pending
                        .lock()
                        .expect("pending lock poisoned")
                        .remove(&request_seq);
                    match sender {
                        Some(sender) => {
                            let _ = sender.send(message);
                        }
                        None => {
                            warn!(target: "dap", "uncorrelated response, request_seq {request_seq}")
                        }
                    }
                }
                Some("event") => {
                    let name = message.get("event").and_then(Value::as_str).unwrap_or("");
                    if name == "initialized" {
                        let (flag, cvar) = &*initialized;
                        *flag.lock().expect("initialized lock poisoned") = true;
                        cvar.notify_all();
                    }
                    if matches!(name, "stopped" | "exited" | "terminated") {
                        let _ = stop_tx.send(message.clone());
                    }
                    if let Some(event) = normalize_event(&message) {
                        events.push(event);
                    }
                }
                Some("request") => {
                    // reverse request (runInTerminal etc.): refuse politely
                    let seq = message.get("seq").and_then(Value::as_i64).unwrap_or(0);
                    let command = message
                        .get("command")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    let _ = reader_client.write_raw(&json!({
                        "seq": reader_client.seq.fetch_add(1, Ordering::SeqCst),
                        "type": "response",
                        "request_seq": seq,
                        "success": false,
                        "command": command,
                        "message": "reverse requests are not supported",
                    }));
                }
                other => warn!(target: "dap", "unknown adapter message type: {other:?}"),
            }
        });

        client
    }

    fn write_raw(&self, message: &Value) -> Result<(), ToolError> {
        let mut writer = self.writer.lock().expect("writer lock poisoned");
        transport::write_message(&mut *writer, message).map_err(|e| {
            ToolError::Internal(format!("adapter connection broken: {e}"))
        })
    }

    /// Issue a request and wait for the matching response.
    pub fn request(&self, command: &str, arguments: Value) -> Result<Value, ToolError> {
        self.request_with(command, arguments, DEFAULT_DEADLINE, None)
    }

    pub fn request_with(
        &self,
        command: &str,
        arguments: Value,
        deadline: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<Value, ToolError> {
        let pending = self.request_deferred(command, arguments)?;
        self.await_response(pending, deadline, cancel)
    }

    /// Send a request and return a handle to await its response later.
    ///
    /// Needed for `launch`/`attach`, whose responses many adapters hold back
    /// until `configurationDone` has been processed.
    pub fn request_deferred(
        &self,
        command: &str,
        arguments: Value,
    ) -> Result<PendingRequest, ToolError> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(seq, tx);

        let sent = self.write_raw(&json!({
            "seq": seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        }));
        if let Err(e) = sent {
            self.pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&seq);
            return Err(e);
        }

        Ok(PendingRequest {
            seq,
            command: command.to_string(),
            rx,
        })
    }

    pub fn await_response(
        &self,
        pending: PendingRequest,
        deadline: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<Value, ToolError> {
        let deadline = Instant::now() + deadline;
        let response = loop {
            if let Some(cancel) = cancel {
                if cancel.is_cancelled() {
                    self.pending
                        .lock()
                        .expect("pending lock poisoned")
                        .remove(&pending.seq);
                    // forward the cancellation to the adapter, best effort
                    let _ = self
                        .request_fire_and_forget("cancel", json!({"requestId": pending.seq}));
                    return Err(ToolError::Cancelled);
                }
            }
            match pending.rx.recv_timeout(POLL_TICK) {
                Ok(response) => break response,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if Instant::now() >= deadline {
                        self.pending
                            .lock()
                            .expect("pending lock poisoned")
                            .remove(&pending.seq);
                        return Err(ToolError::Timeout);
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(ToolError::Internal("adapter connection closed".to_string()));
                }
            }
        };

        let success = response
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !success {
            let message = response
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("adapter request failed");
            return Err(ToolError::Internal(format!(
                "{}: {message}",
                pending.command
            )));
        }
        Ok(response.get("body").cloned().unwrap_or(Value::Null))
    }

    /// Send a request without waiting for the response (out-of-band pause,
    /// cancel forwarding).
    pub fn request_fire_and_forget(&self, command: &str, arguments: Value) -> Result<(), ToolError> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.write_raw(&json!({
            "seq": seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        }))
    }

    /// Wait for the adapter's `initialized` event.
    pub fn wait_initialized(&self, timeout: Duration) -> Result<(), ToolError> {
        let (flag, cvar) = &*self.initialized;
        let guard = flag.lock().expect("initialized lock poisoned");
        let (guard, result) = cvar
            .wait_timeout_while(guard, timeout, |ready| !*ready)
            .map_err(|_| ToolError::Internal("initialized lock poisoned".to_string()))?;
        drop(guard);
        if result.timed_out() {
            return Err(ToolError::Timeout);
        }
        Ok(())
    }

    /// Wait for the next `stopped`/`exited`/`terminated` event.
    pub fn wait_stop_event(
        &self,
        cancel: &CancelToken,
        deadline: Option<Duration>,
    ) -> Result<Value, ToolError> {
        let rx = self.stop_rx.lock().expect("stop channel lock poisoned");
        let deadline = deadline.map(|d| Instant::now() + d);
        loop {
            cancel.check()?;
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(ToolError::Timeout);
                }
            }
            match rx.recv_timeout(POLL_TICK) {
                Ok(message) => return Ok(message),
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(ToolError::Internal("adapter connection closed".to_string()));
                }
            }
        }
    }

    /// Terminate the adapter subprocess.
    pub fn shutdown(&self) {
        if let Some(mut child) = self.child.lock().expect("child lock poisoned").take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for DapClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Translate a raw adapter event into the uniform session event.
fn normalize_event(message: &Value) -> Option<SessionEvent> {
    let body = message.get("body").cloned().unwrap_or(Value::Null);
    let name = message.get("event").and_then(Value::as_str)?;
    match name {
        "stopped" => Some(SessionEvent::Stopped {
            reason: map_stop_reason(body.get("reason").and_then(Value::as_str).unwrap_or("")),
            thread_id: body.get("threadId").and_then(Value::as_i64),
            description: body
                .get("description")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            hit_breakpoint_ids: body.get("hitBreakpointIds").and_then(|v| {
                v.as_array().map(|ids| {
                    ids.iter()
                        .filter_map(|id| id.as_u64().map(|id| id as u32))
                        .collect()
                })
            }),
        }),
        "continued" => Some(SessionEvent::Continued {
            thread_id: body.get("threadId").and_then(Value::as_i64),
            all_threads_continued: body
                .get("allThreadsContinued")
                .and_then(Value::as_bool)
                .unwrap_or(true),
        }),
        "output" => Some(SessionEvent::Output {
            category: body
                .get("category")
                .and_then(Value::as_str)
                .unwrap_or("console")
                .to_string(),
            output: body
                .get("output")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
        }),
        "thread" => Some(SessionEvent::Thread {
            reason: body
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            thread_id: body.get("threadId").and_then(Value::as_i64).unwrap_or(0),
        }),
        "breakpoint" => Some(SessionEvent::Breakpoint {
            reason: body
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("changed")
                .to_string(),
            breakpoint: body.get("breakpoint").cloned().unwrap_or(Value::Null),
        }),
        "module" => Some(SessionEvent::Module {
            reason: body
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("new")
                .to_string(),
            module: body.get("module").cloned().unwrap_or(Value::Null),
        }),
        "loadedSource" => Some(SessionEvent::LoadedSource {
            reason: body
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("new")
                .to_string(),
            source: body.get("source").cloned().unwrap_or(Value::Null),
        }),
        "exited" => Some(SessionEvent::Exited {
            exit_code: body.get("exitCode").and_then(Value::as_i64).unwrap_or(0) as i32,
        }),
        "terminated" => Some(SessionEvent::Terminated),
        "initialized" | "process" | "capabilities" => None,
        other => {
            debug!(target: "dap", "ignored adapter event `{other}`");
            None
        }
    }
}

pub fn map_stop_reason(reason: &str) -> crate::protocol::StopReason {
    use crate::protocol::StopReason;
    match reason {
        "breakpoint" | "function breakpoint" | "instruction breakpoint" => StopReason::Breakpoint,
        "step" => StopReason::Step,
        "exception" => StopReason::Exception,
        "pause" => StopReason::Pause,
        "entry" => StopReason::Entry,
        "data breakpoint" => StopReason::Watchpoint,
        "goto" => StopReason::Goto,
        _ => StopReason::Signal,
    }
}
