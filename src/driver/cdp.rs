//! Driver for the Chrome DevTools Protocol: drives a JS runtime spawned with
//! an inspector port, translating the uniform contract onto `Debugger.*` and
//! `Runtime.*` commands over a WebSocket.

use crate::driver::dap::manifest::AdapterManifest;
use crate::driver::native::OutOfBand;
use crate::driver::{
    AttachRequest, BreakpointInfo, BreakpointSpec, CancelToken, CapSet, Driver, DriverKind,
    EvaluatedValue, EventQueue, ExceptionDetails, FrameInfo, InspectRequest, LaunchRequest,
    RunAction, RunOptions, ScopeInfo, StopContext, ThreadInfo, VariableDescriptor,
};
use crate::protocol::{SessionEvent, StopReason, ToolError};
use log::{debug, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

const CONNECT_DEADLINE: Duration = Duration::from_secs(10);
const COMMAND_DEADLINE: Duration = Duration::from_secs(60);
const POLL_TICK: Duration = Duration::from_millis(50);

struct CdpClient {
    socket: Arc<Mutex<WebSocket<MaybeTlsStream<TcpStream>>>>,
    pending: Arc<Mutex<HashMap<u64, mpsc::Sender<Value>>>>,
    next_id: AtomicU64,
    paused_rx: Mutex<mpsc::Receiver<Value>>,
}

impl CdpClient {
    fn connect(ws_url: &str, events: Arc<EventQueue>) -> Result<Arc<Self>, ToolError> {
        let (mut socket, _) = tungstenite::connect(ws_url)
            .map_err(|e| ToolError::Internal(format!("inspector connect: {e}")))?;
        if let MaybeTlsStream::Plain(stream) = socket.get_mut() {
            stream
                .set_read_timeout(Some(POLL_TICK))
                .map_err(|e| ToolError::Internal(e.to_string()))?;
        }

        let (paused_tx, paused_rx) = mpsc::channel();
        let client = Arc::new(Self {
            socket: Arc::new(Mutex::new(socket)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            paused_rx: Mutex::new(paused_rx),
        });

        let socket = Arc::clone(&client.socket);
        let pending = Arc::clone(&client.pending);
        std::thread::spawn(move || loop {
            let message = {
                let mut socket = socket.lock().expect("cdp socket lock poisoned");
                match socket.read() {
                    Ok(message) => Some(message),
                    Err(tungstenite::Error::Io(e))
                        if matches!(
                            e.kind(),
                            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                        ) =>
                    {
                        None
                    }
                    Err(e) => {
                        debug!(target: "cdp", "inspector socket closed: {e}");
                        events.push(SessionEvent::Terminated);
                        let _ = paused_tx.send(json!({"method": "__terminated"}));
                        break;
                    }
                }
            };

            let Some(message) = message else {
                std::thread::sleep(Duration::from_millis(2));
                continue;
            };
            let Message::Text(text) = message else {
                continue;
            };
            let Ok(value) = serde_json::from_str::<Value>(&text) else {
                warn!(target: "cdp", "unparsable inspector message");
                continue;
            };

            if let Some(id) = value.get("id").and_then(Value::as_u64) {
                if let Some(sender) = pending
                    .lock()
                    .expect("cdp pending lock poisoned")
                    .remove(&id)
                {
                    let _ = sender.send(value);
                }
                continue;
            }

            let method = value.get("method").and_then(Value::as_str).unwrap_or("");
            let params = value.get("params").cloned().unwrap_or(Value::Null);
            match method {
                "Debugger.paused" => {
                    let reason = params.get("reason").and_then(Value::as_str).unwrap_or("");
                    let hit = params
                        .get("hitBreakpoints")
                        .and_then(Value::as_array)
                        .map(|b| !b.is_empty())
                        .unwrap_or(false);
                    events.push(SessionEvent::Stopped {
                        reason: if hit {
                            StopReason::Breakpoint
                        } else if reason == "exception" {
                            StopReason::Exception
                        } else {
                            StopReason::Pause
                        },
                        thread_id: Some(1),
                        description: Some(reason.to_string()),
                        hit_breakpoint_ids: None,
                    });
                    let _ = paused_tx.send(value);
                }
                "Debugger.resumed" => {
                    events.push(SessionEvent::Continued {
                        thread_id: Some(1),
                        all_threads_continued: true,
                    });
                }
                "Runtime.consoleAPICalled" => {
                    let output = params
                        .get("args")
                        .and_then(Value::as_array)
                        .map(|args| {
                            args.iter()
                                .map(render_remote_object)
                                .collect::<Vec<_>>()
                                .join(" ")
                        })
                        .unwrap_or_default();
                    events.push(SessionEvent::Output {
                        category: "stdout".to_string(),
                        output: format!("{output}\n"),
                    });
                }
                "Runtime.exceptionThrown" => {
                    let description = params
                        .pointer("/exceptionDetails/exception/description")
                        .and_then(Value::as_str)
                        .unwrap_or("uncaught exception");
                    events.push(SessionEvent::Output {
                        category: "stderr".to_string(),
                        output: format!("{description}\n"),
                    });
                }
                "Runtime.executionContextDestroyed" | "Inspector.detached" => {
                    events.push(SessionEvent::Exited { exit_code: 0 });
                    events.push(SessionEvent::Terminated);
                    let _ = paused_tx.send(json!({"method": "__terminated"}));
                }
                _ => {}
            }
        });

        Ok(client)
    }

    fn command(&self, method: &str, params: Value) -> Result<Value, ToolError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel();
        self.pending
            .lock()
            .expect("cdp pending lock poisoned")
            .insert(id, tx);

        {
            let mut socket = self.socket.lock().expect("cdp socket lock poisoned");
            socket
                .send(Message::Text(
                    json!({"id": id, "method": method, "params": params}).to_string(),
                ))
                .map_err(|e| ToolError::Internal(format!("inspector send: {e}")))?;
        }

        let deadline = Instant::now() + COMMAND_DEADLINE;
        let response = loop {
            match rx.recv_timeout(POLL_TICK) {
                Ok(response) => break response,
                Err(mpsc::RecvTimeoutError::Timeout) if Instant::now() >= deadline => {
                    self.pending
                        .lock()
                        .expect("cdp pending lock poisoned")
                        .remove(&id);
                    return Err(ToolError::Timeout);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(ToolError::Internal("inspector connection closed".to_string()))
                }
            }
        };

        if let Some(error) = response.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("inspector command failed");
            return Err(ToolError::Internal(format!("{method}: {message}")));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Send a command without waiting for its response (out-of-band pause).
    fn fire(&self, method: &str) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut socket) = self.socket.lock() {
            let _ = socket.send(Message::Text(
                json!({"id": id, "method": method, "params": {}}).to_string(),
            ));
        }
    }

    fn wait_paused(&self, cancel: &CancelToken) -> Result<Value, ToolError> {
        let rx = self.paused_rx.lock().expect("cdp paused lock poisoned");
        loop {
            cancel.check()?;
            match rx.recv_timeout(POLL_TICK) {
                Ok(value) => return Ok(value),
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(ToolError::Internal("inspector connection closed".to_string()))
                }
            }
        }
    }
}

/// Ask the inspector's HTTP endpoint for the WebSocket debugger URL.
fn discover_ws_url(port: u16) -> Result<String, ToolError> {
    let deadline = Instant::now() + CONNECT_DEADLINE;
    loop {
        match try_discover(port) {
            Ok(url) => return Ok(url),
            Err(e) if Instant::now() >= deadline => return Err(e),
            Err(_) => std::thread::sleep(Duration::from_millis(100)),
        }
    }
}

fn try_discover(port: u16) -> Result<String, ToolError> {
    let mut stream = TcpStream::connect(("127.0.0.1", port))
        .map_err(|e| ToolError::Internal(format!("inspector port closed: {e}")))?;
    stream
        .write_all(
            format!("GET /json HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nConnection: close\r\n\r\n")
                .as_bytes(),
        )
        .map_err(|e| ToolError::Internal(e.to_string()))?;

    let mut raw = Vec::new();
    stream
        .read_to_end(&mut raw)
        .map_err(|e| ToolError::Internal(e.to_string()))?;
    let raw = String::from_utf8_lossy(&raw);
    let body = raw
        .split("\r\n\r\n")
        .nth(1)
        .ok_or_else(|| ToolError::Internal("malformed /json response".to_string()))?;
    let list: Value = serde_json::from_str(body.trim())
        .map_err(|e| ToolError::Internal(format!("bad /json payload: {e}")))?;
    list.as_array()
        .and_then(|items| items.first())
        .and_then(|item| item.get("webSocketDebuggerUrl"))
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| ToolError::Internal("no debuggable targets".to_string()))
}

fn render_remote_object(obj: &Value) -> String {
    if let Some(value) = obj.get("value") {
        return match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
    }
    obj.get("description")
        .and_then(Value::as_str)
        .unwrap_or("undefined")
        .to_string()
}

pub struct CdpDriver {
    manifest: AdapterManifest,
    client: Option<Arc<CdpClient>>,
    events: Arc<EventQueue>,
    oob: Arc<OutOfBand>,
    child: Option<std::process::Child>,
    caps: CapSet,
    next_bp_id: u32,
    /// local id -> CDP breakpoint id
    breakpoints: HashMap<u32, (String, Option<String>, Option<u64>)>,
    /// varref -> remote objectId
    objects: HashMap<i64, String>,
    next_varref: i64,
    last_paused: Option<Value>,
}

impl CdpDriver {
    pub fn new(manifest: AdapterManifest, events: Arc<EventQueue>, oob: Arc<OutOfBand>) -> Self {
        Self {
            manifest,
            client: None,
            events,
            oob,
            child: None,
            caps: cdp_caps(),
            next_bp_id: 1,
            breakpoints: HashMap::new(),
            objects: HashMap::new(),
            next_varref: 1,
            last_paused: None,
        }
    }

    fn client(&self) -> Result<&Arc<CdpClient>, ToolError> {
        self.client
            .as_ref()
            .ok_or_else(|| ToolError::InvalidState("inspector session not launched".to_string()))
    }

    fn alloc_object(&mut self, object_id: String) -> i64 {
        let id = self.next_varref;
        self.next_varref += 1;
        self.objects.insert(id, object_id);
        id
    }

    fn call_frames(&self) -> Result<Vec<Value>, ToolError> {
        self.last_paused
            .as_ref()
            .and_then(|paused| paused.pointer("/params/callFrames"))
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| ToolError::InvalidState("the runtime is not paused".to_string()))
    }

    fn stop_context_from_paused(&mut self, message: Value) -> StopContext {
        if message.get("method").and_then(Value::as_str) == Some("__terminated") {
            self.last_paused = None;
            return StopContext::exited(0);
        }

        let params = message.get("params").cloned().unwrap_or(Value::Null);
        let reason_str = params.get("reason").and_then(Value::as_str).unwrap_or("");
        let hit: Vec<String> = params
            .get("hitBreakpoints")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(ToString::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let reason = if !hit.is_empty() {
            StopReason::Breakpoint
        } else {
            match reason_str {
                "exception" | "promiseRejection" => StopReason::Exception,
                "Break on start" | "debugCommand" => StopReason::Entry,
                "step" => StopReason::Step,
                _ => StopReason::Pause,
            }
        };

        let mut ctx = StopContext::new(reason);
        ctx.thread_id = Some(1);
        ctx.description = (!reason_str.is_empty()).then(|| reason_str.to_string());
        ctx.hit_breakpoint_ids = hit
            .iter()
            .filter_map(|cdp_id| {
                self.breakpoints
                    .iter()
                    .find(|(_, (id, _, _))| id == cdp_id)
                    .map(|(local, _)| *local)
            })
            .collect();

        if let Some(top) = params
            .get("callFrames")
            .and_then(Value::as_array)
            .and_then(|frames| frames.first())
        {
            ctx.source = top
                .pointer("/url")
                .or_else(|| top.pointer("/functionLocation/url"))
                .and_then(Value::as_str)
                .map(|url| url.trim_start_matches("file://").to_string());
            ctx.line = top
                .pointer("/location/lineNumber")
                .and_then(Value::as_u64)
                .map(|l| l + 1);
        }

        self.objects.clear();
        self.last_paused = Some(message);
        ctx
    }
}

impl Driver for CdpDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Cdp
    }

    fn capabilities(&self) -> CapSet {
        self.caps.clone()
    }

    fn launch(&mut self, req: &LaunchRequest) -> Result<StopContext, ToolError> {
        if self.client.is_some() {
            return Err(ToolError::InvalidState(
                "session already owns an inspector".to_string(),
            ));
        }
        let command = self.manifest.resolve_command()?;
        let port = {
            let listener = std::net::TcpListener::bind(("127.0.0.1", 0))
                .map_err(|e| ToolError::Internal(e.to_string()))?;
            listener
                .local_addr()
                .map_err(|e| ToolError::Internal(e.to_string()))?
                .port()
        };
        let argv: Vec<String> = self
            .manifest
            .argv(port)
            .into_iter()
            .map(|arg| arg.replace("{program}", &req.program))
            .chain(req.args.iter().cloned())
            .collect();

        let child = std::process::Command::new(command)
            .args(&argv)
            .envs(&req.env)
            .current_dir(req.cwd.clone().unwrap_or_else(|| ".".to_string()))
            .spawn()
            .map_err(|e| ToolError::Internal(format!("spawn runtime: {e}")))?;
        self.child = Some(child);

        let ws_url = discover_ws_url(port)?;
        let client = CdpClient::connect(&ws_url, Arc::clone(&self.events))?;
        client.command("Runtime.enable", json!({}))?;
        client.command("Debugger.enable", json!({}))?;
        self.client = Some(Arc::clone(&client));
        let pause_client = Arc::clone(&client);
        self.oob.set_pause_hook(move || pause_client.fire("Debugger.pause"));

        if req.stop_on_entry {
            // --inspect-brk pauses before the first statement
            client.command("Runtime.runIfWaitingForDebugger", json!({}))?;
            let cancel = CancelToken::new();
            let paused = client.wait_paused(&cancel)?;
            Ok(self.stop_context_from_paused(paused))
        } else {
            client.command("Runtime.runIfWaitingForDebugger", json!({}))?;
            let mut ctx = StopContext::new(StopReason::Entry);
            ctx.description = Some("running".to_string());
            Ok(ctx)
        }
    }

    fn attach(&mut self, req: &AttachRequest) -> Result<StopContext, ToolError> {
        let port = req.port.ok_or_else(|| {
            ToolError::InvalidParams("cdp attach requires `port`".to_string())
        })?;
        let ws_url = discover_ws_url(port)?;
        let client = CdpClient::connect(&ws_url, Arc::clone(&self.events))?;
        client.command("Runtime.enable", json!({}))?;
        client.command("Debugger.enable", json!({}))?;
        let pause_client = Arc::clone(&client);
        self.oob.set_pause_hook(move || pause_client.fire("Debugger.pause"));
        self.client = Some(client);

        let mut ctx = StopContext::new(StopReason::Entry);
        ctx.description = Some("attached".to_string());
        Ok(ctx)
    }

    fn set_breakpoint(&mut self, spec: BreakpointSpec) -> Result<BreakpointInfo, ToolError> {
        let client = Arc::clone(self.client()?);
        match spec {
            BreakpointSpec::Line { path, line, props } => {
                let url = format!("file://{}", path.to_string_lossy());
                let mut args = json!({"url": url, "lineNumber": line - 1});
                if let Some(condition) = &props.condition {
                    args["condition"] = json!(condition);
                }
                let body = client.command("Debugger.setBreakpointByUrl", args)?;
                let cdp_id = body
                    .get("breakpointId")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let resolved_line = body
                    .get("locations")
                    .and_then(Value::as_array)
                    .and_then(|locations| locations.first())
                    .and_then(|l| l.get("lineNumber"))
                    .and_then(Value::as_u64)
                    .map(|l| l + 1);

                let id = self.next_bp_id;
                self.next_bp_id += 1;
                let verified = resolved_line.is_some();
                self.breakpoints.insert(
                    id,
                    (
                        cdp_id,
                        Some(path.to_string_lossy().to_string()),
                        resolved_line.or(Some(line)),
                    ),
                );
                Ok(BreakpointInfo {
                    id,
                    verified,
                    message: None,
                    source: Some(path.to_string_lossy().to_string()),
                    line: resolved_line.or(Some(line)),
                    function: None,
                    addresses: vec![],
                })
            }
            BreakpointSpec::Exception { filters } => {
                let state = if filters.iter().any(|f| f == "all" || f == "caught") {
                    "all"
                } else if filters.is_empty() {
                    "none"
                } else {
                    "uncaught"
                };
                client.command("Debugger.setPauseOnExceptions", json!({"state": state}))?;
                let id = self.next_bp_id;
                self.next_bp_id += 1;
                Ok(BreakpointInfo {
                    id,
                    verified: true,
                    message: None,
                    source: None,
                    line: None,
                    function: None,
                    addresses: vec![],
                })
            }
            BreakpointSpec::Function { .. } => {
                Err(ToolError::NotSupported("function breakpoints"))
            }
            BreakpointSpec::Instruction { .. } => {
                Err(ToolError::NotSupported("instruction breakpoints"))
            }
        }
    }

    fn remove_breakpoint(&mut self, id: u32) -> Result<(), ToolError> {
        let client = Arc::clone(self.client()?);
        let (cdp_id, _, _) = self
            .breakpoints
            .remove(&id)
            .ok_or_else(|| ToolError::InvalidParams(format!("unknown breakpoint {id}")))?;
        client.command("Debugger.removeBreakpoint", json!({"breakpointId": cdp_id}))?;
        Ok(())
    }

    fn list_breakpoints(&mut self) -> Result<Vec<BreakpointInfo>, ToolError> {
        let mut infos: Vec<BreakpointInfo> = self
            .breakpoints
            .iter()
            .map(|(id, (_, source, line))| BreakpointInfo {
                id: *id,
                verified: true,
                message: None,
                source: source.clone(),
                line: *line,
                function: None,
                addresses: vec![],
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        Ok(infos)
    }

    fn run(
        &mut self,
        action: RunAction,
        _opts: &RunOptions,
        cancel: &CancelToken,
    ) -> Result<StopContext, ToolError> {
        let client = Arc::clone(self.client()?);
        let method = match action {
            RunAction::Continue => "Debugger.resume",
            RunAction::StepInto => "Debugger.stepInto",
            RunAction::StepOver => "Debugger.stepOver",
            RunAction::StepOut => "Debugger.stepOut",
            RunAction::Pause => "Debugger.pause",
            RunAction::Restart | RunAction::Goto => {
                return Err(ToolError::NotSupported("restart/goto on the js runtime"))
            }
            RunAction::ReverseContinue | RunAction::StepBack => {
                return Err(ToolError::NotSupported("reverse execution"))
            }
        };
        client.command(method, json!({}))?;
        let paused = client.wait_paused(cancel)?;
        Ok(self.stop_context_from_paused(paused))
    }

    fn pause(&mut self, _thread_id: Option<i64>) -> Result<(), ToolError> {
        let client = Arc::clone(self.client()?);
        client.command("Debugger.pause", json!({}))?;
        Ok(())
    }

    fn inspect(&mut self, req: &InspectRequest) -> Result<EvaluatedValue, ToolError> {
        let client = Arc::clone(self.client()?);

        if let Some(varref) = req.variable_ref {
            let object_id = self
                .objects
                .get(&varref)
                .cloned()
                .ok_or_else(|| ToolError::InvalidState("unknown variable reference".to_string()))?;
            let body = client.command(
                "Runtime.getProperties",
                json!({"objectId": object_id, "ownProperties": true}),
            )?;
            let properties: Vec<Value> = body
                .get("result")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let children: Vec<VariableDescriptor> = properties
                .iter()
                .filter_map(|prop| {
                    let name = prop.get("name").and_then(Value::as_str)?.to_string();
                    let value = prop.get("value").cloned().unwrap_or(Value::Null);
                    let child_ref = value
                        .get("objectId")
                        .and_then(Value::as_str)
                        .map(|oid| self.alloc_object(oid.to_string()))
                        .unwrap_or(0);
                    Some(VariableDescriptor {
                        name,
                        value: render_remote_object(&value),
                        type_name: value
                            .get("type")
                            .and_then(Value::as_str)
                            .map(ToString::to_string),
                        variables_reference: child_ref,
                        memory_reference: None,
                    })
                })
                .collect();
            return Ok(EvaluatedValue {
                result: format!("{} children", children.len()),
                type_name: None,
                variables_reference: varref,
                memory_reference: None,
                children: Some(children),
            });
        }

        if let Some(scope) = &req.scope {
            let frames = self.call_frames()?;
            let frame_idx = req.frame_id.unwrap_or(0).max(0) as usize;
            let frame = frames
                .get(frame_idx)
                .ok_or_else(|| ToolError::InvalidState("unknown frame id".to_string()))?;
            let object_id = frame
                .get("scopeChain")
                .and_then(Value::as_array)
                .and_then(|scopes| {
                    scopes
                        .iter()
                        .find(|s| {
                            s.get("type").and_then(Value::as_str) == Some(scope.as_str())
                                || scope.eq_ignore_ascii_case("locals")
                                    && s.get("type").and_then(Value::as_str) == Some("local")
                        })
                        .or(scopes.first())
                })
                .and_then(|s| s.pointer("/object/objectId"))
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ToolError::InvalidParams(format!("no scope `{scope}` in this frame"))
                })?
                .to_string();
            let varref = self.alloc_object(object_id);
            return self.inspect(&InspectRequest {
                variable_ref: Some(varref),
                ..Default::default()
            });
        }

        let expression = req.expression.as_deref().ok_or_else(|| {
            ToolError::InvalidParams(
                "inspect requires one of `expression`, `variable_ref`, `scope`".to_string(),
            )
        })?;

        let result = if let Ok(frames) = self.call_frames() {
            let frame_idx = req.frame_id.unwrap_or(0).max(0) as usize;
            let call_frame_id = frames
                .get(frame_idx)
                .and_then(|f| f.get("callFrameId"))
                .and_then(Value::as_str)
                .ok_or_else(|| ToolError::InvalidState("unknown frame id".to_string()))?
                .to_string();
            client.command(
                "Debugger.evaluateOnCallFrame",
                json!({"callFrameId": call_frame_id, "expression": expression}),
            )?
        } else {
            client.command("Runtime.evaluate", json!({"expression": expression}))?
        };

        if let Some(details) = result.get("exceptionDetails") {
            let text = details
                .pointer("/exception/description")
                .and_then(Value::as_str)
                .unwrap_or("evaluation threw");
            return Err(ToolError::InvalidParams(text.to_string()));
        }

        let remote = result.get("result").cloned().unwrap_or(Value::Null);
        let varref = remote
            .get("objectId")
            .and_then(Value::as_str)
            .map(|oid| self.alloc_object(oid.to_string()))
            .unwrap_or(0);
        Ok(EvaluatedValue {
            result: render_remote_object(&remote),
            type_name: remote
                .get("type")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            variables_reference: varref,
            memory_reference: None,
            children: None,
        })
    }

    fn set_variable(
        &mut self,
        name: &str,
        value: &str,
        frame_id: Option<i64>,
    ) -> Result<(String, Option<String>), ToolError> {
        let client = Arc::clone(self.client()?);
        let frames = self.call_frames()?;
        let frame_idx = frame_id.unwrap_or(0).max(0) as usize;
        let frame = frames
            .get(frame_idx)
            .ok_or_else(|| ToolError::InvalidState("unknown frame id".to_string()))?;
        let call_frame_id = frame
            .get("callFrameId")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidState("frame has no id".to_string()))?;
        let scope_count = frame
            .get("scopeChain")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(1);

        let new_value: Value = serde_json::from_str(value).unwrap_or(json!(value));
        for scope_number in 0..scope_count {
            let result = client.command(
                "Debugger.setVariableValue",
                json!({
                    "scopeNumber": scope_number,
                    "variableName": name,
                    "newValue": {"value": new_value},
                    "callFrameId": call_frame_id,
                }),
            );
            if result.is_ok() {
                return Ok((value.to_string(), None));
            }
        }
        Err(ToolError::InvalidParams(format!(
            "variable `{name}` not found in any scope of this frame"
        )))
    }

    fn threads(&mut self) -> Result<Vec<ThreadInfo>, ToolError> {
        self.client()?;
        Ok(vec![ThreadInfo {
            id: 1,
            name: "main".to_string(),
        }])
    }

    fn stacktrace(
        &mut self,
        _thread_id: Option<i64>,
        start_frame: usize,
        levels: usize,
    ) -> Result<Vec<FrameInfo>, ToolError> {
        let frames = self.call_frames()?;
        let boundary = &self.manifest.boundary_markers;
        let levels = if levels == 0 { usize::MAX } else { levels };
        Ok(frames
            .iter()
            .enumerate()
            .skip(start_frame)
            .take(levels)
            .take_while(|(_, frame)| {
                let name = frame
                    .get("functionName")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                !boundary.iter().any(|marker| name.contains(marker.as_str()))
            })
            .map(|(idx, frame)| FrameInfo {
                id: idx as i64,
                name: frame
                    .get("functionName")
                    .and_then(Value::as_str)
                    .filter(|n| !n.is_empty())
                    .unwrap_or("<anonymous>")
                    .to_string(),
                source: frame
                    .get("url")
                    .and_then(Value::as_str)
                    .map(|url| url.trim_start_matches("file://").to_string()),
                line: frame
                    .pointer("/location/lineNumber")
                    .and_then(Value::as_u64)
                    .map(|l| l + 1)
                    .unwrap_or(0),
                column: frame
                    .pointer("/location/columnNumber")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                instruction_pointer_reference: None,
            })
            .collect())
    }

    fn scopes(&mut self, frame_id: i64) -> Result<Vec<ScopeInfo>, ToolError> {
        let frames = self.call_frames()?;
        let frame = frames
            .get(frame_id.max(0) as usize)
            .ok_or_else(|| ToolError::InvalidState("unknown frame id".to_string()))?;
        let chain: Vec<Value> = frame
            .get("scopeChain")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(chain
            .iter()
            .filter_map(|scope| {
                let object_id = scope.pointer("/object/objectId")?.as_str()?.to_string();
                let name = scope
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("scope")
                    .to_string();
                let varref = self.alloc_object(object_id);
                Some(ScopeInfo {
                    name,
                    variables_reference: varref,
                    expensive: scope.get("type").and_then(Value::as_str) == Some("global"),
                })
            })
            .collect())
    }

    fn exception_info(&mut self, _thread_id: Option<i64>) -> Result<ExceptionDetails, ToolError> {
        let paused = self
            .last_paused
            .as_ref()
            .ok_or_else(|| ToolError::InvalidState("the runtime is not paused".to_string()))?;
        let data = paused.pointer("/params/data").cloned().unwrap_or(Value::Null);
        Ok(ExceptionDetails {
            exception_id: data
                .get("className")
                .and_then(Value::as_str)
                .unwrap_or("Error")
                .to_string(),
            description: data
                .get("description")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            break_mode: "unhandled".to_string(),
        })
    }

    fn stop(&mut self, _detach: bool, _terminate_only: bool) -> Result<(), ToolError> {
        if let Some(client) = self.client.take() {
            let _ = client.command("Debugger.disable", json!({}));
        }
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.events.push(SessionEvent::Terminated);
        Ok(())
    }
}

fn cdp_caps() -> CapSet {
    CapSet {
        supports_conditional_breakpoints: true,
        supports_evaluate_for_hovers: true,
        supports_set_variable: true,
        supports_exception_info_request: true,
        ..CapSet::default()
    }
}
