//! Driver backed by an external DAP adapter.

pub mod client;
pub mod manifest;

use crate::driver::native::OutOfBand;
use crate::driver::{
    AttachRequest, BreakpointInfo, BreakpointProps, BreakpointSpec, CancelToken, CapSet,
    CompletionItem, Driver, DriverKind, EvaluatedValue, EventQueue, ExceptionDetails, FrameInfo,
    GotoTarget, InspectRequest, InstructionInfo, LaunchRequest, RunAction, RunOptions, ScopeInfo,
    StepInTarget, StopContext, ThreadInfo, VariableDescriptor, WatchTarget,
};
use crate::protocol::{StopReason, ToolError};
use base64::Engine;
use client::DapClient;
use manifest::{AdapterManifest, Transport};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const LAUNCH_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct SourceBreakpoint {
    id: u32,
    line: u64,
    props: BreakpointProps,
    verified: bool,
}

#[derive(Debug, Clone)]
struct FunctionBreakpoint {
    id: u32,
    name: String,
    props: BreakpointProps,
    verified: bool,
}

pub struct DapDriver {
    manifest: AdapterManifest,
    client: Option<Arc<DapClient>>,
    events: Arc<EventQueue>,
    oob: Arc<OutOfBand>,
    caps: CapSet,
    next_bp_id: u32,
    source_bps: HashMap<PathBuf, Vec<SourceBreakpoint>>,
    function_bps: Vec<FunctionBreakpoint>,
    exception_filters: Option<Vec<String>>,
    last_thread: Option<i64>,
    launch_request: Option<LaunchRequest>,
}

impl DapDriver {
    pub fn new(
        manifest: AdapterManifest,
        events: Arc<EventQueue>,
        oob: Arc<OutOfBand>,
    ) -> Self {
        Self {
            manifest,
            client: None,
            events,
            oob,
            caps: CapSet::default(),
            next_bp_id: 1,
            source_bps: HashMap::new(),
            function_bps: vec![],
            exception_filters: None,
            last_thread: None,
            launch_request: None,
        }
    }

    fn client(&self) -> Result<&Arc<DapClient>, ToolError> {
        self.client
            .as_ref()
            .ok_or_else(|| ToolError::InvalidState("adapter session not launched".to_string()))
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_bp_id;
        self.next_bp_id += 1;
        id
    }

    fn gate(&self, supported: bool, what: &'static str) -> Result<(), ToolError> {
        if supported {
            Ok(())
        } else {
            Err(ToolError::NotSupported(what))
        }
    }

    fn connect(&mut self) -> Result<Arc<DapClient>, ToolError> {
        let command = self.manifest.resolve_command()?;
        let client = match self.manifest.adapter.transport {
            Transport::Tcp => {
                let port = free_port()?;
                let argv = self.manifest.argv(port);
                DapClient::connect_tcp(&command, &argv, port, Arc::clone(&self.events))?
            }
            Transport::Stdio => {
                let argv = self.manifest.argv(0);
                DapClient::connect_stdio(&command, &argv, Arc::clone(&self.events))?
            }
            Transport::Cdp => {
                return Err(ToolError::Internal(
                    "cdp transport is handled by the cdp driver".to_string(),
                ))
            }
        };
        let pause_client = Arc::clone(&client);
        self.oob.set_pause_hook(move || {
            let _ = pause_client.request_fire_and_forget("pause", json!({"threadId": 1}));
        });
        Ok(client)
    }

    fn initialize(&mut self, client: &DapClient) -> Result<(), ToolError> {
        let body = client.request_with(
            "initialize",
            json!({
                "clientID": "gumshoe",
                "clientName": "gumshoe",
                "adapterID": "gumshoe",
                "linesStartAt1": true,
                "columnsStartAt1": true,
                "pathFormat": "path",
                "supportsVariableType": true,
                "supportsMemoryReferences": true,
            }),
            LAUNCH_DEADLINE,
            None,
        )?;
        self.caps = serde_json::from_value(body).unwrap_or_default();
        Ok(())
    }

    fn sync_source_breakpoints(&mut self, path: &Path) -> Result<Vec<BreakpointInfo>, ToolError> {
        let client = Arc::clone(self.client()?);
        let bps = self.source_bps.entry(path.to_path_buf()).or_default();

        let payload: Vec<Value> = bps
            .iter()
            .map(|bp| {
                let mut item = json!({"line": bp.line});
                if let Some(cond) = &bp.props.condition {
                    item["condition"] = json!(cond);
                }
                if let Some(hit) = &bp.props.hit_condition {
                    item["hitCondition"] = json!(hit);
                }
                if let Some(log) = &bp.props.log_message {
                    item["logMessage"] = json!(log);
                }
                item
            })
            .collect();

        let body = client.request(
            "setBreakpoints",
            json!({
                "source": {"path": path.to_string_lossy()},
                "breakpoints": payload,
            }),
        )?;

        let verified: Vec<(bool, Option<u64>)> = body
            .get("breakpoints")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|item| {
                        (
                            item.get("verified").and_then(Value::as_bool).unwrap_or(false),
                            item.get("line").and_then(Value::as_u64),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        for (bp, (ok, line)) in bps.iter_mut().zip(verified.iter()) {
            bp.verified = *ok;
            if let Some(line) = line {
                bp.line = *line;
            }
        }

        Ok(bps
            .iter()
            .map(|bp| BreakpointInfo {
                id: bp.id,
                verified: bp.verified,
                message: None,
                source: Some(path.to_string_lossy().to_string()),
                line: Some(bp.line),
                function: None,
                addresses: vec![],
            })
            .collect())
    }

    fn sync_function_breakpoints(&mut self) -> Result<(), ToolError> {
        self.gate(self.caps.supports_function_breakpoints, "function breakpoints")?;
        let client = Arc::clone(self.client()?);
        let payload: Vec<Value> = self
            .function_bps
            .iter()
            .map(|bp| {
                let mut item = json!({"name": bp.name});
                if let Some(cond) = &bp.props.condition {
                    item["condition"] = json!(cond);
                }
                item
            })
            .collect();
        let body = client.request("setFunctionBreakpoints", json!({"breakpoints": payload}))?;
        if let Some(items) = body.get("breakpoints").and_then(Value::as_array) {
            for (bp, item) in self.function_bps.iter_mut().zip(items) {
                bp.verified = item.get("verified").and_then(Value::as_bool).unwrap_or(false);
            }
        }
        Ok(())
    }

    fn replay_breakpoints(&mut self) -> Result<(), ToolError> {
        let files: Vec<PathBuf> = self.source_bps.keys().cloned().collect();
        for file in files {
            let _ = self.sync_source_breakpoints(&file)?;
        }
        if !self.function_bps.is_empty() {
            self.sync_function_breakpoints()?;
        }
        if let Some(filters) = self.exception_filters.clone() {
            let client = Arc::clone(self.client()?);
            client.request("setExceptionBreakpoints", json!({"filters": filters}))?;
        }
        Ok(())
    }

    fn stop_context_from_event(&mut self, event: Value) -> StopContext {
        let name = event.get("event").and_then(Value::as_str).unwrap_or("");
        let body = event.get("body").cloned().unwrap_or(Value::Null);
        match name {
            "exited" => StopContext::exited(
                body.get("exitCode").and_then(Value::as_i64).unwrap_or(0) as i32,
            ),
            "terminated" => StopContext::exited(0),
            _ => {
                let reason =
                    client::map_stop_reason(body.get("reason").and_then(Value::as_str).unwrap_or(""));
                let mut ctx = StopContext::new(reason);
                ctx.thread_id = body.get("threadId").and_then(Value::as_i64);
                self.last_thread = ctx.thread_id;
                ctx.description = body
                    .get("description")
                    .and_then(Value::as_str)
                    .map(ToString::to_string);
                ctx.hit_breakpoint_ids = body
                    .get("hitBreakpointIds")
                    .and_then(Value::as_array)
                    .map(|ids| {
                        ids.iter()
                            .filter_map(|id| id.as_u64().map(|id| id as u32))
                            .collect()
                    })
                    .unwrap_or_default();
                ctx
            }
        }
    }

    fn thread_for_run(&self, opts: &RunOptions) -> i64 {
        opts.thread_id.or(self.last_thread).unwrap_or(1)
    }

    fn descriptor_from_variable(item: &Value) -> VariableDescriptor {
        VariableDescriptor {
            name: item
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            value: item
                .get("value")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            type_name: item
                .get("type")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            variables_reference: item
                .get("variablesReference")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            memory_reference: item
                .get("memoryReference")
                .and_then(Value::as_str)
                .map(ToString::to_string),
        }
    }
}

impl Driver for DapDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Dap
    }

    fn capabilities(&self) -> CapSet {
        self.caps.clone()
    }

    fn launch(&mut self, req: &LaunchRequest) -> Result<StopContext, ToolError> {
        if self.client.is_some() {
            return Err(ToolError::InvalidState(
                "session already owns an adapter".to_string(),
            ));
        }
        let client = self.connect()?;
        self.initialize(&client)?;

        let mut body = self.manifest.launch_body(&req.program, req.cwd.as_deref())?;
        if req.stop_on_entry {
            body["stopOnEntry"] = json!(true);
        }
        if !req.args.is_empty() {
            body["args"] = json!(req.args);
        }
        if !req.env.is_empty() {
            body["env"] = json!(req.env);
        }
        // many adapters answer `launch` only after configurationDone, so the
        // response is collected at the end of the handshake
        let launch_pending = client.request_deferred("launch", body)?;

        client.wait_initialized(LAUNCH_DEADLINE)?;
        self.client = Some(Arc::clone(&client));
        self.launch_request = Some(req.clone());
        self.replay_breakpoints()?;
        if self.caps.supports_configuration_done_request {
            client.request("configurationDone", json!({}))?;
        }
        client.await_response(launch_pending, LAUNCH_DEADLINE, None)?;

        if req.stop_on_entry {
            let cancel = CancelToken::new();
            let event = client.wait_stop_event(&cancel, Some(LAUNCH_DEADLINE))?;
            Ok(self.stop_context_from_event(event))
        } else {
            let mut ctx = StopContext::new(StopReason::Entry);
            ctx.description = Some("running".to_string());
            Ok(ctx)
        }
    }

    fn attach(&mut self, req: &AttachRequest) -> Result<StopContext, ToolError> {
        if self.client.is_some() {
            return Err(ToolError::InvalidState(
                "session already owns an adapter".to_string(),
            ));
        }
        let client = self.connect()?;
        self.initialize(&client)?;

        let mut body = json!({});
        if let Some(pid) = req.pid {
            body["processId"] = json!(pid);
        }
        if let Some(port) = req.port {
            body["port"] = json!(port);
        }
        let attach_pending = client.request_deferred("attach", body)?;
        client.wait_initialized(LAUNCH_DEADLINE)?;
        self.client = Some(Arc::clone(&client));
        self.replay_breakpoints()?;
        if self.caps.supports_configuration_done_request {
            client.request("configurationDone", json!({}))?;
        }
        client.await_response(attach_pending, LAUNCH_DEADLINE, None)?;

        let mut ctx = StopContext::new(StopReason::Entry);
        ctx.description = Some("attached".to_string());
        Ok(ctx)
    }

    fn set_breakpoint(&mut self, spec: BreakpointSpec) -> Result<BreakpointInfo, ToolError> {
        match spec {
            BreakpointSpec::Line { path, line, props } => {
                if props.condition.is_some() {
                    self.gate(
                        self.caps.supports_conditional_breakpoints,
                        "conditional breakpoints",
                    )?;
                }
                if props.hit_condition.is_some() {
                    self.gate(
                        self.caps.supports_hit_conditional_breakpoints,
                        "hit conditional breakpoints",
                    )?;
                }
                let id = self.next_id();
                self.source_bps
                    .entry(path.clone())
                    .or_default()
                    .push(SourceBreakpoint {
                        id,
                        line,
                        props,
                        verified: false,
                    });
                let infos = self.sync_source_breakpoints(&path)?;
                infos
                    .into_iter()
                    .find(|info| info.id == id)
                    .ok_or_else(|| ToolError::Internal("breakpoint lost during sync".to_string()))
            }
            BreakpointSpec::Function { name, props } => {
                self.gate(
                    self.caps.supports_function_breakpoints,
                    "function breakpoints",
                )?;
                let id = self.next_id();
                self.function_bps.push(FunctionBreakpoint {
                    id,
                    name: name.clone(),
                    props,
                    verified: false,
                });
                self.sync_function_breakpoints()?;
                let verified = self
                    .function_bps
                    .iter()
                    .find(|bp| bp.id == id)
                    .map(|bp| bp.verified)
                    .unwrap_or(false);
                Ok(BreakpointInfo {
                    id,
                    verified,
                    message: None,
                    source: None,
                    line: None,
                    function: Some(name),
                    addresses: vec![],
                })
            }
            BreakpointSpec::Instruction { address, .. } => {
                self.gate(
                    self.caps.supports_instruction_breakpoints,
                    "instruction breakpoints",
                )?;
                let client = Arc::clone(self.client()?);
                let body = client.request(
                    "setInstructionBreakpoints",
                    json!({"breakpoints": [{"instructionReference": format!("{address:#x}")}]}),
                )?;
                let verified = body
                    .get("breakpoints")
                    .and_then(Value::as_array)
                    .and_then(|items| items.first())
                    .and_then(|item| item.get("verified"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let id = self.next_id();
                Ok(BreakpointInfo {
                    id,
                    verified,
                    message: None,
                    source: None,
                    line: None,
                    function: None,
                    addresses: vec![format!("{address:#x}")],
                })
            }
            BreakpointSpec::Exception { filters } => {
                let client = Arc::clone(self.client()?);
                client.request("setExceptionBreakpoints", json!({"filters": filters}))?;
                let id = self.next_id();
                self.exception_filters = Some(filters);
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
        }
    }

    fn remove_breakpoint(&mut self, id: u32) -> Result<(), ToolError> {
        if let Some(path) = self.source_bps.iter().find_map(|(path, bps)| {
            bps.iter().any(|bp| bp.id == id).then(|| path.clone())
        }) {
            self.source_bps
                .get_mut(&path)
                .expect("path found above")
                .retain(|bp| bp.id != id);
            self.sync_source_breakpoints(&path)?;
            return Ok(());
        }
        if self.function_bps.iter().any(|bp| bp.id == id) {
            self.function_bps.retain(|bp| bp.id != id);
            return self.sync_function_breakpoints();
        }
        Err(ToolError::InvalidParams(format!("unknown breakpoint {id}")))
    }

    fn list_breakpoints(&mut self) -> Result<Vec<BreakpointInfo>, ToolError> {
        let mut infos = vec![];
        for (path, bps) in &self.source_bps {
            for bp in bps {
                infos.push(BreakpointInfo {
                    id: bp.id,
                    verified: bp.verified,
                    message: None,
                    source: Some(path.to_string_lossy().to_string()),
                    line: Some(bp.line),
                    function: None,
                    addresses: vec![],
                });
            }
        }
        for bp in &self.function_bps {
            infos.push(BreakpointInfo {
                id: bp.id,
                verified: bp.verified,
                message: None,
                source: None,
                line: None,
                function: Some(bp.name.clone()),
                addresses: vec![],
            });
        }
        infos.sort_by_key(|info| info.id);
        Ok(infos)
    }

    fn breakpoint_locations(
        &mut self,
        path: &Path,
        line: u64,
        end_line: u64,
    ) -> Result<Vec<(u64, u64)>, ToolError> {
        self.gate(
            self.caps.supports_breakpoint_locations_request,
            "breakpoint_locations",
        )?;
        let client = Arc::clone(self.client()?);
        let body = client.request(
            "breakpointLocations",
            json!({
                "source": {"path": path.to_string_lossy()},
                "line": line,
                "endLine": end_line,
            }),
        )?;
        Ok(body
            .get("breakpoints")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        item.get("line")
                            .and_then(Value::as_u64)
                            .map(|l| (l, item.get("column").and_then(Value::as_u64).unwrap_or(0)))
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn run(
        &mut self,
        action: RunAction,
        opts: &RunOptions,
        cancel: &CancelToken,
    ) -> Result<StopContext, ToolError> {
        let client = Arc::clone(self.client()?);
        let thread_id = self.thread_for_run(opts);
        let mut args = json!({"threadId": thread_id});
        if self.caps.supports_stepping_granularity
            && opts.granularity == super::Granularity::Instruction
        {
            args["granularity"] = json!("instruction");
        }

        let command = match action {
            RunAction::Continue => "continue",
            RunAction::StepInto => "stepIn",
            RunAction::StepOver => "next",
            RunAction::StepOut => "stepOut",
            RunAction::Pause => "pause",
            RunAction::Restart => return self.restart(),
            RunAction::Goto => {
                self.gate(self.caps.supports_goto_targets_request, "goto")?;
                let (file, line) = match (&opts.file, opts.line) {
                    (Some(file), Some(line)) => (file.clone(), line),
                    _ => {
                        return Err(ToolError::InvalidParams(
                            "goto requires `file` and `line`".to_string(),
                        ))
                    }
                };
                let targets = client.request(
                    "gotoTargets",
                    json!({"source": {"path": file.to_string_lossy()}, "line": line}),
                )?;
                let target_id = opts
                    .target_id
                    .or_else(|| {
                        targets
                            .get("targets")
                            .and_then(Value::as_array)
                            .and_then(|t| t.first())
                            .and_then(|t| t.get("id"))
                            .and_then(Value::as_i64)
                    })
                    .ok_or_else(|| {
                        ToolError::InvalidParams("no goto target at this line".to_string())
                    })?;
                client.request("goto", json!({"threadId": thread_id, "targetId": target_id}))?;
                let event = client.wait_stop_event(cancel, Some(LAUNCH_DEADLINE))?;
                return Ok(self.stop_context_from_event(event));
            }
            RunAction::ReverseContinue => {
                self.gate(self.caps.supports_step_back, "reverse execution")?;
                "reverseContinue"
            }
            RunAction::StepBack => {
                self.gate(self.caps.supports_step_back, "reverse execution")?;
                "stepBack"
            }
        };

        client.request_with(command, args, Duration::from_secs(60), Some(cancel))?;
        // the run request acknowledges; the actual stop arrives as an event
        let event = client.wait_stop_event(cancel, None)?;
        Ok(self.stop_context_from_event(event))
    }

    fn pause(&mut self, thread_id: Option<i64>) -> Result<(), ToolError> {
        let client = Arc::clone(self.client()?);
        let thread_id = thread_id.or(self.last_thread).unwrap_or(1);
        client.request_fire_and_forget("pause", json!({"threadId": thread_id}))
    }

    fn inspect(&mut self, req: &InspectRequest) -> Result<EvaluatedValue, ToolError> {
        let client = Arc::clone(self.client()?);

        if let Some(varref) = req.variable_ref {
            let body = client.request("variables", json!({"variablesReference": varref}))?;
            let children: Vec<VariableDescriptor> = body
                .get("variables")
                .and_then(Value::as_array)
                .map(|items| items.iter().map(Self::descriptor_from_variable).collect())
                .unwrap_or_default();
            return Ok(EvaluatedValue {
                result: format!("{} children", children.len()),
                type_name: None,
                variables_reference: varref,
                memory_reference: None,
                children: Some(children),
            });
        }

        if let Some(scope) = &req.scope {
            let frame_id = req.frame_id.ok_or_else(|| {
                ToolError::InvalidParams("scope inspection requires `frame_id`".to_string())
            })?;
            let scopes = client.request("scopes", json!({"frameId": frame_id}))?;
            let varref = scopes
                .get("scopes")
                .and_then(Value::as_array)
                .and_then(|items| {
                    items
                        .iter()
                        .find(|item| {
                            item.get("name")
                                .and_then(Value::as_str)
                                .map(|name| name.eq_ignore_ascii_case(scope))
                                .unwrap_or(false)
                        })
                        .or(items.first())
                })
                .and_then(|item| item.get("variablesReference"))
                .and_then(Value::as_i64)
                .ok_or_else(|| {
                    ToolError::InvalidParams(format!("no scope named `{scope}` in this frame"))
                })?;
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
        let mut args = json!({
            "expression": expression,
            "context": req.context.as_deref().unwrap_or("repl"),
        });
        if let Some(frame_id) = req.frame_id {
            args["frameId"] = json!(frame_id);
        }
        let body = client.request("evaluate", args)?;
        Ok(EvaluatedValue {
            result: body
                .get("result")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            type_name: body
                .get("type")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            variables_reference: body
                .get("variablesReference")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            memory_reference: body
                .get("memoryReference")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            children: None,
        })
    }

    fn set_variable(
        &mut self,
        name: &str,
        value: &str,
        frame_id: Option<i64>,
    ) -> Result<(String, Option<String>), ToolError> {
        self.gate(self.caps.supports_set_variable, "set_variable")?;
        let client = Arc::clone(self.client()?);
        let frame_id = frame_id.ok_or_else(|| {
            ToolError::InvalidParams("set_variable requires `frame_id` for adapters".to_string())
        })?;

        let scopes = client.request("scopes", json!({"frameId": frame_id}))?;
        let scope_refs: Vec<i64> = scopes
            .get("scopes")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        item.get("variablesReference").and_then(Value::as_i64)
                    })
                    .collect()
            })
            .unwrap_or_default();

        for varref in scope_refs {
            let vars = client.request("variables", json!({"variablesReference": varref}))?;
            let found = vars
                .get("variables")
                .and_then(Value::as_array)
                .map(|items| {
                    items.iter().any(|item| {
                        item.get("name").and_then(Value::as_str) == Some(name)
                    })
                })
                .unwrap_or(false);
            if found {
                let body = client.request(
                    "setVariable",
                    json!({"variablesReference": varref, "name": name, "value": value}),
                )?;
                return Ok((
                    body.get("value")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    body.get("type")
                        .and_then(Value::as_str)
                        .map(ToString::to_string),
                ));
            }
        }
        Err(ToolError::InvalidParams(format!(
            "variable `{name}` not found in any scope of this frame"
        )))
    }

    fn set_expression(
        &mut self,
        expression: &str,
        value: &str,
        frame_id: Option<i64>,
    ) -> Result<(String, Option<String>), ToolError> {
        self.gate(self.caps.supports_set_expression, "set_expression")?;
        let client = Arc::clone(self.client()?);
        let mut args = json!({"expression": expression, "value": value});
        if let Some(frame_id) = frame_id {
            args["frameId"] = json!(frame_id);
        }
        let body = client.request("setExpression", args)?;
        Ok((
            body.get("value")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            body.get("type")
                .and_then(Value::as_str)
                .map(ToString::to_string),
        ))
    }

    fn threads(&mut self) -> Result<Vec<ThreadInfo>, ToolError> {
        let client = Arc::clone(self.client()?);
        let body = client.request("threads", json!({}))?;
        Ok(body
            .get("threads")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|item| ThreadInfo {
                        id: item.get("id").and_then(Value::as_i64).unwrap_or(0),
                        name: item
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn stacktrace(
        &mut self,
        thread_id: Option<i64>,
        start_frame: usize,
        levels: usize,
    ) -> Result<Vec<FrameInfo>, ToolError> {
        let client = Arc::clone(self.client()?);
        let thread_id = thread_id.or(self.last_thread).unwrap_or(1);
        let body = client.request(
            "stackTrace",
            json!({
                "threadId": thread_id,
                "startFrame": start_frame,
                "levels": levels,
            }),
        )?;

        let boundary = &self.manifest.boundary_markers;
        Ok(body
            .get("stackFrames")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .take_while(|item| {
                        let name = item.get("name").and_then(Value::as_str).unwrap_or("");
                        !boundary.iter().any(|marker| name.contains(marker.as_str()))
                    })
                    .map(|item| FrameInfo {
                        id: item.get("id").and_then(Value::as_i64).unwrap_or(0),
                        name: item
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                        source: item
                            .get("source")
                            .and_then(|s| s.get("path"))
                            .and_then(Value::as_str)
                            .map(ToString::to_string),
                        line: item.get("line").and_then(Value::as_u64).unwrap_or(0),
                        column: item.get("column").and_then(Value::as_u64).unwrap_or(0),
                        instruction_pointer_reference: item
                            .get("instructionPointerReference")
                            .and_then(Value::as_str)
                            .map(ToString::to_string),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn scopes(&mut self, frame_id: i64) -> Result<Vec<ScopeInfo>, ToolError> {
        let client = Arc::clone(self.client()?);
        let body = client.request("scopes", json!({"frameId": frame_id}))?;
        Ok(body
            .get("scopes")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|item| ScopeInfo {
                        name: item
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                        variables_reference: item
                            .get("variablesReference")
                            .and_then(Value::as_i64)
                            .unwrap_or(0),
                        expensive: item
                            .get("expensive")
                            .and_then(Value::as_bool)
                            .unwrap_or(false),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn memory_read(&mut self, address: u64, size: usize) -> Result<Vec<u8>, ToolError> {
        self.gate(self.caps.supports_read_memory_request, "memory read")?;
        let client = Arc::clone(self.client()?);
        let body = client.request(
            "readMemory",
            json!({"memoryReference": format!("{address:#x}"), "count": size}),
        )?;
        let data = body.get("data").and_then(Value::as_str).unwrap_or("");
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| ToolError::Internal(format!("bad memory payload: {e}")))
    }

    fn memory_write(&mut self, address: u64, data: &[u8]) -> Result<(), ToolError> {
        self.gate(self.caps.supports_write_memory_request, "memory write")?;
        let client = Arc::clone(self.client()?);
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        client.request(
            "writeMemory",
            json!({"memoryReference": format!("{address:#x}"), "data": encoded}),
        )?;
        Ok(())
    }

    fn disassemble(
        &mut self,
        address: u64,
        count: usize,
        resolve_symbols: bool,
    ) -> Result<Vec<InstructionInfo>, ToolError> {
        self.gate(self.caps.supports_disassemble_request, "disassemble")?;
        let client = Arc::clone(self.client()?);
        let body = client.request(
            "disassemble",
            json!({
                "memoryReference": format!("{address:#x}"),
                "instructionCount": count,
                "resolveSymbols": resolve_symbols,
            }),
        )?;
        Ok(body
            .get("instructions")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|item| InstructionInfo {
                        address: item
                            .get("address")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                        instruction: item
                            .get("instruction")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                        instruction_bytes: item
                            .get("instructionBytes")
                            .and_then(Value::as_str)
                            .map(ToString::to_string),
                        symbol: item
                            .get("symbol")
                            .and_then(Value::as_str)
                            .map(ToString::to_string),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn modules(&mut self) -> Result<Vec<Value>, ToolError> {
        self.gate(self.caps.supports_modules_request, "modules")?;
        let client = Arc::clone(self.client()?);
        let body = client.request("modules", json!({}))?;
        Ok(body
            .get("modules")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    fn loaded_sources(&mut self) -> Result<Vec<Value>, ToolError> {
        self.gate(self.caps.supports_loaded_sources_request, "loaded_sources")?;
        let client = Arc::clone(self.client()?);
        let body = client.request("loadedSources", json!({}))?;
        Ok(body
            .get("sources")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    fn source(&mut self, source_reference: i64, path: Option<&str>) -> Result<String, ToolError> {
        let client = Arc::clone(self.client()?);
        let mut args = json!({"sourceReference": source_reference});
        if let Some(path) = path {
            args["source"] = json!({"path": path, "sourceReference": source_reference});
        }
        let body = client.request("source", args)?;
        Ok(body
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string())
    }

    fn completions(
        &mut self,
        text: &str,
        column: u64,
        frame_id: Option<i64>,
    ) -> Result<Vec<CompletionItem>, ToolError> {
        self.gate(self.caps.supports_completions_request, "completions")?;
        let client = Arc::clone(self.client()?);
        let mut args = json!({"text": text, "column": column});
        if let Some(frame_id) = frame_id {
            args["frameId"] = json!(frame_id);
        }
        let body = client.request("completions", args)?;
        Ok(body
            .get("targets")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|item| CompletionItem {
                        label: item
                            .get("label")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                        kind: item
                            .get("type")
                            .and_then(Value::as_str)
                            .map(ToString::to_string),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn exception_info(&mut self, thread_id: Option<i64>) -> Result<ExceptionDetails, ToolError> {
        self.gate(self.caps.supports_exception_info_request, "exception_info")?;
        let client = Arc::clone(self.client()?);
        let thread_id = thread_id.or(self.last_thread).unwrap_or(1);
        let body = client.request("exceptionInfo", json!({"threadId": thread_id}))?;
        Ok(ExceptionDetails {
            exception_id: body
                .get("exceptionId")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            description: body
                .get("description")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            break_mode: body
                .get("breakMode")
                .and_then(Value::as_str)
                .unwrap_or("unhandled")
                .to_string(),
        })
    }

    fn goto_targets(&mut self, path: &Path, line: u64) -> Result<Vec<GotoTarget>, ToolError> {
        self.gate(self.caps.supports_goto_targets_request, "goto_targets")?;
        let client = Arc::clone(self.client()?);
        let body = client.request(
            "gotoTargets",
            json!({"source": {"path": path.to_string_lossy()}, "line": line}),
        )?;
        Ok(body
            .get("targets")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|item| GotoTarget {
                        id: item.get("id").and_then(Value::as_i64).unwrap_or(0),
                        label: item
                            .get("label")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                        line: item.get("line").and_then(Value::as_u64).unwrap_or(line),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn step_in_targets(&mut self, frame_id: i64) -> Result<Vec<StepInTarget>, ToolError> {
        self.gate(self.caps.supports_step_in_targets_request, "step_in_targets")?;
        let client = Arc::clone(self.client()?);
        let body = client.request("stepInTargets", json!({"frameId": frame_id}))?;
        Ok(body
            .get("targets")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|item| StepInTarget {
                        id: item.get("id").and_then(Value::as_i64).unwrap_or(0),
                        label: item
                            .get("label")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn restart_frame(&mut self, frame_id: i64) -> Result<(), ToolError> {
        self.gate(self.caps.supports_restart_frame, "restart_frame")?;
        let client = Arc::clone(self.client()?);
        client.request("restartFrame", json!({"frameId": frame_id}))?;
        Ok(())
    }

    fn watchpoint(
        &mut self,
        target: WatchTarget,
        access: &str,
        frame_id: Option<i64>,
    ) -> Result<BreakpointInfo, ToolError> {
        self.gate(self.caps.supports_data_breakpoints, "data breakpoints")?;
        let client = Arc::clone(self.client()?);

        let mut args = match target {
            WatchTarget::Variable(name) => json!({"name": name}),
            WatchTarget::Address(addr) => json!({"name": format!("{addr:#x}"), "asAddress": true}),
        };
        if let Some(frame_id) = frame_id {
            args["frameId"] = json!(frame_id);
        }
        let info = client.request("dataBreakpointInfo", args)?;
        let data_id = info
            .get("dataId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ToolError::InvalidParams(
                    "target is not watchable by this adapter".to_string(),
                )
            })?
            .to_string();

        let body = client.request(
            "setDataBreakpoints",
            json!({"breakpoints": [{"dataId": data_id, "accessType": access}]}),
        )?;
        let verified = body
            .get("breakpoints")
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .and_then(|item| item.get("verified"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let id = self.next_id();
        Ok(BreakpointInfo {
            id,
            verified,
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

    fn cancel(&mut self, request_id: Option<i64>, progress_id: Option<String>) -> Result<(), ToolError> {
        if !self.caps.supports_cancel_request {
            return Ok(());
        }
        let client = Arc::clone(self.client()?);
        let mut args = json!({});
        if let Some(request_id) = request_id {
            args["requestId"] = json!(request_id);
        }
        if let Some(progress_id) = progress_id {
            args["progressId"] = json!(progress_id);
        }
        client.request_fire_and_forget("cancel", args)
    }

    fn terminate_threads(&mut self, thread_ids: &[i64]) -> Result<(), ToolError> {
        self.gate(
            self.caps.supports_terminate_threads_request,
            "terminate_threads",
        )?;
        let client = Arc::clone(self.client()?);
        client.request("terminateThreads", json!({"threadIds": thread_ids}))?;
        Ok(())
    }

    fn restart(&mut self) -> Result<StopContext, ToolError> {
        self.gate(self.caps.supports_restart_request, "restart")?;
        let client = Arc::clone(self.client()?);
        let body = match &self.launch_request {
            Some(req) => self.manifest.launch_body(&req.program, req.cwd.as_deref())?,
            None => json!({}),
        };
        client.request("restart", json!({"arguments": body}))?;
        let mut ctx = StopContext::new(StopReason::Entry);
        ctx.description = Some("restarted".to_string());
        Ok(ctx)
    }

    fn stop(&mut self, detach: bool, terminate_only: bool) -> Result<(), ToolError> {
        if let Some(client) = self.client.take() {
            if terminate_only {
                let _ = client.request_with(
                    "terminate",
                    json!({}),
                    Duration::from_secs(5),
                    None,
                );
            } else {
                let _ = client.request_with(
                    "disconnect",
                    json!({"terminateDebuggee": !detach}),
                    Duration::from_secs(5),
                    None,
                );
            }
            client.shutdown();
        }
        self.events.push(crate::protocol::SessionEvent::Terminated);
        Ok(())
    }
}

fn free_port() -> Result<u16, ToolError> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))
        .map_err(|e| ToolError::Internal(format!("no free port: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| ToolError::Internal(e.to_string()))?
        .port();
    Ok(port)
}

#[cfg(test)]
mod test {
    use super::*;

    fn bare_driver() -> DapDriver {
        let manifest = AdapterManifest::builtin("python").unwrap();
        DapDriver::new(
            manifest,
            Arc::new(EventQueue::new()),
            Arc::new(OutOfBand::default()),
        )
    }

    /// A DAP-backed session must answer `NotSupported` (-32001) for the
    /// native-only surface instead of guessing.
    #[test]
    fn test_unadvertised_capabilities_short_circuit() {
        let mut driver = bare_driver();

        let memory = driver.memory_read(0x1000, 8).unwrap_err();
        assert_eq!(memory.code(), -32001);
        let disasm = driver.disassemble(0x1000, 4, false).unwrap_err();
        assert_eq!(disasm.code(), -32001);
        let registers = driver.registers(None).unwrap_err();
        assert_eq!(registers.code(), -32001);
        let write_register = driver.write_register("rip", 0, None).unwrap_err();
        assert_eq!(write_register.code(), -32001);
        let find_symbol = driver.find_symbol("main").unwrap_err();
        assert_eq!(find_symbol.code(), -32001);
        let var_loc = driver.variable_location("x", None).unwrap_err();
        assert_eq!(var_loc.code(), -32001);
        let instruction_bp = driver
            .set_breakpoint(BreakpointSpec::Instruction {
                address: 0x1000,
                props: BreakpointProps::default(),
            })
            .unwrap_err();
        assert_eq!(instruction_bp.code(), -32001);
    }

    #[test]
    fn test_run_requires_launch() {
        let mut driver = bare_driver();
        let err = driver
            .run(
                RunAction::Continue,
                &RunOptions::default(),
                &CancelToken::new(),
            )
            .unwrap_err();
        assert_eq!(err.code(), -32003);
    }
}
