//! The stable, backend-neutral tool surface.
//!
//! One handler per tool over a closed enum; adding a tool without a handler
//! arm is a compile error. Validation happens here (serde into typed param
//! structs), capability gating happens here, and every failure is classified
//! into the uniform error kinds before it reaches the wire.

use crate::driver::{
    BreakpointProps, BreakpointSpec, CancelToken, Driver, InspectRequest, RunAction, RunOptions,
    WatchTarget,
};
use crate::protocol::ToolError;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::str::FromStr;
use strum_macros::{Display, EnumString};

/// Every tool the daemon understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Tool {
    Launch,
    Attach,
    Sessions,
    Restart,
    Stop,
    Breakpoint,
    InstructionBreakpoint,
    BreakpointLocations,
    Watchpoint,
    Run,
    Inspect,
    SetVariable,
    SetExpression,
    Threads,
    Stacktrace,
    Scopes,
    Modules,
    LoadedSources,
    Source,
    Completions,
    ExceptionInfo,
    GotoTargets,
    StepInTargets,
    RestartFrame,
    Capabilities,
    Memory,
    Disassemble,
    Registers,
    WriteRegister,
    FindSymbol,
    VariableLocation,
    PollEvents,
    Cancel,
    TerminateThreads,
}

impl Tool {
    pub fn parse(method: &str) -> Result<Tool, ToolError> {
        Tool::from_str(method).map_err(|_| ToolError::MethodNotFound(method.to_string()))
    }

    /// Tools the daemon answers without a session round-trip.
    pub fn is_daemon_level(self) -> bool {
        matches!(
            self,
            Tool::Launch
                | Tool::Attach
                | Tool::Sessions
                | Tool::PollEvents
                | Tool::Cancel
                | Tool::Stop
        )
    }
}

fn params<T: for<'de> Deserialize<'de>>(value: &Value) -> Result<T, ToolError> {
    serde_json::from_value(value.clone()).map_err(|e| ToolError::InvalidParams(e.to_string()))
}

fn parse_address(raw: &Value) -> Result<u64, ToolError> {
    match raw {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| ToolError::InvalidParams("address must be unsigned".to_string())),
        Value::String(s) => {
            let s = s.trim();
            let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                u64::from_str_radix(hex, 16)
            } else {
                s.parse()
            };
            parsed.map_err(|_| ToolError::InvalidParams(format!("bad address `{s}`")))
        }
        _ => Err(ToolError::InvalidParams(
            "address must be a number or hex string".to_string(),
        )),
    }
}

fn ok<T: serde::Serialize>(value: T) -> Result<Value, ToolError> {
    serde_json::to_value(value).map_err(|e| ToolError::Internal(e.to_string()))
}

#[derive(Deserialize)]
struct BreakpointParams {
    action: String,
    #[serde(default)]
    file: Option<PathBuf>,
    #[serde(default)]
    line: Option<u64>,
    #[serde(default)]
    function: Option<String>,
    #[serde(default)]
    filters: Option<Vec<String>>,
    #[serde(default)]
    id: Option<u32>,
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    hit_condition: Option<String>,
    #[serde(default)]
    log_message: Option<String>,
}

#[derive(Deserialize)]
struct RunParams {
    action: RunAction,
    #[serde(flatten)]
    opts: RunOptions,
}

#[derive(Deserialize)]
struct MemoryParams {
    action: String,
    address: Value,
    #[serde(default)]
    size: Option<usize>,
    #[serde(default)]
    offset: Option<i64>,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Deserialize)]
struct WatchpointParams {
    #[serde(default)]
    variable: Option<String>,
    #[serde(default)]
    address: Option<Value>,
    access_type: String,
    #[serde(default)]
    frame_id: Option<i64>,
}

/// Dispatch a session-scoped tool call onto a driver.
///
/// Capability-gated operations are checked against the driver's static
/// capability set before anything is issued to the backend.
pub fn dispatch_session(
    driver: &mut dyn Driver,
    tool: Tool,
    raw: &Value,
    cancel: &CancelToken,
) -> Result<Value, ToolError> {
    let caps = driver.capabilities();
    let gate = |supported: bool, what: &'static str| -> Result<(), ToolError> {
        if supported {
            Ok(())
        } else {
            Err(ToolError::NotSupported(what))
        }
    };

    match tool {
        Tool::Launch => {
            let req = params(raw)?;
            let ctx = driver.launch(&req)?;
            ok(ctx)
        }
        Tool::Attach => {
            let req = params(raw)?;
            let ctx = driver.attach(&req)?;
            ok(ctx)
        }
        Tool::Restart => {
            gate(caps.supports_restart_request, "restart")?;
            driver.restart()?;
            Ok(json!({"restarted": true}))
        }
        Tool::Stop => {
            #[derive(Deserialize)]
            struct StopParams {
                #[serde(default)]
                detach: bool,
                #[serde(default)]
                terminate_only: bool,
            }
            let p: StopParams = params(raw)?;
            driver.stop(p.detach, p.terminate_only)?;
            Ok(json!({}))
        }
        Tool::Breakpoint => {
            let p: BreakpointParams = params(raw)?;
            let props = BreakpointProps {
                condition: p.condition,
                hit_condition: p.hit_condition,
                log_message: p.log_message,
            };
            match p.action.as_str() {
                "set" => {
                    let (file, line) = match (p.file, p.line) {
                        (Some(file), Some(line)) => (file, line),
                        _ => {
                            return Err(ToolError::InvalidParams(
                                "breakpoint set requires `file` and `line`".to_string(),
                            ))
                        }
                    };
                    let info = driver.set_breakpoint(BreakpointSpec::Line {
                        path: file,
                        line,
                        props,
                    })?;
                    ok(info)
                }
                "set_function" => {
                    gate(caps.supports_function_breakpoints, "function breakpoints")?;
                    let name = p.function.ok_or_else(|| {
                        ToolError::InvalidParams(
                            "breakpoint set_function requires `function`".to_string(),
                        )
                    })?;
                    let info =
                        driver.set_breakpoint(BreakpointSpec::Function { name, props })?;
                    ok(info)
                }
                "set_exception" => {
                    let filters = p.filters.unwrap_or_default();
                    let info = driver.set_breakpoint(BreakpointSpec::Exception { filters })?;
                    ok(info)
                }
                "remove" => {
                    let id = p.id.ok_or_else(|| {
                        ToolError::InvalidParams("breakpoint remove requires `id`".to_string())
                    })?;
                    driver.remove_breakpoint(id)?;
                    Ok(json!({"removed": id}))
                }
                "list" => {
                    let list = driver.list_breakpoints()?;
                    Ok(json!({"breakpoints": list}))
                }
                other => Err(ToolError::InvalidParams(format!(
                    "unknown breakpoint action `{other}`"
                ))),
            }
        }
        Tool::InstructionBreakpoint => {
            gate(
                caps.supports_instruction_breakpoints,
                "instruction breakpoints",
            )?;
            #[derive(Deserialize)]
            struct P {
                instruction_reference: Value,
                #[serde(default)]
                offset: Option<i64>,
                #[serde(default)]
                condition: Option<String>,
                #[serde(default)]
                hit_condition: Option<String>,
            }
            let p: P = params(raw)?;
            let base = parse_address(&p.instruction_reference)?;
            let address = (base as i64 + p.offset.unwrap_or(0)) as u64;
            let info = driver.set_breakpoint(BreakpointSpec::Instruction {
                address,
                props: BreakpointProps {
                    condition: p.condition,
                    hit_condition: p.hit_condition,
                    log_message: None,
                },
            })?;
            ok(info)
        }
        Tool::BreakpointLocations => {
            gate(
                caps.supports_breakpoint_locations_request,
                "breakpoint_locations",
            )?;
            #[derive(Deserialize)]
            struct P {
                source: PathBuf,
                line: u64,
                #[serde(default)]
                end_line: Option<u64>,
            }
            let p: P = params(raw)?;
            let locations =
                driver.breakpoint_locations(&p.source, p.line, p.end_line.unwrap_or(p.line))?;
            Ok(json!({
                "breakpoints": locations
                    .into_iter()
                    .map(|(line, column)| json!({"line": line, "column": column}))
                    .collect::<Vec<_>>(),
            }))
        }
        Tool::Watchpoint => {
            gate(caps.supports_data_breakpoints, "data breakpoints")?;
            let p: WatchpointParams = params(raw)?;
            let info = match (&p.variable, &p.address) {
                (Some(variable), _) => {
                    driver.watchpoint(WatchTarget::Variable(variable), &p.access_type, p.frame_id)?
                }
                (None, Some(address)) => {
                    let addr = parse_address(address)?;
                    driver.watchpoint(WatchTarget::Address(addr), &p.access_type, p.frame_id)?
                }
                (None, None) => {
                    return Err(ToolError::InvalidParams(
                        "watchpoint requires `variable` or `address`".to_string(),
                    ))
                }
            };
            ok(info)
        }
        Tool::Run => {
            let p: RunParams = params(raw)?;
            let ctx = driver.run(p.action, &p.opts, cancel)?;
            ok(ctx)
        }
        Tool::Inspect => {
            let req: InspectRequest = params(raw)?;
            let value = driver.inspect(&req)?;
            ok(value)
        }
        Tool::SetVariable => {
            gate(caps.supports_set_variable, "set_variable")?;
            #[derive(Deserialize)]
            struct P {
                variable: String,
                value: String,
                #[serde(default)]
                frame_id: Option<i64>,
            }
            let p: P = params(raw)?;
            let (value, type_name) = driver.set_variable(&p.variable, &p.value, p.frame_id)?;
            Ok(json!({"value": value, "type": type_name}))
        }
        Tool::SetExpression => {
            gate(caps.supports_set_expression, "set_expression")?;
            #[derive(Deserialize)]
            struct P {
                expression: String,
                value: String,
                #[serde(default)]
                frame_id: Option<i64>,
            }
            let p: P = params(raw)?;
            let (value, type_name) = driver.set_expression(&p.expression, &p.value, p.frame_id)?;
            Ok(json!({"value": value, "type": type_name}))
        }
        Tool::Threads => {
            let threads = driver.threads()?;
            Ok(json!({"threads": threads}))
        }
        Tool::Stacktrace => {
            #[derive(Deserialize)]
            struct P {
                #[serde(default)]
                thread_id: Option<i64>,
                #[serde(default)]
                start_frame: Option<usize>,
                #[serde(default)]
                levels: Option<usize>,
            }
            let p: P = params(raw)?;
            let frames = driver.stacktrace(
                p.thread_id,
                p.start_frame.unwrap_or(0),
                p.levels.unwrap_or(0),
            )?;
            Ok(json!({"stackFrames": frames}))
        }
        Tool::Scopes => {
            #[derive(Deserialize)]
            struct P {
                frame_id: i64,
            }
            let p: P = params(raw)?;
            let scopes = driver.scopes(p.frame_id)?;
            Ok(json!({"scopes": scopes}))
        }
        Tool::Modules => {
            gate(caps.supports_modules_request, "modules")?;
            let modules = driver.modules()?;
            Ok(json!({"modules": modules}))
        }
        Tool::LoadedSources => {
            gate(caps.supports_loaded_sources_request, "loaded_sources")?;
            let sources = driver.loaded_sources()?;
            Ok(json!({"sources": sources}))
        }
        Tool::Source => {
            #[derive(Deserialize)]
            struct P {
                #[serde(default)]
                source_reference: Option<i64>,
                #[serde(default)]
                path: Option<String>,
            }
            let p: P = params(raw)?;
            let content = driver.source(p.source_reference.unwrap_or(0), p.path.as_deref())?;
            Ok(json!({"content": content}))
        }
        Tool::Completions => {
            gate(caps.supports_completions_request, "completions")?;
            #[derive(Deserialize)]
            struct P {
                text: String,
                column: u64,
                #[serde(default)]
                frame_id: Option<i64>,
            }
            let p: P = params(raw)?;
            let targets = driver.completions(&p.text, p.column, p.frame_id)?;
            Ok(json!({"targets": targets}))
        }
        Tool::ExceptionInfo => {
            gate(caps.supports_exception_info_request, "exception_info")?;
            #[derive(Deserialize)]
            struct P {
                #[serde(default)]
                thread_id: Option<i64>,
            }
            let p: P = params(raw)?;
            let details = driver.exception_info(p.thread_id)?;
            ok(details)
        }
        Tool::GotoTargets => {
            gate(caps.supports_goto_targets_request, "goto_targets")?;
            #[derive(Deserialize)]
            struct P {
                file: PathBuf,
                line: u64,
            }
            let p: P = params(raw)?;
            let targets = driver.goto_targets(&p.file, p.line)?;
            Ok(json!({"targets": targets}))
        }
        Tool::StepInTargets => {
            gate(caps.supports_step_in_targets_request, "step_in_targets")?;
            #[derive(Deserialize)]
            struct P {
                frame_id: i64,
            }
            let p: P = params(raw)?;
            let targets = driver.step_in_targets(p.frame_id)?;
            Ok(json!({"targets": targets}))
        }
        Tool::RestartFrame => {
            gate(caps.supports_restart_frame, "restart_frame")?;
            #[derive(Deserialize)]
            struct P {
                frame_id: i64,
            }
            let p: P = params(raw)?;
            driver.restart_frame(p.frame_id)?;
            Ok(json!({"restarted": true}))
        }
        Tool::Capabilities => ok(caps),
        Tool::Memory => {
            let p: MemoryParams = params(raw)?;
            let base = parse_address(&p.address)?;
            let address = (base as i64 + p.offset.unwrap_or(0)) as u64;
            match p.action.as_str() {
                "read" => {
                    gate(caps.supports_read_memory_request, "memory read")?;
                    let size = p.size.unwrap_or(64);
                    let bytes = driver.memory_read(address, size)?;
                    Ok(json!({
                        "address": format!("{address:#x}"),
                        "data": base64::engine::general_purpose::STANDARD.encode(&bytes),
                        "count": bytes.len(),
                    }))
                }
                "write" => {
                    gate(caps.supports_write_memory_request, "memory write")?;
                    let data = p.data.ok_or_else(|| {
                        ToolError::InvalidParams("memory write requires `data`".to_string())
                    })?;
                    let bytes = base64::engine::general_purpose::STANDARD
                        .decode(&data)
                        .map_err(|e| ToolError::InvalidParams(format!("bad base64 data: {e}")))?;
                    driver.memory_write(address, &bytes)?;
                    Ok(json!({"written": bytes.len()}))
                }
                other => Err(ToolError::InvalidParams(format!(
                    "unknown memory action `{other}`"
                ))),
            }
        }
        Tool::Disassemble => {
            gate(caps.supports_disassemble_request, "disassemble")?;
            #[derive(Deserialize)]
            struct P {
                address: Value,
                #[serde(default)]
                instruction_count: Option<usize>,
                #[serde(default)]
                resolve_symbols: Option<bool>,
            }
            let p: P = params(raw)?;
            let address = parse_address(&p.address)?;
            let instructions = driver.disassemble(
                address,
                p.instruction_count.unwrap_or(16),
                p.resolve_symbols.unwrap_or(false),
            )?;
            Ok(json!({"instructions": instructions}))
        }
        Tool::Registers => {
            #[derive(Deserialize)]
            struct P {
                #[serde(default)]
                thread_id: Option<i64>,
            }
            let p: P = params(raw)?;
            let registers = driver.registers(p.thread_id)?;
            Ok(json!({"registers": registers}))
        }
        Tool::WriteRegister => {
            #[derive(Deserialize)]
            struct P {
                name: String,
                value: Value,
                #[serde(default)]
                thread_id: Option<i64>,
            }
            let p: P = params(raw)?;
            let value = parse_address(&p.value)?;
            driver.write_register(&p.name, value, p.thread_id)?;
            Ok(json!({"written": p.name}))
        }
        Tool::FindSymbol => {
            #[derive(Deserialize)]
            struct P {
                name: String,
            }
            let p: P = params(raw)?;
            let symbols = driver.find_symbol(&p.name)?;
            Ok(json!({"symbols": symbols}))
        }
        Tool::VariableLocation => {
            #[derive(Deserialize)]
            struct P {
                name: String,
                #[serde(default)]
                frame_id: Option<i64>,
            }
            let p: P = params(raw)?;
            let location = driver.variable_location(&p.name, p.frame_id)?;
            ok(location)
        }
        Tool::TerminateThreads => {
            gate(
                caps.supports_terminate_threads_request,
                "terminate_threads",
            )?;
            #[derive(Deserialize)]
            struct P {
                thread_ids: Vec<i64>,
            }
            let p: P = params(raw)?;
            driver.terminate_threads(&p.thread_ids)?;
            Ok(json!({"terminated": true}))
        }
        Tool::Cancel => {
            #[derive(Deserialize)]
            struct P {
                #[serde(default)]
                request_id: Option<i64>,
                #[serde(default)]
                progress_id: Option<String>,
            }
            let p: P = params(raw)?;
            driver.cancel(p.request_id, p.progress_id)?;
            Ok(json!({"cancelled": true}))
        }
        // resolved by the daemon before a session is involved
        Tool::Sessions | Tool::PollEvents => Err(ToolError::Internal(format!(
            "tool `{tool}` must be handled by the daemon"
        ))),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_tool_names_round_trip() {
        for (name, tool) in [
            ("launch", Tool::Launch),
            ("breakpoint", Tool::Breakpoint),
            ("instruction_breakpoint", Tool::InstructionBreakpoint),
            ("breakpoint_locations", Tool::BreakpointLocations),
            ("poll_events", Tool::PollEvents),
            ("set_variable", Tool::SetVariable),
            ("write_register", Tool::WriteRegister),
            ("terminate_threads", Tool::TerminateThreads),
        ] {
            assert_eq!(Tool::parse(name).unwrap(), tool);
            assert_eq!(tool.to_string(), name);
        }
        assert!(matches!(
            Tool::parse("no_such_tool"),
            Err(ToolError::MethodNotFound(_))
        ));
    }

    #[test]
    fn test_parse_address_forms() {
        assert_eq!(parse_address(&json!(4096)).unwrap(), 4096);
        assert_eq!(parse_address(&json!("0x1000")).unwrap(), 4096);
        assert_eq!(parse_address(&json!("4096")).unwrap(), 4096);
        assert!(parse_address(&json!(true)).is_err());
        assert!(parse_address(&json!("zzz")).is_err());
    }
}
