//! Adapter driver tests against the in-crate mock DAP adapter (stdio
//! transport), plus capability short-circuit checks.

use gumshoe::driver::dap::manifest::AdapterManifest;
use gumshoe::driver::dap::DapDriver;
use gumshoe::driver::native::OutOfBand;
use gumshoe::driver::{CancelToken, Driver, EventQueue, LaunchRequest, RunAction, RunOptions};
use gumshoe::protocol::SessionEvent;
use gumshoe::tools::{self, Tool};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

const MOCKDAP: &str = env!("CARGO_BIN_EXE_mockdap");

fn mock_manifest() -> AdapterManifest {
    AdapterManifest::parse(&format!(
        r#"
type = "dap"

[adapter]
command = "{MOCKDAP}"
transport = "stdio"

[launch_args]
request = "launch"
program = "{{program}}"
"#
    ))
    .expect("mock manifest parses")
}

fn launch_request(stop_on_entry: bool) -> LaunchRequest {
    LaunchRequest {
        program: "/tmp/app.py".to_string(),
        args: vec![],
        env: HashMap::new(),
        cwd: None,
        stop_on_entry,
        language: Some("python".to_string()),
    }
}

#[test]
fn test_handshake_breakpoints_and_run() {
    let events = Arc::new(EventQueue::new());
    let mut driver = DapDriver::new(
        mock_manifest(),
        Arc::clone(&events),
        Arc::new(OutOfBand::default()),
    );

    let stop = driver.launch(&launch_request(true)).expect("launch");
    assert_eq!(stop.thread_id, Some(1));

    // adapter capabilities arrived during initialize
    let caps = driver.capabilities();
    assert!(caps.supports_configuration_done_request);
    assert!(caps.supports_set_variable);
    assert!(!caps.supports_read_memory_request);

    let bp = driver
        .set_breakpoint(gumshoe::driver::BreakpointSpec::Line {
            path: "/tmp/app.py".into(),
            line: 3,
            props: Default::default(),
        })
        .expect("set breakpoint");
    assert!(bp.verified);
    assert_eq!(bp.line, Some(3));

    let stop = driver
        .run(RunAction::Continue, &RunOptions::default(), &CancelToken::new())
        .expect("continue");
    assert_eq!(stop.hit_breakpoint_ids, vec![1]);

    let threads = driver.threads().expect("threads");
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].name, "MainThread");

    let frames = driver.stacktrace(Some(1), 0, 0).expect("stacktrace");
    assert_eq!(frames[0].name, "main");
    assert_eq!(frames[0].source.as_deref(), Some("/tmp/app.py"));

    let value = driver
        .inspect(&gumshoe::driver::InspectRequest {
            expression: Some("x + 1".to_string()),
            ..Default::default()
        })
        .expect("evaluate");
    assert_eq!(value.result, "eval(x + 1)");

    // second continue runs to completion
    let stop = driver
        .run(RunAction::Continue, &RunOptions::default(), &CancelToken::new())
        .expect("continue to exit");
    assert_eq!(stop.exit_code, Some(0));

    driver.stop(false, false).expect("stop");

    let drained = events.drain();
    let outputs: Vec<&SessionEvent> = drained
        .iter()
        .filter(|ev| matches!(ev, SessionEvent::Output { .. }))
        .collect();
    assert!(!outputs.is_empty(), "adapter output must be captured");
    assert!(drained
        .iter()
        .any(|ev| matches!(ev, SessionEvent::Terminated)));
}

#[test]
fn test_scope_inspection_through_adapter() {
    let mut driver = DapDriver::new(
        mock_manifest(),
        Arc::new(EventQueue::new()),
        Arc::new(OutOfBand::default()),
    );
    driver.launch(&launch_request(true)).expect("launch");

    let scopes = driver.scopes(100).expect("scopes");
    assert_eq!(scopes[0].name, "Locals");

    let value = driver
        .inspect(&gumshoe::driver::InspectRequest {
            variable_ref: Some(scopes[0].variables_reference),
            ..Default::default()
        })
        .expect("variables");
    let children = value.children.expect("children");
    assert_eq!(children[0].name, "answer");
    assert_eq!(children[0].value, "42");

    driver.stop(false, false).expect("stop");
}

/// Scenario: the native-only surface answers `NotSupported` (-32001) on a
/// DAP session, routed through the tool dispatcher like a real request.
#[test]
fn test_native_only_tools_not_supported_over_dap() {
    let mut driver = DapDriver::new(
        mock_manifest(),
        Arc::new(EventQueue::new()),
        Arc::new(OutOfBand::default()),
    );
    driver.launch(&launch_request(true)).expect("launch");

    let cancel = CancelToken::new();
    for (tool, params) in [
        (Tool::Registers, json!({})),
        (Tool::WriteRegister, json!({"name": "rip", "value": 0})),
        (Tool::Memory, json!({"action": "read", "address": "0x1000", "size": 8})),
        (Tool::Disassemble, json!({"address": "0x1000"})),
        (Tool::InstructionBreakpoint, json!({"instruction_reference": "0x1000"})),
        (Tool::FindSymbol, json!({"name": "main"})),
        (Tool::VariableLocation, json!({"name": "x"})),
    ] {
        let err = tools::dispatch_session(&mut driver, tool, &params, &cancel)
            .expect_err("tool must be rejected");
        assert_eq!(err.code(), -32001, "tool {tool} must map to NotSupported");
    }

    driver.stop(false, false).expect("stop");
}
