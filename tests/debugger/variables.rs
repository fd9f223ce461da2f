use crate::common::{assert_stop_reason, TestSession};
use crate::CALC_APP;
use gumshoe::tools::Tool;
use serde_json::json;
use serial_test::serial;

/// Continue until `add` is reached with the given argument values.
fn continue_until_add(session: &TestSession, a: i64, b: i64) {
    loop {
        let stop = session.cont();
        assert_stop_reason(&stop, "breakpoint");
        if session.inspect("a") == a.to_string() && session.inspect("b") == b.to_string() {
            return;
        }
    }
}

#[test]
#[serial]
fn test_inspect_arguments_and_arithmetic() {
    let mut session = TestSession::launch(CALC_APP);
    session.set_fn_breakpoint("calc::add");
    continue_until_add(&session, 10, 20);

    assert_eq!(session.inspect("a"), "10");
    assert_eq!(session.inspect("b"), "20");
    assert_eq!(session.inspect("a + b"), "30");
    assert_eq!(session.inspect("a * b - 100"), "100");
    assert_eq!(session.inspect("(a + b) / 4"), "7");

    session.stop();
}

#[test]
#[serial]
fn test_divide_by_zero_is_reported() {
    let mut session = TestSession::launch(CALC_APP);
    session.set_fn_breakpoint("calc::add");
    session.cont();

    let err = session
        .call(Tool::Inspect, json!({"expression": "a / 0"}))
        .expect_err("division by zero must fail");
    assert_eq!(err.code(), -32602);

    session.stop();
}

#[test]
#[serial]
fn test_frame_relative_inspection() {
    let mut session = TestSession::launch(CALC_APP);
    session.set_fn_breakpoint("calc::add");
    // add(10, 20) called from compute, itself called from main
    continue_until_add(&session, 10, 20);
    let stop = session.cont(); // next add is inside compute
    assert_stop_reason(&stop, "breakpoint");
    assert_eq!(session.inspect("a"), "10");

    let frames = session.call_ok(Tool::Stacktrace, json!({}));
    let frames = frames["stackFrames"].as_array().expect("frames").clone();
    assert!(frames.len() >= 3, "expected add/compute/main, got {frames:?}");
    assert!(frames[0]["name"].as_str().unwrap_or("").contains("add"));
    assert!(frames[1]["name"].as_str().unwrap_or("").contains("compute"));

    let main_frame = frames
        .iter()
        .find(|f| f["name"].as_str().unwrap_or("").contains("main"))
        .expect("main frame");
    let main_id = main_frame["id"].as_i64().expect("frame id");

    // `total` lives in main, not in the innermost frame; its value must be
    // read against main's frame base
    let value = session.call_ok(
        Tool::Inspect,
        json!({"expression": "total", "frame_id": main_id}),
    );
    assert_eq!(value["result"].as_str(), Some("15"));

    session.stop();
}

#[test]
#[serial]
fn test_scopes_and_children() {
    let mut session = TestSession::launch(CALC_APP);
    session.set_fn_breakpoint("calc::add");
    session.cont();

    let frames = session.call_ok(Tool::Stacktrace, json!({}));
    let frame_id = frames["stackFrames"][0]["id"].as_i64().expect("frame id");

    let scopes = session.call_ok(Tool::Scopes, json!({"frame_id": frame_id}));
    let scopes = scopes["scopes"].as_array().expect("scopes").clone();
    assert_eq!(scopes.len(), 2);

    let args_ref = scopes[0]["variablesReference"].as_i64().expect("varref");
    let value = session.call_ok(Tool::Inspect, json!({"variable_ref": args_ref}));
    let names: Vec<&str> = value["children"]
        .as_array()
        .expect("children")
        .iter()
        .filter_map(|c| c["name"].as_str())
        .collect();
    assert!(names.contains(&"a") && names.contains(&"b"), "{names:?}");

    session.stop();
}

#[test]
#[serial]
fn test_set_variable() {
    let mut session = TestSession::launch(CALC_APP);
    session.set_fn_breakpoint("calc::add");
    session.cont();

    let result = session.call_ok(
        Tool::SetVariable,
        json!({"variable": "a", "value": "42"}),
    );
    assert_eq!(result["value"].as_str(), Some("42"));
    assert_eq!(session.inspect("a"), "42");

    session.stop();
}

#[test]
#[serial]
fn test_variable_location_and_symbols() {
    let mut session = TestSession::launch(CALC_APP);
    session.set_fn_breakpoint("calc::add");
    session.cont();

    let location = session.call_ok(Tool::VariableLocation, json!({"name": "a"}));
    assert!(location["address"].as_str().unwrap_or("").starts_with("0x"));

    let symbols = session.call_ok(Tool::FindSymbol, json!({"name": "add"}));
    assert!(!symbols["symbols"].as_array().expect("symbols").is_empty());

    session.stop();
}

#[test]
#[serial]
fn test_registers_and_disassembly() {
    let mut session = TestSession::launch(CALC_APP);
    session.set_fn_breakpoint("calc::add");
    let stop = session.cont();
    let pc = stop["pc"].as_str().expect("pc").to_string();

    let registers = session.call_ok(Tool::Registers, json!({}));
    let rip = registers["registers"]
        .as_array()
        .expect("registers")
        .iter()
        .find(|r| r["name"] == "rip")
        .expect("rip present");
    assert_eq!(rip["value"].as_str(), Some(pc.as_str()));

    let listing = session.call_ok(
        Tool::Disassemble,
        json!({"address": pc, "instruction_count": 4}),
    );
    assert_eq!(
        listing["instructions"].as_array().expect("instructions").len(),
        4
    );

    session.stop();
}
