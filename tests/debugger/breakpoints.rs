use crate::common::{assert_stop_reason, TestSession};
use crate::CALC_APP;
use gumshoe::tools::Tool;
use serde_json::json;
use serial_test::serial;

#[test]
#[serial]
fn test_function_breakpoint_hit() {
    let mut session = TestSession::launch(CALC_APP);

    let bp = session.set_fn_breakpoint("calc::add");
    assert_eq!(bp["verified"], true);

    let stop = session.cont();
    assert_stop_reason(&stop, "breakpoint");
    assert!(stop["hitBreakpointIds"]
        .as_array()
        .map(|ids| !ids.is_empty())
        .unwrap_or(false));

    session.stop();
}

#[test]
#[serial]
fn test_line_breakpoint_set_list_remove() {
    let mut session = TestSession::launch(CALC_APP);

    let bp = session.set_line_breakpoint("calc.rs", 20);
    let id = bp["id"].as_u64().expect("breakpoint id");
    assert_eq!(bp["verified"], true);

    let list = session.call_ok(Tool::Breakpoint, json!({"action": "list"}));
    let ids: Vec<u64> = list["breakpoints"]
        .as_array()
        .expect("breakpoint list")
        .iter()
        .filter_map(|bp| bp["id"].as_u64())
        .collect();
    assert!(ids.contains(&id));

    session.call_ok(Tool::Breakpoint, json!({"action": "remove", "id": id}));
    let list = session.call_ok(Tool::Breakpoint, json!({"action": "list"}));
    assert!(list["breakpoints"].as_array().expect("list").is_empty());

    // with no breakpoints left the program runs to completion
    let stop = session.cont();
    assert_stop_reason(&stop, "exit");

    session.stop();
}

#[test]
#[serial]
fn test_breakpoint_in_loop_fires_once_per_iteration() {
    let mut session = TestSession::launch(CALC_APP);
    session.set_line_breakpoint("calc.rs", 15);

    // (i, total) observed at each loop iteration
    let expected = [(1, 0), (2, 1), (3, 3), (4, 6), (5, 10)];
    for (i, total) in expected {
        let stop = session.cont();
        assert_stop_reason(&stop, "breakpoint");
        assert_eq!(session.inspect("i"), i.to_string());
        assert_eq!(session.inspect("total"), total.to_string());
    }

    session.stop();
}

#[test]
#[serial]
fn test_conditional_breakpoint() {
    let mut session = TestSession::launch(CALC_APP);
    session.call_ok(
        Tool::Breakpoint,
        json!({"action": "set", "file": "calc.rs", "line": 15, "condition": "i - 3"}),
    );

    // the condition is false only when i == 3, so stops skip that iteration
    let stop = session.cont();
    assert_stop_reason(&stop, "breakpoint");
    assert_eq!(session.inspect("i"), "1");

    session.cont();
    assert_eq!(session.inspect("i"), "2");

    session.cont();
    assert_eq!(session.inspect("i"), "4");

    session.stop();
}

#[test]
#[serial]
fn test_breakpoint_locations() {
    let mut session = TestSession::launch(CALC_APP);
    let locations = session.call_ok(
        Tool::BreakpointLocations,
        json!({"source": "calc.rs", "line": 13, "end_line": 16}),
    );
    let lines: Vec<u64> = locations["breakpoints"]
        .as_array()
        .expect("locations")
        .iter()
        .filter_map(|l| l["line"].as_u64())
        .collect();
    assert!(lines.contains(&15), "expected line 15 in {lines:?}");

    session.stop();
}

#[test]
#[serial]
fn test_stale_frame_id_rejected() {
    let mut session = TestSession::launch(CALC_APP);
    session.set_fn_breakpoint("calc::add");
    session.cont();

    let frames = session.call_ok(Tool::Stacktrace, json!({}));
    let frame_id = frames["stackFrames"][0]["id"].as_i64().expect("frame id");

    // frame ids die on resume
    session.cont();
    let err = session
        .call(
            Tool::Inspect,
            json!({"expression": "a", "frame_id": frame_id}),
        )
        .expect_err("stale frame id must be rejected");
    assert_eq!(err.code(), -32003);

    session.stop();
}
