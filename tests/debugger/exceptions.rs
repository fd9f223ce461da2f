use crate::common::TestSession;
use crate::{CALC_APP, SEGV_APP};
use gumshoe::tools::Tool;
use serde_json::json;
use serial_test::serial;

#[test]
#[serial]
fn test_null_deref_stops_with_exception() {
    let mut session = TestSession::launch(SEGV_APP);
    session.call_ok(
        Tool::Breakpoint,
        json!({"action": "set_exception", "filters": ["uncaught"]}),
    );

    let stop = session.cont();
    let reason = stop["reason"].as_str().expect("stop reason");
    assert!(
        reason == "exception" || reason == "signal",
        "unexpected reason: {stop}"
    );
    assert_eq!(stop["description"].as_str(), Some("SIGSEGV"));

    let info = session.call_ok(Tool::ExceptionInfo, json!({}));
    assert_eq!(info["exceptionId"].as_str(), Some("SIGSEGV"));
    assert!(!info["breakMode"].as_str().expect("break mode").is_empty());

    session.stop();
}

#[test]
#[serial]
fn test_watchpoint_on_variable() {
    let mut session = TestSession::launch(CALC_APP);
    session.set_line_breakpoint("calc.rs", 15);
    session.cont();

    // watch writes to `total`; the loop body mutates it
    let wp = session.call_ok(
        Tool::Watchpoint,
        json!({"variable": "total", "access_type": "write"}),
    );
    assert_eq!(wp["verified"], true);
    let wp_id = wp["id"].as_u64().expect("watchpoint id");

    let stop = session.cont();
    assert_eq!(stop["reason"].as_str(), Some("watchpoint"), "{stop}");

    session.call_ok(Tool::Breakpoint, json!({"action": "remove", "id": wp_id}));
    session.stop();
}

#[test]
#[serial]
fn test_watchpoint_registers_are_released_on_remove() {
    let mut session = TestSession::launch(CALC_APP);
    session.set_line_breakpoint("calc.rs", 15);
    session.cont();

    // four hardware slots; a fifth distinct watch must be refused
    let mut ids = vec![];
    for (variable, expect_ok) in [
        ("total", true),
        ("i", true),
        ("x", true),
        ("y", true),
        ("sum", false),
    ] {
        let result = session.call(
            Tool::Watchpoint,
            json!({"variable": variable, "access_type": "write"}),
        );
        match (expect_ok, result) {
            (true, Ok(wp)) => ids.push(wp["id"].as_u64().expect("id")),
            (false, Err(e)) => assert_eq!(e.code(), -32001),
            (expect_ok, result) => panic!("watch {variable}: expected ok={expect_ok}, got {result:?}"),
        }
    }

    // freeing one slot makes room again
    session.call_ok(
        Tool::Breakpoint,
        json!({"action": "remove", "id": ids[0]}),
    );
    session.call_ok(
        Tool::Watchpoint,
        json!({"variable": "sum", "access_type": "write"}),
    );

    session.stop();
}
