use crate::common::{assert_stop_reason, TestSession};
use crate::CALC_APP;
use serde_json::json;
use serial_test::serial;

#[test]
#[serial]
fn test_step_over_call_lands_on_next_line() {
    let mut session = TestSession::launch(CALC_APP);
    session.set_line_breakpoint("calc.rs", 20);
    let stop = session.cont();
    assert_stop_reason(&stop, "breakpoint");
    assert_eq!(stop["line"].as_u64(), Some(20));

    // line 20 calls add(); step_over must not stop inside the callee
    let stop = session.step("step_over");
    assert_stop_reason(&stop, "step");
    assert_eq!(stop["line"].as_u64(), Some(21));
    assert_eq!(session.inspect("sum"), "30");

    session.stop();
}

#[test]
#[serial]
fn test_step_into_enters_callee() {
    let mut session = TestSession::launch(CALC_APP);
    session.set_line_breakpoint("calc.rs", 20);
    session.cont();

    let stop = session.step("step_into");
    assert_stop_reason(&stop, "step");
    assert_eq!(stop["line"].as_u64(), Some(2));
    assert_eq!(session.inspect("a"), "10");
    assert_eq!(session.inspect("b"), "20");

    session.stop();
}

#[test]
#[serial]
fn test_step_out_returns_to_caller() {
    let mut session = TestSession::launch(CALC_APP);
    session.set_fn_breakpoint("calc::compute");
    session.cont();

    let stop = session.step("step_out");
    assert_stop_reason(&stop, "step");
    // back on the call line in main
    assert_eq!(stop["line"].as_u64(), Some(21));

    session.stop();
}

#[test]
#[serial]
fn test_instruction_granularity_step() {
    let mut session = TestSession::launch(CALC_APP);
    session.set_fn_breakpoint("calc::add");
    let stop = session.cont();
    let pc_before = stop["pc"].as_str().expect("stop pc").to_string();

    let stop = session.call_ok(
        gumshoe::tools::Tool::Run,
        json!({"action": "step_into", "granularity": "instruction"}),
    );
    assert_stop_reason(&stop, "step");
    let pc_after = stop["pc"].as_str().expect("stop pc");
    assert_ne!(pc_before, pc_after);

    session.stop();
}

#[test]
#[serial]
fn test_goto_skips_loop() {
    let mut session = TestSession::launch(CALC_APP);
    session.set_line_breakpoint("calc.rs", 13);
    session.cont();

    let stop = session.call_ok(
        gumshoe::tools::Tool::Run,
        json!({"action": "goto", "file": "calc.rs", "line": 18}),
    );
    assert_stop_reason(&stop, "goto");
    assert_eq!(stop["line"].as_u64(), Some(18));

    session.stop();
}
