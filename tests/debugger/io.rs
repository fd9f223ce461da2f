use crate::common::{assert_stop_reason, TestSession};
use crate::{PRINTER_APP, SLEEPER_APP, THREADS_APP};
use gumshoe::protocol::SessionEvent;
use gumshoe::tools::Tool;
use serde_json::json;
use serial_test::serial;

#[test]
#[serial]
fn test_output_is_drained_before_exit() {
    let mut session = TestSession::launch_with(
        PRINTER_APP,
        json!({"program": PRINTER_APP, "stop_on_entry": false}),
    );

    // the launch ran the program to completion; everything it printed must
    // already be in the event queue, before the exited event
    let events = session.events();
    let output: String = events
        .iter()
        .filter_map(|ev| match ev {
            SessionEvent::Output { output, .. } => Some(output.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(output.matches("compute = 230").count(), 1, "{output:?}");

    let exited_pos = events
        .iter()
        .position(|ev| matches!(ev, SessionEvent::Exited { .. }))
        .expect("exited event");
    let last_output_pos = events
        .iter()
        .rposition(|ev| matches!(ev, SessionEvent::Output { .. }))
        .expect("output event");
    assert!(last_output_pos < exited_pos, "output after exited: {events:?}");

    // poll is idempotent-empty: a second drain returns nothing
    assert!(session.events().is_empty());

    session.stop();
}

#[test]
#[serial]
fn test_pause_interrupts_running_debuggee() {
    let mut session = TestSession::launch(SLEEPER_APP);

    // continue in the background; the sleeper never stops on its own
    let pauser = {
        let oob = session.session_oob();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(300));
            oob.pause();
        })
    };

    let stop = session.cont();
    assert_stop_reason(&stop, "pause");
    pauser.join().expect("pauser thread");

    session.stop();
}

#[test]
#[serial]
fn test_threads_enumeration() {
    let mut session = TestSession::launch(THREADS_APP);
    session.set_fn_breakpoint("threads::work");

    let stop = session.cont();
    assert_stop_reason(&stop, "breakpoint");

    let threads = session.call_ok(Tool::Threads, json!({}));
    let threads = threads["threads"].as_array().expect("threads").clone();
    assert!(threads.len() >= 2, "expected worker threads, got {threads:?}");

    session.stop();
}

#[test]
#[serial]
fn test_restart_reruns_program() {
    let mut session = TestSession::launch(PRINTER_APP);
    session.set_fn_breakpoint("printer::add");

    let stop = session.cont();
    assert_stop_reason(&stop, "breakpoint");

    let stop = session.call_ok(Tool::Run, json!({"action": "restart"}));
    assert_stop_reason(&stop, "entry");

    // the reinstalled breakpoint fires again after restart
    let stop = session.cont();
    assert_stop_reason(&stop, "breakpoint");

    session.stop();
}
