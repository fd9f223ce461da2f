//! Wire-level tests: a daemon on a temp socket, driven by the thin client.

use gumshoe::client::DaemonClient;
use serde_json::json;
use std::path::PathBuf;
use std::time::{Duration, Instant};

fn start_daemon(tag: &str) -> DaemonClient {
    let socket = PathBuf::from(format!(
        "/tmp/gumshoe-test-{}-{tag}.sock",
        std::process::id()
    ));
    let _ = std::fs::remove_file(&socket);

    let server_socket = socket.clone();
    std::thread::spawn(move || {
        let _ = gumshoe::daemon::serve(&server_socket);
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match DaemonClient::connect(&socket) {
            Ok(client) => return client,
            Err(e) if Instant::now() >= deadline => panic!("daemon did not come up: {e}"),
            Err(_) => std::thread::sleep(Duration::from_millis(20)),
        }
    }
}

#[test]
fn test_sessions_starts_empty() {
    let mut client = start_daemon("empty");
    let result = client.call("sessions", json!({})).expect("sessions");
    assert_eq!(result["sessions"].as_array().expect("list").len(), 0);
}

#[test]
fn test_unknown_tool_is_method_not_found() {
    let mut client = start_daemon("unknown");
    let err = client.call("frobnicate", json!({})).expect_err("must fail");
    assert!(err.to_string().contains("-32601"), "{err}");
}

#[test]
fn test_unknown_session_is_reported() {
    let mut client = start_daemon("nosession");
    let err = client
        .call("threads", json!({"session_id": "session-999"}))
        .expect_err("must fail");
    assert!(err.to_string().contains("-32002"), "{err}");
}

#[test]
fn test_missing_session_id_is_invalid_params() {
    let mut client = start_daemon("params");
    let err = client.call("threads", json!({})).expect_err("must fail");
    assert!(err.to_string().contains("-32602"), "{err}");
}

#[test]
fn test_poll_events_is_idempotent_when_idle() {
    let mut client = start_daemon("poll");
    let first = client.call("poll_events", json!({})).expect("poll");
    let second = client.call("poll_events", json!({})).expect("poll");
    assert_eq!(first["events"].as_array().expect("events").len(), 0);
    assert_eq!(second["events"].as_array().expect("events").len(), 0);
}

#[test]
fn test_cancel_unknown_request() {
    let mut client = start_daemon("cancel");
    let result = client
        .call("cancel", json!({"request_id": 424242}))
        .expect("cancel");
    assert_eq!(result["cancelled"], false);
}

#[test]
fn test_requests_are_answered_in_order() {
    let mut client = start_daemon("order");
    for _ in 0..10 {
        let result = client.call("sessions", json!({})).expect("sessions");
        assert!(result["sessions"].is_array());
    }
}

/// A debuggee that exits on its own is a terminal condition: the session
/// must deliver its output, exit code and a final `terminated` event, and
/// then disappear from the registry without an explicit `stop`.
#[test]
fn test_unattended_exit_is_reaped() {
    const PRINTER_APP: &str = env!("CARGO_BIN_EXE_printer");
    let mut client = start_daemon("reap");

    let launched = client
        .call(
            "launch",
            json!({"program": PRINTER_APP, "stop_on_entry": false}),
        )
        .expect("launch");
    assert_eq!(launched["status"].as_str(), Some("exited"));
    let session_id = launched["session_id"].as_str().expect("session id");

    // the finished session stays visible until its events are collected
    let sessions = client.call("sessions", json!({})).expect("sessions");
    assert_eq!(sessions["sessions"].as_array().expect("list").len(), 1);

    let polled = client
        .call("poll_events", json!({"session_id": session_id}))
        .expect("poll");
    let events: Vec<&str> = polled["events"]
        .as_array()
        .expect("events")
        .iter()
        .filter_map(|e| e.pointer("/event/event").and_then(|v| v.as_str()))
        .collect();
    assert!(events.contains(&"output"), "{events:?}");
    assert!(events.contains(&"exited"), "{events:?}");
    assert!(events.contains(&"terminated"), "{events:?}");
    let exited_pos = events.iter().position(|e| *e == "exited").expect("exited");
    let terminated_pos = events
        .iter()
        .position(|e| *e == "terminated")
        .expect("terminated");
    assert!(exited_pos < terminated_pos, "{events:?}");

    // once drained, the registry sweep drops the session
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let sessions = client.call("sessions", json!({})).expect("sessions");
        if sessions["sessions"].as_array().expect("list").is_empty() {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "finished session was never reaped: {sessions}"
        );
        std::thread::sleep(Duration::from_millis(50));
    }
}
