//! A minimal stdio DAP adapter used by the integration tests: enough of the
//! protocol to exercise the adapter driver's handshake, breakpoint sync and
//! run loop without a real language runtime behind it.

use gumshoe::protocol::transport;
use serde_json::{json, Value};
use std::io::{stdin, stdout, BufReader, Write};

struct Server<W: Write> {
    writer: W,
    seq: i64,
}

impl<W: Write> Server<W> {
    fn next_seq(&mut self) -> i64 {
        self.seq += 1;
        self.seq
    }

    fn respond(&mut self, request: &Value, body: Value) {
        let seq = self.next_seq();
        let message = json!({
            "seq": seq,
            "type": "response",
            "request_seq": request.get("seq").and_then(Value::as_i64).unwrap_or(0),
            "success": true,
            "command": request.get("command").and_then(Value::as_str).unwrap_or(""),
            "body": body,
        });
        let _ = transport::write_message(&mut self.writer, &message);
    }

    fn event(&mut self, name: &str, body: Value) {
        let seq = self.next_seq();
        let message = json!({
            "seq": seq,
            "type": "event",
            "event": name,
            "body": body,
        });
        let _ = transport::write_message(&mut self.writer, &message);
    }
}

fn main() {
    let mut reader = BufReader::new(stdin());
    let mut server = Server {
        writer: stdout(),
        seq: 0,
    };

    let mut stop_on_entry = false;
    let mut continues = 0;

    while let Ok(Some(request)) = transport::read_message::<_, Value>(&mut reader) {
        let command = request.get("command").and_then(Value::as_str).unwrap_or("");
        match command {
            "initialize" => {
                server.respond(
                    &request,
                    json!({
                        "supportsConfigurationDoneRequest": true,
                        "supportsSetVariable": true,
                        "supportsConditionalBreakpoints": true,
                        "supportsExceptionInfoRequest": true,
                    }),
                );
            }
            "launch" => {
                stop_on_entry = request
                    .pointer("/arguments/stopOnEntry")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                server.respond(&request, Value::Null);
                server.event("initialized", json!({}));
            }
            "setBreakpoints" => {
                let count = request
                    .pointer("/arguments/breakpoints")
                    .and_then(Value::as_array)
                    .map(Vec::len)
                    .unwrap_or(0);
                let lines: Vec<Value> = request
                    .pointer("/arguments/breakpoints")
                    .and_then(Value::as_array)
                    .map(|bps| {
                        bps.iter()
                            .map(|bp| {
                                json!({
                                    "verified": true,
                                    "line": bp.get("line").cloned().unwrap_or(Value::Null),
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                assert_eq!(lines.len(), count);
                server.respond(&request, json!({"breakpoints": lines}));
            }
            "setExceptionBreakpoints" => {
                server.respond(&request, Value::Null);
            }
            "configurationDone" => {
                server.respond(&request, Value::Null);
                if stop_on_entry {
                    server.event(
                        "stopped",
                        json!({"reason": "entry", "threadId": 1, "allThreadsStopped": true}),
                    );
                }
            }
            "threads" => {
                server.respond(
                    &request,
                    json!({"threads": [{"id": 1, "name": "MainThread"}]}),
                );
            }
            "stackTrace" => {
                server.respond(
                    &request,
                    json!({"stackFrames": [{
                        "id": 100,
                        "name": "main",
                        "line": 3,
                        "column": 1,
                        "source": {"path": "/tmp/app.py"},
                    }]}),
                );
            }
            "scopes" => {
                server.respond(
                    &request,
                    json!({"scopes": [{"name": "Locals", "variablesReference": 7, "expensive": false}]}),
                );
            }
            "variables" => {
                server.respond(
                    &request,
                    json!({"variables": [{"name": "answer", "value": "42", "type": "int", "variablesReference": 0}]}),
                );
            }
            "evaluate" => {
                let expression = request
                    .pointer("/arguments/expression")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                server.respond(
                    &request,
                    json!({"result": format!("eval({expression})"), "variablesReference": 0}),
                );
            }
            "continue" => {
                continues += 1;
                server.respond(&request, json!({"allThreadsContinued": true}));
                if continues == 1 {
                    server.event(
                        "stopped",
                        json!({"reason": "breakpoint", "threadId": 1, "hitBreakpointIds": [1]}),
                    );
                } else {
                    server.event("output", json!({"category": "stdout", "output": "done\n"}));
                    server.event("exited", json!({"exitCode": 0}));
                    server.event("terminated", json!({}));
                }
            }
            "next" | "stepIn" | "stepOut" => {
                server.respond(&request, Value::Null);
                server.event("stopped", json!({"reason": "step", "threadId": 1}));
            }
            "pause" => {
                server.respond(&request, Value::Null);
                server.event("stopped", json!({"reason": "pause", "threadId": 1}));
            }
            "disconnect" | "terminate" => {
                server.respond(&request, Value::Null);
                server.event("terminated", json!({}));
                break;
            }
            _ => {
                let seq = server.next_seq();
                let message = json!({
                    "seq": seq,
                    "type": "response",
                    "request_seq": request.get("seq").and_then(Value::as_i64).unwrap_or(0),
                    "success": false,
                    "command": command,
                    "message": format!("unsupported request `{command}`"),
                });
                let _ = transport::write_message(&mut server.writer, &message);
            }
        }
    }
}
