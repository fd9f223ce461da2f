//! One live debuggee: a worker thread owning the driver, a command queue and
//! the event queue.

use crate::driver::cdp::CdpDriver;
use crate::driver::dap::manifest::{AdapterManifest, ManifestKind, Transport};
use crate::driver::dap::DapDriver;
use crate::driver::native::{NativeDriver, OutOfBand};
use crate::driver::{CancelToken, Driver, DriverKind, EventQueue};
use crate::protocol::{SessionEvent, ToolError};
use crate::tools::{self, Tool};
use log::{error, info};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

pub struct SessionCommand {
    pub tool: Tool,
    pub params: Value,
    pub cancel: Arc<CancelToken>,
    pub reply: mpsc::SyncSender<Result<Value, ToolError>>,
}

/// Client-visible session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Created,
    Stopped,
    Running,
    Exited,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Running => "running",
            SessionStatus::Exited => "exited",
            SessionStatus::Terminated => "terminated",
        }
    }
}

pub struct Session {
    pub id: String,
    pub kind: DriverKind,
    pub events: Arc<EventQueue>,
    pub oob: Arc<OutOfBand>,
    pub status: Mutex<SessionStatus>,
    cmd_tx: mpsc::Sender<SessionCommand>,
    current_cancel: Mutex<Option<Arc<CancelToken>>>,
    dead: AtomicBool,
    shutdown_requested: AtomicBool,
}

/// Pick the driver kind for a launch/attach request.
pub fn select_kind(language: Option<&str>) -> Result<(DriverKind, Option<AdapterManifest>), ToolError> {
    let Some(language) = language else {
        return Ok((DriverKind::Native, None));
    };
    match language {
        "native" | "c" | "cpp" | "c++" | "rust" | "zig" => Ok((DriverKind::Native, None)),
        other => {
            let manifest = AdapterManifest::for_language(other)?;
            let kind = match (manifest.r#type, manifest.adapter.transport) {
                (ManifestKind::Native, _) => DriverKind::Native,
                (_, Transport::Cdp) => DriverKind::Cdp,
                _ => DriverKind::Dap,
            };
            Ok((kind, Some(manifest)))
        }
    }
}

impl Session {
    /// Create the session and start its worker thread.
    pub fn spawn(
        id: String,
        kind: DriverKind,
        manifest: Option<AdapterManifest>,
    ) -> Arc<Session> {
        let events = Arc::new(EventQueue::new());
        let oob = Arc::new(OutOfBand::default());
        let (cmd_tx, cmd_rx) = mpsc::channel::<SessionCommand>();

        let session = Arc::new(Session {
            id: id.clone(),
            kind,
            events: Arc::clone(&events),
            oob: Arc::clone(&oob),
            status: Mutex::new(SessionStatus::Created),
            cmd_tx,
            current_cancel: Mutex::new(None),
            dead: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
        });

        let worker_session = Arc::clone(&session);
        std::thread::Builder::new()
            .name(format!("{id}-worker"))
            .spawn(move || {
                let mut driver: Box<dyn Driver> = match kind {
                    DriverKind::Native => {
                        Box::new(NativeDriver::new(Arc::clone(&events), Arc::clone(&oob)))
                    }
                    DriverKind::Dap => {
                        let manifest = manifest.expect("dap session requires a manifest");
                        Box::new(DapDriver::new(manifest, Arc::clone(&events), Arc::clone(&oob)))
                    }
                    DriverKind::Cdp => {
                        let manifest = manifest.expect("cdp session requires a manifest");
                        Box::new(CdpDriver::new(
                            manifest,
                            Arc::clone(&events),
                            Arc::clone(&oob),
                        ))
                    }
                };

                while let Ok(cmd) = cmd_rx.recv() {
                    *worker_session
                        .current_cancel
                        .lock()
                        .expect("cancel slot poisoned") = Some(Arc::clone(&cmd.cancel));

                    let tool = cmd.tool;
                    let result = catch_unwind(AssertUnwindSafe(|| {
                        tools::dispatch_session(driver.as_mut(), tool, &cmd.params, &cmd.cancel)
                    }));

                    *worker_session
                        .current_cancel
                        .lock()
                        .expect("cancel slot poisoned") = None;

                    let result = match result {
                        Ok(result) => result,
                        Err(_) => {
                            // a panic is isolated to this session: tear it
                            // down, the daemon stays up
                            error!(target: "daemon", "session {} worker panicked on `{tool}`", worker_session.id);
                            let _ = driver.stop(false, false);
                            worker_session.set_status(SessionStatus::Terminated);
                            worker_session.events.push(SessionEvent::Terminated);
                            let _ = cmd.reply.send(Err(ToolError::Internal(format!(
                                "session worker panicked while handling `{tool}`"
                            ))));
                            break;
                        }
                    };

                    worker_session.update_status_after(tool, &result);
                    let stop_requested = tool == Tool::Stop && result.is_ok();

                    // a debuggee that exited on its own is a terminal
                    // condition too: release backend resources and enqueue
                    // the final terminated event before the worker retires
                    let debuggee_gone =
                        !stop_requested && worker_session.status() == SessionStatus::Exited;
                    if debuggee_gone {
                        let _ = driver.stop(false, false);
                    }

                    let _ = cmd.reply.send(result);
                    if stop_requested || debuggee_gone {
                        break;
                    }
                }

                worker_session.dead.store(true, Ordering::SeqCst);
                info!(target: "daemon", "session {} worker finished", worker_session.id);
            })
            .expect("spawn session worker");

        session
    }

    fn update_status_after(&self, tool: Tool, result: &Result<Value, ToolError>) {
        let Ok(value) = result else { return };
        match tool {
            Tool::Launch | Tool::Attach | Tool::Run | Tool::Restart => {
                let exited = value.get("reason").and_then(Value::as_str) == Some("exit");
                self.set_status(if exited {
                    SessionStatus::Exited
                } else {
                    SessionStatus::Stopped
                });
            }
            Tool::Stop => self.set_status(SessionStatus::Terminated),
            _ => {}
        }
    }

    pub fn set_status(&self, status: SessionStatus) {
        *self.status.lock().expect("status lock poisoned") = status;
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock().expect("status lock poisoned")
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Cancel whatever request the worker is currently executing.
    pub fn cancel_current(&self) {
        if let Some(cancel) = self
            .current_cancel
            .lock()
            .expect("cancel slot poisoned")
            .as_ref()
        {
            cancel.cancel();
        }
    }

    /// Tear the session down without waiting: cancel the in-flight request
    /// and queue a `stop` so the worker releases the backend and exits.
    /// Idempotent.
    ///
    /// Used when a fatal condition is observed outside the worker, e.g. an
    /// adapter connection dropping while the session sits idle.
    pub fn shutdown(&self) {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_current();
        let (reply_tx, _reply_rx) = mpsc::sync_channel(1);
        let _ = self.cmd_tx.send(SessionCommand {
            tool: Tool::Stop,
            params: serde_json::json!({}),
            cancel: Arc::new(CancelToken::new()),
            reply: reply_tx,
        });
    }

    /// Queue a command and wait for its reply.
    ///
    /// `deadline = None` waits indefinitely (bounded by cancellation), which
    /// is the behavior `run` wants.
    pub fn call(
        &self,
        tool: Tool,
        params: Value,
        cancel: Arc<CancelToken>,
        deadline: Option<Duration>,
    ) -> Result<Value, ToolError> {
        if self.is_dead() {
            return Err(ToolError::SessionNotFound(self.id.clone()));
        }

        let cancel_handle = Arc::clone(&cancel);
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.cmd_tx
            .send(SessionCommand {
                tool,
                params,
                cancel,
                reply: reply_tx,
            })
            .map_err(|_| ToolError::SessionNotFound(self.id.clone()))?;

        match deadline {
            Some(deadline) => match reply_rx.recv_timeout(deadline) {
                Ok(result) => result,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    // nobody awaits the reply anymore; fire the command's own
                    // token so it cannot occupy the worker indefinitely
                    cancel_handle.cancel();
                    Err(ToolError::Timeout)
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    Err(ToolError::SessionNotFound(self.id.clone()))
                }
            },
            None => reply_rx
                .recv()
                .unwrap_or_else(|_| Err(ToolError::SessionNotFound(self.id.clone()))),
        }
    }
}
