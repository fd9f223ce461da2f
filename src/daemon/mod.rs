//! The debugger daemon: a Unix socket listener, the session registry, and
//! request dispatch.

pub mod session;

use crate::driver::CancelToken;
use crate::protocol::transport;
use crate::protocol::{Request, Response, SessionEvent, ToolError};
use crate::tools::Tool;
use log::{debug, info, warn};
use serde_json::{json, Value};
use session::{select_kind, Session};
use std::collections::HashMap;
use std::io::BufReader;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const DEFAULT_DEADLINE: Duration = Duration::from_secs(60);
const LAUNCH_DEADLINE: Duration = Duration::from_secs(30);
const IDLE_SHUTDOWN: Duration = Duration::from_secs(300);

/// Default daemon socket path.
pub fn default_socket_path() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(dir).join("gumshoe.sock");
    }
    let user = std::env::var("USER").unwrap_or_else(|_| "nouser".to_string());
    PathBuf::from(format!("/tmp/gumshoe-{user}.sock"))
}

#[derive(Default)]
pub struct Registry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    next_session: AtomicU64,
    /// Cancellation tokens of in-flight requests, keyed by JSON-RPC id.
    outstanding: Mutex<HashMap<i64, Arc<CancelToken>>>,
    last_activity: Mutex<Option<Instant>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            next_session: AtomicU64::new(1),
            ..Self::default()
        }
    }

    fn insert(&self, session: Arc<Session>) {
        self.sessions
            .lock()
            .expect("registry lock poisoned")
            .insert(session.id.clone(), session);
    }

    fn get(&self, id: &str) -> Result<Arc<Session>, ToolError> {
        self.sessions
            .lock()
            .expect("registry lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| ToolError::SessionNotFound(id.to_string()))
    }

    fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .expect("registry lock poisoned")
            .remove(id)
    }

    fn list(&self) -> Vec<Arc<Session>> {
        self.sessions
            .lock()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn next_session_id(&self) -> String {
        format!("session-{}", self.next_session.fetch_add(1, Ordering::SeqCst))
    }

    /// Tear down and drop finished sessions.
    ///
    /// A session whose backend reported `terminated` (adapter crash, broken
    /// socket) but whose worker still idles is shut down here. A session
    /// whose worker has finished is removed once its events have been
    /// delivered: a dead session with undrained events stays listed so a
    /// final `poll_events` can still collect its output, exit code and
    /// `terminated` event.
    fn reap(&self) {
        for session in self.list() {
            if !session.is_dead() && session.events.terminated_enqueued() {
                session.shutdown();
            }
        }

        let stale: Vec<String> = self
            .sessions
            .lock()
            .expect("registry lock poisoned")
            .iter()
            .filter(|(_, session)| session.is_dead() && session.events.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            info!(target: "daemon", "reaping finished session {id}");
            self.remove(&id);
        }
    }

    fn touch(&self) {
        *self.last_activity.lock().expect("activity lock poisoned") = Some(Instant::now());
    }

    fn idle_for(&self) -> Option<Duration> {
        self.last_activity
            .lock()
            .expect("activity lock poisoned")
            .map(|at| at.elapsed())
    }
}

/// Run the daemon until the idle shutdown fires.
pub fn serve(socket_path: &Path) -> std::io::Result<()> {
    if socket_path.exists() {
        // a stale socket from a dead daemon; a live one would error on bind
        let _ = std::fs::remove_file(socket_path);
    }
    let listener = UnixListener::bind(socket_path)?;
    listener.set_nonblocking(true)?;
    info!(target: "daemon", "listening on {}", socket_path.display());

    let registry = Arc::new(Registry::new());
    registry.touch();

    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                registry.touch();
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || handle_connection(stream, registry));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                registry.reap();
                let no_sessions = registry.list().is_empty();
                let idle = registry
                    .idle_for()
                    .map(|idle| idle >= IDLE_SHUTDOWN)
                    .unwrap_or(false);
                if no_sessions && idle {
                    info!(target: "daemon", "idle for {IDLE_SHUTDOWN:?}, shutting down");
                    break;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                warn!(target: "daemon", "accept failed: {e}");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }

    let _ = std::fs::remove_file(socket_path);
    Ok(())
}

fn handle_connection(stream: UnixStream, registry: Arc<Registry>) {
    let mut reader = match stream.try_clone() {
        Ok(clone) => BufReader::new(clone),
        Err(e) => {
            warn!(target: "daemon", "clone connection: {e}");
            return;
        }
    };
    let mut writer = stream;

    loop {
        let request: Request = match transport::read_message(&mut reader) {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                debug!(target: "daemon", "connection read error: {e}");
                break;
            }
        };
        registry.touch();

        let response = handle_request(&registry, &request);
        if transport::write_message(&mut writer, &response).is_err() {
            break;
        }
    }
}

fn handle_request(registry: &Registry, request: &Request) -> Response {
    let cancel = Arc::new(CancelToken::new());
    if let Some(id) = request.id {
        registry
            .outstanding
            .lock()
            .expect("outstanding lock poisoned")
            .insert(id, Arc::clone(&cancel));
    }

    let result = dispatch(registry, request, cancel);

    if let Some(id) = request.id {
        registry
            .outstanding
            .lock()
            .expect("outstanding lock poisoned")
            .remove(&id);
    }

    match result {
        Ok(value) => Response::result(request.id, value),
        Err(e) => Response::error(request.id, &e),
    }
}

fn dispatch(
    registry: &Registry,
    request: &Request,
    cancel: Arc<CancelToken>,
) -> Result<Value, ToolError> {
    let tool = Tool::parse(&request.method)?;
    let params = &request.params;

    match tool {
        Tool::Launch => {
            let language = params
                .get("language")
                .and_then(Value::as_str)
                .map(ToString::to_string);
            let (kind, manifest) = select_kind(language.as_deref())?;
            let id = registry.next_session_id();
            let session = Session::spawn(id.clone(), kind, manifest);
            registry.insert(Arc::clone(&session));

            match session.call(Tool::Launch, params.clone(), cancel, Some(LAUNCH_DEADLINE)) {
                Ok(_) => Ok(json!({
                    "session_id": id,
                    "status": session.status().as_str(),
                    "driver_type": session.kind.to_string(),
                })),
                Err(e) => {
                    session.cancel_current();
                    let _ = session.call(
                        Tool::Stop,
                        json!({}),
                        Arc::new(CancelToken::new()),
                        Some(Duration::from_secs(5)),
                    );
                    registry.remove(&id);
                    Err(e)
                }
            }
        }
        Tool::Attach => {
            let language = params
                .get("language")
                .and_then(Value::as_str)
                .map(ToString::to_string);
            let (kind, manifest) = select_kind(language.as_deref())?;
            let id = registry.next_session_id();
            let session = Session::spawn(id.clone(), kind, manifest);
            registry.insert(Arc::clone(&session));

            match session.call(Tool::Attach, params.clone(), cancel, Some(LAUNCH_DEADLINE)) {
                Ok(_) => Ok(json!({
                    "session_id": id,
                    "status": session.status().as_str(),
                    "driver_type": session.kind.to_string(),
                })),
                Err(e) => {
                    registry.remove(&id);
                    Err(e)
                }
            }
        }
        Tool::Sessions => {
            let sessions: Vec<Value> = registry
                .list()
                .into_iter()
                .map(|session| {
                    json!({
                        "id": session.id,
                        "status": session.status().as_str(),
                        "driver_type": session.kind.to_string(),
                    })
                })
                .collect();
            Ok(json!({"sessions": sessions}))
        }
        Tool::PollEvents => {
            let session_id = params.get("session_id").and_then(Value::as_str);
            let mut out = vec![];
            let sessions = match session_id {
                Some(id) => vec![registry.get(id)?],
                None => registry.list(),
            };
            for session in sessions {
                let drained = session.events.drain();
                // a terminated event observed here may come from an adapter
                // connection dropping while the worker sits idle; make sure
                // the session is torn down either way
                let terminated = drained
                    .iter()
                    .any(|event| matches!(event, SessionEvent::Terminated));
                for event in drained {
                    out.push(json!({
                        "session_id": session.id,
                        "event": event,
                    }));
                }
                if terminated && !session.is_dead() {
                    session.shutdown();
                }
            }
            Ok(json!({"events": out}))
        }
        Tool::Cancel => {
            let request_id = params.get("request_id").and_then(Value::as_i64);
            let mut cancelled = false;
            if let Some(request_id) = request_id {
                if let Some(token) = registry
                    .outstanding
                    .lock()
                    .expect("outstanding lock poisoned")
                    .get(&request_id)
                {
                    token.cancel();
                    cancelled = true;
                }
            }
            // forward progress cancellation to the owning session, if named
            if let Some(session_id) = params.get("session_id").and_then(Value::as_str) {
                if let Ok(session) = registry.get(session_id) {
                    session.cancel_current();
                    cancelled = true;
                }
            }
            Ok(json!({"cancelled": cancelled}))
        }
        Tool::Stop => {
            let session_id = session_id_of(params)?;
            let session = registry.get(&session_id)?;
            // an already finished session (self-exited, adapter gone) has
            // nothing left to tear down
            if session.is_dead() {
                registry.remove(&session_id);
                return Ok(json!({}));
            }
            // unblock the worker if it sits in a long wait
            session.cancel_current();
            session.oob.pause();
            let result = session.call(
                Tool::Stop,
                params.clone(),
                cancel,
                Some(Duration::from_secs(10)),
            );
            registry.remove(&session_id);
            result
        }
        _ => {
            let session_id = session_id_of(params)?;
            let session = registry.get(&session_id)?;

            if tool == Tool::Run {
                let is_pause = params.get("action").and_then(Value::as_str) == Some("pause");
                if is_pause {
                    // out of band: interrupt the debuggee, the blocked run
                    // returns with a pause stop
                    session.oob.pause();
                    return session.call(tool, params.clone(), cancel, Some(DEFAULT_DEADLINE));
                }
                // a run has no deadline, it is bounded by cancellation
                return session.call(tool, params.clone(), cancel, None);
            }

            session.call(tool, params.clone(), cancel, Some(DEFAULT_DEADLINE))
        }
    }
}

fn session_id_of(params: &Value) -> Result<String, ToolError> {
    params
        .get("session_id")
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| ToolError::InvalidParams("`session_id` is required".to_string()))
}
