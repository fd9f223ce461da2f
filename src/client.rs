//! Thin client for the daemon socket: framed JSON-RPC calls with automatic
//! daemon start on first use.

use crate::protocol::transport;
use crate::protocol::{Request, Response, ToolError};
use log::debug;
use serde_json::Value;
use std::io::BufReader;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const AUTOSTART_DEADLINE: Duration = Duration::from_secs(3);

pub struct DaemonClient {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
    next_id: i64,
}

impl DaemonClient {
    /// Connect to a running daemon.
    pub fn connect(socket_path: &Path) -> std::io::Result<Self> {
        let stream = UnixStream::connect(socket_path)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            reader,
            writer: stream,
            next_id: 1,
        })
    }

    /// Connect, starting the daemon first when no socket answers.
    pub fn connect_or_start(socket_path: Option<PathBuf>) -> std::io::Result<Self> {
        let socket_path = socket_path.unwrap_or_else(crate::daemon::default_socket_path);
        if let Ok(client) = Self::connect(&socket_path) {
            return Ok(client);
        }

        debug!(target: "client", "no daemon on {}, starting one", socket_path.display());
        let exe = std::env::current_exe()?;
        std::process::Command::new(exe)
            .arg("serve")
            .arg("--socket")
            .arg(&socket_path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()?;

        let deadline = Instant::now() + AUTOSTART_DEADLINE;
        loop {
            match Self::connect(&socket_path) {
                Ok(client) => return Ok(client),
                Err(e) if Instant::now() >= deadline => return Err(e),
                Err(_) => std::thread::sleep(Duration::from_millis(50)),
            }
        }
    }

    /// Call a tool; protocol-level errors come back as `ToolError`.
    pub fn call(&mut self, method: &str, params: Value) -> Result<Value, ToolError> {
        let id = self.next_id;
        self.next_id += 1;

        transport::write_message(&mut self.writer, &Request::new(id, method, params))?;
        let response: Response = transport::read_message(&mut self.reader)?
            .ok_or_else(|| ToolError::Internal("daemon closed the connection".to_string()))?;

        if let Some(error) = response.error {
            return Err(ToolError::Internal(format!(
                "[{}] {}",
                error.code, error.message
            )));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }
}
