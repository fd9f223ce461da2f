use crate::debugger::error::Error;
use crate::debugger::error::Error::{Attach, AttachedProcessNotFound, Ptrace, Waitpid};
use nix::sys;
use nix::sys::personality::Persona;
use nix::sys::ptrace::Options;
use nix::sys::signal::SIGSTOP;
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{fork, ForkResult, Pid};
use os_pipe::PipeWriter;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;

const TRACE_OPTIONS: Options = Options::PTRACE_O_TRACECLONE
    .union(Options::PTRACE_O_TRACEEXEC)
    .union(Options::PTRACE_O_TRACEEXIT);

/// Process state.
pub trait State {}

/// Process running and attached with `ptrace` system call.
pub struct Installed;

impl State for Installed {}

/// Process prepared for instantiation by a `fork` call.
pub struct Template;

impl State for Template {}

/// Debuggee process under ptrace control.
pub struct Child<S: State> {
    pub program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<PathBuf>,
    stdout: Option<PipeWriter>,
    stderr: Option<PipeWriter>,
    pid: Option<Pid>,
    external: bool,
    _p: PhantomData<S>,
}

impl Child<Template> {
    /// Create a new process template, but don't start it.
    ///
    /// # Arguments
    ///
    /// * `program`: program path
    /// * `args`: program arguments
    /// * `env`: extra environment variables for the debuggee
    /// * `cwd`: debuggee working directory (inherited if `None`)
    /// * `stdout`: stdout pipe
    /// * `stderr`: stderr pipe
    pub fn new<ARGS: IntoIterator<Item = I>, I: Into<String>>(
        program: impl Into<String>,
        args: ARGS,
        env: HashMap<String, String>,
        cwd: Option<PathBuf>,
        stdout: PipeWriter,
        stderr: PipeWriter,
    ) -> Child<Template> {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env,
            cwd,
            stdout: Some(stdout),
            stderr: Some(stderr),
            pid: None,
            external: false,
            _p: PhantomData,
        }
    }

    /// Instantiate the process with `fork()`, the caller becoming the tracer.
    ///
    /// The child raises `SIGSTOP`, the parent seizes it with
    /// clone/exec/exit tracing enabled, and only then the child `exec`s.
    /// ASLR is disabled in the child so breakpoint addresses stay stable
    /// between restarts.
    ///
    /// The installed child carries no writer ends of the output pipes: once
    /// the debuggee exits, its pipe readers observe EOF and the captured
    /// output can be drained completely before teardown.
    pub fn install(&self) -> Result<Child<Installed>, Error> {
        let stdout = self.stdout.as_ref().expect("template always has pipes");
        let stderr = self.stderr.as_ref().expect("template always has pipes");
        let mut debugee_cmd = Command::new(&self.program);
        let debugee_cmd = debugee_cmd
            .args(&self.args)
            .envs(&self.env)
            .stdout(stdout.try_clone()?)
            .stderr(stderr.try_clone()?);
        if let Some(cwd) = &self.cwd {
            debugee_cmd.current_dir(cwd);
        }

        unsafe {
            debugee_cmd.pre_exec(move || {
                sys::personality::set(Persona::ADDR_NO_RANDOMIZE)?;
                Ok(())
            });
        }

        match unsafe { fork().map_err(|e| Error::Syscall("fork", e))? } {
            ForkResult::Parent { child: pid } => {
                waitpid(pid, Some(WaitPidFlag::WSTOPPED)).map_err(Waitpid)?;
                sys::ptrace::seize(pid, TRACE_OPTIONS).map_err(Ptrace)?;

                Ok(Child {
                    program: self.program.clone(),
                    args: self.args.clone(),
                    env: self.env.clone(),
                    cwd: self.cwd.clone(),
                    stdout: None,
                    stderr: None,
                    pid: Some(pid),
                    external: false,
                    _p: PhantomData,
                })
            }
            ForkResult::Child => {
                sys::signal::raise(SIGSTOP).expect("raise SIGSTOP in debuggee fork");
                let err = debugee_cmd.exec();
                // reachable only when exec fails
                std::process::exit(err.raw_os_error().unwrap_or(1));
            }
        }
    }
}

impl Child<Installed> {
    /// Attach to an already running process.
    ///
    /// The process is stopped by the attach; the first stop is reported to
    /// the client as `entry`.
    pub fn attach(pid: Pid) -> Result<Child<Installed>, Error> {
        let program = std::fs::read_link(format!("/proc/{pid}/exe"))
            .map_err(|_| AttachedProcessNotFound(pid))?;

        sys::ptrace::seize(pid, TRACE_OPTIONS).map_err(Attach)?;
        sys::ptrace::interrupt(pid).map_err(Attach)?;
        waitpid(pid, None).map_err(Waitpid)?;

        Ok(Child {
            program: program.to_string_lossy().to_string(),
            args: vec![],
            env: HashMap::new(),
            cwd: None,
            stdout: None,
            stderr: None,
            pid: Some(pid),
            external: true,
            _p: PhantomData,
        })
    }

    /// Return running process pid.
    pub fn pid(&self) -> Pid {
        self.pid.expect("installed process always has a pid")
    }

    /// True when the process existed before the debugger attached
    /// (and therefore must be detached from, not killed, by default).
    pub fn is_external(&self) -> bool {
        self.external
    }

    /// Recreate a template from this process for a `restart`, with fresh
    /// output pipes.
    pub fn to_template(
        &self,
        stdout: PipeWriter,
        stderr: PipeWriter,
    ) -> Result<Child<Template>, Error> {
        Ok(Child {
            program: self.program.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            cwd: self.cwd.clone(),
            stdout: Some(stdout),
            stderr: Some(stderr),
            pid: None,
            external: false,
            _p: PhantomData,
        })
    }
}
