//! Process execution layer.
//!
//! Everything this crate does to a remote host goes through an external
//! OpenSSH-family executable. The [`ProcessRunner`] trait is the narrow
//! seam through which those executables are invoked, so tests can
//! substitute an in-memory simulation. [`OpenSshRunner`] is the
//! production implementation on top of `tokio::process`.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// A fully assembled external-process invocation: program plus arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argv {
    /// Program to execute (name or path).
    pub program: String,
    /// Arguments, one element each, unquoted.
    pub args: Vec<String>,
}

impl Argv {
    /// Create an invocation from a program and its arguments.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Render the invocation as a shell-quoted string, for logging.
    pub fn display(&self) -> String {
        shell_words::join(
            std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str)),
        )
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Exit code (`-1` if terminated by signal).
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl ProcessOutput {
    /// `true` if the process exited with status zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Handle to a long-running background process (control master or
/// keepalive sub-connection).
#[async_trait]
pub trait ProcessHandle: Send {
    /// Non-blocking liveness poll.
    async fn is_running(&mut self) -> bool;

    /// Wait for the process to exit, bounded by `timeout`. Returns the
    /// exit code, or [`Error::Timeout`] labelled with `operation` when
    /// the deadline expires.
    async fn wait(&mut self, operation: &str, timeout: Duration) -> Result<i32>;

    /// Close the process's standard input, signalling it to finish.
    fn close_stdin(&mut self);

    /// Forcibly terminate the process.
    async fn terminate(&mut self) -> Result<()>;
}

/// Spawns external processes and captures their results.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run `argv` to completion, bounded by `timeout`. The `operation`
    /// label is carried into timeout errors.
    async fn run(&self, operation: &str, argv: &Argv, timeout: Duration) -> Result<ProcessOutput>;

    /// Spawn `argv` as a long-running background process with piped
    /// stdin and return a handle to it.
    async fn spawn(&self, argv: &Argv) -> Result<Box<dyn ProcessHandle>>;
}

/// Production runner: spawns real processes via `tokio::process`.
///
/// Spawned children are configured with `kill_on_drop`, so dropping a
/// handle (or an `sshmux` object holding one) never leaks a process.
#[derive(Debug, Default, Clone)]
pub struct OpenSshRunner;

impl OpenSshRunner {
    /// Create a new runner.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessRunner for OpenSshRunner {
    async fn run(&self, operation: &str, argv: &Argv, timeout: Duration) -> Result<ProcessOutput> {
        trace!(command = %argv.display(), "Running external process");

        let child = Command::new(&argv.program)
            .args(&argv.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Dropping the future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Timeout {
                    operation: operation.to_string(),
                    seconds: timeout.as_secs(),
                })
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        trace!(exit_code, "External process finished");

        Ok(ProcessOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn spawn(&self, argv: &Argv) -> Result<Box<dyn ProcessHandle>> {
        debug!(command = %argv.display(), "Spawning background process");

        let mut child = Command::new(&argv.program)
            .args(&argv.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take();
        Ok(Box::new(ChildHandle { child, stdin }))
    }
}

/// Handle over a real `tokio::process::Child`.
struct ChildHandle {
    child: Child,
    stdin: Option<ChildStdin>,
}

#[async_trait]
impl ProcessHandle for ChildHandle {
    async fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn wait(&mut self, operation: &str, timeout: Duration) -> Result<i32> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => Ok(status?.code().unwrap_or(-1)),
            Err(_) => Err(Error::Timeout {
                operation: operation.to_string(),
                seconds: timeout.as_secs(),
            }),
        }
    }

    fn close_stdin(&mut self) {
        self.stdin.take();
    }

    async fn terminate(&mut self) -> Result<()> {
        self.child.start_kill()?;
        let _ = self.child.wait().await;
        Ok(())
    }
}
