//! A single multiplexed SSH connection.
//!
//! [`SshConnection`] owns the lifecycle of one logical channel to one
//! remote host: it establishes (or adopts) an OpenSSH control master,
//! runs commands and file transfers through its control socket, keeps a
//! table of local port forwards, and holds a keepalive sub-connection
//! whose process liveness stands in for "is the master still usable".
//!
//! The expensive part of talking to a host - the authenticated network
//! connection - is paid once in [`SshConnection::connect`]; every other
//! operation rides the established channel and is cheap to repeat.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::MuxConfig;
use crate::error::{Error, Result};
use crate::openssh::{self, CheckOutcome, ForwardAction};
use crate::ports::PortAllocator;
use crate::process::{ProcessHandle, ProcessOutput, ProcessRunner};

/// How often the control socket is polled while the master starts.
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A reusable, multiplexed channel to one remote host.
///
/// All mutable state lives behind one async mutex, so a connection
/// shared through the manager is safe for concurrent use; operations on
/// the same connection serialize, which also preserves the ordering
/// guarantee that sequential callers observe the effects of all prior
/// operations.
pub struct SshConnection {
    host: String,
    runner: Arc<dyn ProcessRunner>,
    allocator: Arc<dyn PortAllocator>,
    config: MuxConfig,
    state: Mutex<ConnState>,
}

#[derive(Default)]
struct ConnState {
    connected: bool,
    /// Socket path of a master this object created; `None` while
    /// disconnected and while riding an adopted ambient master.
    control_path: Option<PathBuf>,
    /// Whether this object created the master (and so must tear it down).
    owns_master: bool,
    /// Scratch directory holding the control socket. Created on first
    /// connect and kept for the connection's lifetime so the socket
    /// path stays stable across reconnects; removed on drop.
    scratch_dir: Option<TempDir>,
    master: Option<Box<dyn ProcessHandle>>,
    keepalive: Option<Box<dyn ProcessHandle>>,
    /// `"remote_host:remote_port"` -> bound local port.
    forwards: HashMap<String, u16>,
}

impl SshConnection {
    /// Create a connection object for `host`. No processes are spawned
    /// until [`connect`](Self::connect).
    pub fn new(
        host: impl Into<String>,
        runner: Arc<dyn ProcessRunner>,
        allocator: Arc<dyn PortAllocator>,
        config: MuxConfig,
    ) -> Self {
        Self {
            host: host.into(),
            runner,
            allocator,
            config,
            state: Mutex::new(ConnState::default()),
        }
    }

    /// Canonical host this connection talks to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Establish the connection: adopt an already-running control
    /// master if one answers a liveness probe, otherwise start a new
    /// one, then start the keepalive sub-connection.
    ///
    /// A no-op when already connected.
    pub async fn connect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.connected {
            trace!(host = %self.host, "Already connected");
            return Ok(());
        }

        // Probe for a master some other part of the process, or the
        // user's own ssh configuration, already holds open for this
        // host. Adoption is the primary path, not error recovery.
        let probe = openssh::check_argv(&self.config, None, &self.host);
        let output = self
            .runner
            .run("connect.check", &probe, self.config.control_timeout())
            .await?;

        match openssh::parse_check(&output) {
            CheckOutcome::Alive => {
                debug!(host = %self.host, "Reusing existing control master");
                state.control_path = None;
                state.owns_master = false;
            }
            CheckOutcome::NoSocket => {
                self.start_master(&mut state).await?;
            }
            CheckOutcome::Unknown(stderr) => {
                warn!(host = %self.host, stderr = %stderr, "Unexpected probe result; starting a new master");
                self.start_master(&mut state).await?;
            }
        }

        let keepalive_argv =
            openssh::keepalive_argv(&self.config, state.control_path.as_deref(), &self.host);
        let keepalive = self.runner.spawn(&keepalive_argv).await?;
        state.keepalive = Some(keepalive);
        state.connected = true;
        debug!(host = %self.host, "Connected");
        Ok(())
    }

    /// Start a brand-new control master and wait for its socket.
    async fn start_master(&self, state: &mut ConnState) -> Result<()> {
        if state.scratch_dir.is_none() {
            state.scratch_dir = Some(tempfile::Builder::new().prefix("sshmux-").tempdir()?);
        }
        let socket = state
            .scratch_dir
            .as_ref()
            .map(|dir| dir.path().join(format!("cm-{}.sock", self.host)))
            .ok_or_else(|| Error::ConnectFailed {
                host: self.host.clone(),
                message: "scratch directory unavailable".to_string(),
            })?;

        let argv = openssh::master_argv(&self.config, &socket, &self.host);
        debug!(host = %self.host, socket = %socket.display(), "Starting control master");
        let mut master = self.runner.spawn(&argv).await?;

        let deadline = Instant::now() + self.config.connect_timeout();
        loop {
            if socket.exists() {
                break;
            }
            if !master.is_running().await {
                // ControlPersist forks the persistent master; the
                // launcher exiting is only fatal without a socket.
                if socket.exists() {
                    break;
                }
                let code = master
                    .wait("connect.master", Duration::from_secs(1))
                    .await
                    .unwrap_or(-1);
                return Err(Error::ConnectFailed {
                    host: self.host.clone(),
                    message: format!(
                        "control master exited with status {} before creating {}",
                        code,
                        socket.display()
                    ),
                });
            }
            if Instant::now() >= deadline {
                let _ = master.terminate().await;
                return Err(Error::ConnectFailed {
                    host: self.host.clone(),
                    message: format!(
                        "control socket {} did not appear within {}s",
                        socket.display(),
                        self.config.connect_timeout_secs
                    ),
                });
            }
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }

        state.control_path = Some(socket);
        state.owns_master = true;
        state.master = Some(master);
        Ok(())
    }

    /// `true` only while the lifecycle flag is connected **and** the
    /// keepalive process is still running. Health is re-checked on
    /// every call; a crashed keepalive demotes the connection to "not
    /// usable" even though `disconnect` was never called.
    pub async fn is_connected(&self) -> bool {
        let mut state = self.state.lock().await;
        if !state.connected {
            return false;
        }
        match state.keepalive.as_mut() {
            Some(keepalive) => keepalive.is_running().await,
            None => false,
        }
    }

    /// Execute `command` on the remote host through the control socket
    /// and return its exit code. A non-zero exit is surfaced as
    /// [`Error::ProcessFailed`], never swallowed.
    pub async fn run_command(&self, command: &str) -> Result<i32> {
        self.run_command_output(command)
            .await
            .map(|output| output.exit_code)
    }

    /// Like [`run_command`](Self::run_command) but returns the full
    /// captured output.
    pub async fn run_command_output(&self, command: &str) -> Result<ProcessOutput> {
        let state = self.state.lock().await;
        self.ensure_connected(&state, "run_command")?;

        let argv =
            openssh::command_argv(&self.config, state.control_path.as_deref(), &self.host, command);
        debug!(host = %self.host, command = %command, "Running remote command");
        let output = self
            .runner
            .run("run_command", &argv, self.config.command_timeout())
            .await?;
        if !output.success() {
            return Err(Error::ProcessFailed {
                operation: "run_command".to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }

    /// Download `remote_path` from the host to `local_path`, riding the
    /// control socket so no new authentication round-trip is needed.
    pub async fn get_file(&self, remote_path: &str, local_path: &Path) -> Result<()> {
        let state = self.state.lock().await;
        self.ensure_connected(&state, "get_file")?;

        let argv = openssh::download_argv(
            &self.config,
            state.control_path.as_deref(),
            &self.host,
            remote_path,
            &local_path.display().to_string(),
        );
        debug!(host = %self.host, remote = %remote_path, local = %local_path.display(), "Downloading file");
        let output = self
            .runner
            .run("get_file", &argv, self.config.transfer_timeout())
            .await?;
        if !output.success() {
            return Err(Error::ProcessFailed {
                operation: "get_file".to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        Ok(())
    }

    /// Upload `local_path` to `remote_path` on the host, preserving
    /// symbolic links. `remote_path` may be a directory.
    pub async fn put_file(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let state = self.state.lock().await;
        self.ensure_connected(&state, "put_file")?;

        let argv = openssh::upload_argv(
            &self.config,
            state.control_path.as_deref(),
            &self.host,
            &local_path.display().to_string(),
            remote_path,
        );
        debug!(host = %self.host, local = %local_path.display(), remote = %remote_path, "Uploading file");
        let output = self
            .runner
            .run("put_file", &argv, self.config.transfer_timeout())
            .await?;
        if !output.success() {
            return Err(Error::ProcessFailed {
                operation: "put_file".to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        Ok(())
    }

    /// Open a local-forward listener to `remote_host:remote_port` and
    /// return the bound local port.
    ///
    /// Idempotent: a forward to the same endpoint returns the existing
    /// local port without a second listener.
    pub async fn add_port_forward(&self, remote_host: &str, remote_port: u16) -> Result<u16> {
        let mut state = self.state.lock().await;
        self.ensure_connected(&state, "add_port_forward")?;

        let key = format!("{}:{}", remote_host, remote_port);
        if let Some(&port) = state.forwards.get(&key) {
            trace!(host = %self.host, forward = %key, port, "Forward already present");
            return Ok(port);
        }

        let port = self.allocator.allocate()?;
        let spec = openssh::forward_spec(port, remote_host, remote_port);
        let argv = openssh::forward_argv(
            &self.config,
            state.control_path.as_deref(),
            &self.host,
            ForwardAction::Add,
            &spec,
        );
        let output = self
            .runner
            .run("add_port_forward", &argv, self.config.control_timeout())
            .await?;
        if !output.success() {
            return Err(Error::ProcessFailed {
                operation: "add_port_forward".to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }

        state.forwards.insert(key.clone(), port);
        debug!(host = %self.host, forward = %key, port, "Forward added");
        Ok(port)
    }

    /// Cancel the forward to `remote_host:remote_port`. Fails with
    /// [`Error::ForwardNotFound`] when no such forward exists.
    pub async fn remove_port_forward(&self, remote_host: &str, remote_port: u16) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_connected(&state, "remove_port_forward")?;

        let key = format!("{}:{}", remote_host, remote_port);
        let Some(port) = state.forwards.remove(&key) else {
            return Err(Error::ForwardNotFound {
                host: self.host.clone(),
                spec: key,
            });
        };

        // Cancel with exactly the spec that added the forward; OpenSSH
        // matches cancel requests against the forward list textually.
        let spec = openssh::forward_spec(port, remote_host, remote_port);
        let argv = openssh::forward_argv(
            &self.config,
            state.control_path.as_deref(),
            &self.host,
            ForwardAction::Cancel,
            &spec,
        );
        let output = self
            .runner
            .run("remove_port_forward", &argv, self.config.control_timeout())
            .await?;
        if !output.success() {
            return Err(Error::ProcessFailed {
                operation: "remove_port_forward".to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }

        debug!(host = %self.host, forward = %key, port, "Forward removed");
        Ok(())
    }

    /// Tear the connection down: cancel all forwards and stop the
    /// master (only when this object created it), then stop the
    /// keepalive. State is cleared even when a step fails; the first
    /// failure is still returned.
    pub async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(Error::NotConnected {
                operation: "disconnect".to_string(),
                host: self.host.clone(),
            });
        }

        let mut first_error: Option<Error> = None;

        if state.owns_master {
            if let Some(path) = state.control_path.clone() {
                first_error = self.shutdown_master(&mut state, &path).await.err();
            }
        }

        if first_error.is_none() {
            if let Some(mut keepalive) = state.keepalive.take() {
                keepalive.close_stdin();
                match keepalive
                    .wait("disconnect.keepalive", self.config.keepalive_grace())
                    .await
                {
                    Ok(_) => {}
                    Err(Error::Timeout { .. }) => {
                        warn!(host = %self.host, "Keepalive did not exit in time; terminating");
                        if let Err(e) = keepalive.terminate().await {
                            first_error = Some(e);
                        }
                    }
                    Err(e) => first_error = Some(e),
                }
            }
        }

        // Clear state unconditionally so the object is consistent even
        // after a partial teardown. Dropping the handles reaps any
        // process a skipped step left behind.
        state.master = None;
        state.keepalive = None;
        state.control_path = None;
        state.owns_master = false;
        state.forwards.clear();
        state.connected = false;
        debug!(host = %self.host, "Disconnected");

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Cancel all forwards on the master, ask it to exit, and wait for
    /// the master process to terminate within its bound.
    async fn shutdown_master(&self, state: &mut ConnState, control_path: &Path) -> Result<()> {
        let cancel = openssh::cancel_all_argv(&self.config, Some(control_path), &self.host);
        let output = self
            .runner
            .run("disconnect.cancel", &cancel, self.config.control_timeout())
            .await?;
        if !output.success() {
            return Err(Error::ProcessFailed {
                operation: "disconnect.cancel".to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }

        let exit = openssh::exit_argv(&self.config, Some(control_path), &self.host);
        let output = self
            .runner
            .run("disconnect.exit", &exit, self.config.control_timeout())
            .await?;
        if !output.success() {
            return Err(Error::ProcessFailed {
                operation: "disconnect.exit".to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }

        if let Some(mut master) = state.master.take() {
            master
                .wait("disconnect.master", self.config.control_timeout())
                .await?;
        }
        Ok(())
    }

    /// Snapshot of the current forward table
    /// (`"remote_host:remote_port"` -> local port).
    pub async fn forwards(&self) -> HashMap<String, u16> {
        self.state.lock().await.forwards.clone()
    }

    /// Path of the control socket this object created, if any.
    pub async fn control_socket_path(&self) -> Option<PathBuf> {
        self.state.lock().await.control_path.clone()
    }

    fn ensure_connected(&self, state: &ConnState, operation: &str) -> Result<()> {
        if state.connected {
            Ok(())
        } else {
            Err(Error::NotConnected {
                operation: operation.to_string(),
                host: self.host.clone(),
            })
        }
    }
}

impl std::fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}
