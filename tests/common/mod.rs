//! Shared test doubles: an in-memory ProcessRunner that simulates the
//! OpenSSH CLI surface (control-socket probe, master creation, in-band
//! forward/cancel/exit commands) and constructors wiring it into
//! connections and managers.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sshmux::config::MuxConfig;
use sshmux::connection::SshConnection;
use sshmux::error::{Error, Result};
use sshmux::manager::SshConnectionManager;
use sshmux::ports::RangePortAllocator;
use sshmux::process::{Argv, ProcessHandle, ProcessOutput, ProcessRunner};
use sshmux::resolver::StaticHostResolver;

/// Port window handed to the range allocator in every test.
pub const PORT_RANGE_START: u16 = 42000;
pub const PORT_RANGE_END: u16 = 42100;

/// Observable state of the simulated OpenSSH installation.
#[derive(Default)]
pub struct FakeState {
    /// Control paths with a live master.
    pub masters: HashSet<String>,
    /// Active forwards, recorded as `L{local}:{remote_host}:{remote_port}`.
    pub forwards: HashSet<String>,
    /// Every `run` invocation, in order.
    pub runs: Vec<Argv>,
    /// Every `spawn` invocation, in order.
    pub spawns: Vec<Argv>,
    /// How many control masters were started.
    pub master_spawns: usize,
    /// Exit code returned for remote commands.
    pub command_exit: i32,
    /// When set, master spawns die without producing a socket.
    pub fail_master: bool,
    /// When set, the ambient `-O check` probe (no ControlPath) reports
    /// a live master, as if the user's own ssh config held one open.
    pub ambient_master: bool,
    /// Liveness flags of spawned keepalives; tests flip them to
    /// simulate a crashed keepalive.
    pub keepalives: Vec<Arc<AtomicBool>>,
}

/// In-memory [`ProcessRunner`] simulating OpenSSH CLI behavior.
#[derive(Clone, Default)]
pub struct FakeRunner {
    pub state: Arc<Mutex<FakeState>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }
}

fn output(exit_code: i32, stdout: &str, stderr: &str) -> ProcessOutput {
    ProcessOutput {
        exit_code,
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
    }
}

fn control_path_of(argv: &Argv) -> Option<String> {
    argv.args
        .iter()
        .find_map(|arg| arg.strip_prefix("ControlPath=").map(str::to_string))
}

fn control_op(argv: &Argv) -> Option<String> {
    argv.args
        .windows(2)
        .find(|pair| pair[0] == "-O")
        .map(|pair| pair[1].clone())
}

fn forward_spec_of(argv: &Argv) -> Option<String> {
    argv.args
        .windows(2)
        .find(|pair| pair[0] == "-L")
        .map(|pair| pair[1].clone())
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    async fn run(&self, _operation: &str, argv: &Argv, _timeout: Duration) -> Result<ProcessOutput> {
        let mut state = self.state.lock();
        state.runs.push(argv.clone());

        match control_op(argv).as_deref() {
            Some("check") => {
                let alive = match control_path_of(argv) {
                    Some(path) => state.masters.contains(&path),
                    None => state.ambient_master,
                };
                if alive {
                    Ok(output(0, "", "Master running (pid=100)"))
                } else {
                    Ok(output(
                        255,
                        "",
                        "Control socket connect(/tmp/none.sock): No such file or directory",
                    ))
                }
            }
            Some("forward") => {
                if let Some(spec) = forward_spec_of(argv) {
                    state.forwards.insert(format!("L{}", spec));
                }
                Ok(output(0, "", ""))
            }
            Some("cancel") => match forward_spec_of(argv) {
                Some(spec) => {
                    if state.forwards.remove(&format!("L{}", spec)) {
                        Ok(output(0, "", ""))
                    } else {
                        Ok(output(255, "", "mux_client_forward: unknown forward"))
                    }
                }
                None => {
                    state.forwards.clear();
                    Ok(output(0, "", ""))
                }
            },
            Some("exit") => {
                if let Some(path) = control_path_of(argv) {
                    state.masters.remove(&path);
                }
                Ok(output(0, "", "Exit request sent."))
            }
            _ => {
                if argv.program == "scp" || argv.program == "rsync" {
                    return Ok(output(0, "", ""));
                }
                let exit_code = state.command_exit;
                if exit_code == 0 {
                    Ok(output(0, "", ""))
                } else {
                    Ok(output(exit_code, "", "remote command failed"))
                }
            }
        }
    }

    async fn spawn(&self, argv: &Argv) -> Result<Box<dyn ProcessHandle>> {
        let mut state = self.state.lock();
        state.spawns.push(argv.clone());

        if argv.args.iter().any(|arg| arg == "ControlMaster=yes") {
            state.master_spawns += 1;
            if state.fail_master {
                return Ok(Box::new(FakeHandle::finished(255)));
            }
            if let Some(path) = control_path_of(argv) {
                std::fs::File::create(&path)?;
                state.masters.insert(path);
            }
            // The launcher exits once the persisted master holds the socket.
            return Ok(Box::new(FakeHandle::finished(0)));
        }

        // Keepalive: runs until its stdin closes or it is terminated.
        let running = Arc::new(AtomicBool::new(true));
        state.keepalives.push(running.clone());
        Ok(Box::new(FakeHandle {
            running,
            exit_code: 0,
        }))
    }
}

pub struct FakeHandle {
    running: Arc<AtomicBool>,
    exit_code: i32,
}

impl FakeHandle {
    fn finished(exit_code: i32) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            exit_code,
        }
    }
}

#[async_trait]
impl ProcessHandle for FakeHandle {
    async fn is_running(&mut self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn wait(&mut self, operation: &str, timeout: Duration) -> Result<i32> {
        if self.running.load(Ordering::SeqCst) {
            Err(Error::Timeout {
                operation: operation.to_string(),
                seconds: timeout.as_secs(),
            })
        } else {
            Ok(self.exit_code)
        }
    }

    fn close_stdin(&mut self) {
        // cat exits when its stdin closes.
        self.running.store(false, Ordering::SeqCst);
    }

    async fn terminate(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Short timeouts so failure paths resolve quickly.
pub fn test_config() -> MuxConfig {
    MuxConfig::default()
        .with_connect_timeout(1)
        .with_control_timeout(1)
        .with_command_timeout(5)
}

pub fn new_connection(host: &str, runner: &FakeRunner) -> SshConnection {
    SshConnection::new(
        host,
        Arc::new(runner.clone()),
        Arc::new(RangePortAllocator::new(PORT_RANGE_START..=PORT_RANGE_END)),
        test_config(),
    )
}

pub fn new_manager(runner: &FakeRunner, resolver: StaticHostResolver) -> SshConnectionManager {
    SshConnectionManager::new(
        Arc::new(runner.clone()),
        Arc::new(RangePortAllocator::new(PORT_RANGE_START..=PORT_RANGE_END)),
        Arc::new(resolver),
        test_config(),
    )
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sshmux=debug")),
        )
        .with_test_writer()
        .try_init();
}
