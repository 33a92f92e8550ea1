//! OpenSSH command-line assembly.
//!
//! The "wire protocol" of this crate is the command line of the OpenSSH
//! client family. Each invocation kind gets one builder function here;
//! nothing else in the crate concatenates ssh arguments by hand.
//!
//! Two argument groups recur:
//!
//! - base arguments: no X11 forwarding, errors-only logging, no
//!   interactive prompts, public-key authentication only;
//! - control arguments: ride an existing control master without
//!   becoming one. When the control path is `None` the connection
//!   adopted an ambient master, and multiplexing is left to the user's
//!   own ssh configuration.
//!
//! Strict host-key checking stays enabled on master creation.
//! `BatchMode` suppresses the interactive prompt without accepting
//! unknown keys.

use std::path::Path;

use crate::config::MuxConfig;
use crate::process::{Argv, ProcessOutput};

/// Outcome of a `-O check` master liveness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// A master is running and answered the probe.
    Alive,
    /// No control socket exists for this host.
    NoSocket,
    /// Anything else; carried for logging, treated as not alive.
    Unknown(String),
}

/// Direction of an in-band forward control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardAction {
    /// `-O forward`: add a local-forward listener.
    Add,
    /// `-O cancel`: cancel a specific local forward.
    Cancel,
}

/// The `-L` specification for a local forward.
///
/// The same spec string is used to add and to cancel a forward; OpenSSH
/// matches cancel requests against the forward list textually, so the
/// two sides must agree byte for byte.
pub fn forward_spec(local_port: u16, remote_host: &str, remote_port: u16) -> String {
    format!("{}:{}:{}", local_port, remote_host, remote_port)
}

/// Base ssh arguments shared by every invocation.
fn base_args() -> Vec<String> {
    [
        "-x",
        "-o",
        "LogLevel=ERROR",
        "-o",
        "BatchMode=yes",
        "-o",
        "PasswordAuthentication=no",
        "-o",
        "KbdInteractiveAuthentication=no",
    ]
    .map(String::from)
    .to_vec()
}

/// Option-form base arguments for tools that reject ssh's `-x` flag
/// (`scp`).
fn base_options() -> Vec<String> {
    [
        "-o",
        "LogLevel=ERROR",
        "-o",
        "BatchMode=yes",
        "-o",
        "PasswordAuthentication=no",
        "-o",
        "KbdInteractiveAuthentication=no",
    ]
    .map(String::from)
    .to_vec()
}

/// Control-socket arguments for an invocation riding an existing
/// master. Empty when the master was adopted from ambient ssh config.
fn control_args(control_path: Option<&Path>) -> Vec<String> {
    match control_path {
        Some(path) => vec![
            "-o".to_string(),
            "ControlMaster=no".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", path.display()),
        ],
        None => Vec::new(),
    }
}

/// Invocation that creates a new control master: no remote command, no
/// pseudo-tty, bounded connect, idle persistence, strict host keys.
pub fn master_argv(config: &MuxConfig, control_path: &Path, host: &str) -> Argv {
    let mut args = base_args();
    args.extend(
        [
            "-N",
            "-T",
            "-o",
            &format!("ConnectTimeout={}", config.connect_timeout_secs),
            "-o",
            &format!("ControlPersist={}", config.persist_secs),
            "-o",
            "ControlMaster=yes",
            "-o",
            "StrictHostKeyChecking=yes",
            "-o",
            &format!("ControlPath={}", control_path.display()),
        ]
        .map(String::from),
    );
    args.push(host.to_string());
    Argv::new(&config.ssh_program, args)
}

/// Keepalive sub-connection: rides the master and blocks on an inert
/// remote `cat` until its stdin is closed.
pub fn keepalive_argv(config: &MuxConfig, control_path: Option<&Path>, host: &str) -> Argv {
    let mut args = base_args();
    args.extend(control_args(control_path));
    args.push("-T".to_string());
    args.push(host.to_string());
    args.push("cat".to_string());
    Argv::new(&config.ssh_program, args)
}

/// Remote command execution through the control socket, no stdin.
pub fn command_argv(
    config: &MuxConfig,
    control_path: Option<&Path>,
    host: &str,
    command: &str,
) -> Argv {
    let mut args = base_args();
    args.extend(control_args(control_path));
    args.push("-n".to_string());
    args.push(host.to_string());
    args.push(command.to_string());
    Argv::new(&config.ssh_program, args)
}

/// File download: `scp host:remote local` through the control socket.
pub fn download_argv(
    config: &MuxConfig,
    control_path: Option<&Path>,
    host: &str,
    remote_path: &str,
    local_path: &str,
) -> Argv {
    let mut args = base_options();
    args.extend(control_args(control_path));
    args.push(format!("{}:{}", host, remote_path));
    args.push(local_path.to_string());
    Argv::new(&config.scp_program, args)
}

/// File upload: `rsync -rl local host:remote`, preserving symbolic
/// links and allowing directory destinations, with ssh (and its control
/// arguments) as the remote shell.
pub fn upload_argv(
    config: &MuxConfig,
    control_path: Option<&Path>,
    host: &str,
    local_path: &str,
    remote_path: &str,
) -> Argv {
    let mut ssh_command = vec![config.ssh_program.clone()];
    ssh_command.extend(base_args());
    ssh_command.extend(control_args(control_path));

    let args = vec![
        "-r".to_string(),
        "-l".to_string(),
        "-e".to_string(),
        shell_words::join(ssh_command.iter().map(String::as_str)),
        local_path.to_string(),
        format!("{}:{}", host, remote_path),
    ];
    Argv::new(&config.rsync_program, args)
}

/// In-band forward add/cancel against the running master.
pub fn forward_argv(
    config: &MuxConfig,
    control_path: Option<&Path>,
    host: &str,
    action: ForwardAction,
    spec: &str,
) -> Argv {
    let mut args = base_args();
    args.extend(control_args(control_path));
    args.push("-O".to_string());
    args.push(
        match action {
            ForwardAction::Add => "forward",
            ForwardAction::Cancel => "cancel",
        }
        .to_string(),
    );
    args.push("-L".to_string());
    args.push(spec.to_string());
    args.push(host.to_string());
    Argv::new(&config.ssh_program, args)
}

/// Master liveness probe: `-O check`.
pub fn check_argv(config: &MuxConfig, control_path: Option<&Path>, host: &str) -> Argv {
    control_command_argv(config, control_path, host, "check")
}

/// Drop every forward on the master: `-O cancel` with no `-L`.
pub fn cancel_all_argv(config: &MuxConfig, control_path: Option<&Path>, host: &str) -> Argv {
    control_command_argv(config, control_path, host, "cancel")
}

/// Ask the master to exit: `-O exit`.
pub fn exit_argv(config: &MuxConfig, control_path: Option<&Path>, host: &str) -> Argv {
    control_command_argv(config, control_path, host, "exit")
}

fn control_command_argv(
    config: &MuxConfig,
    control_path: Option<&Path>,
    host: &str,
    command: &str,
) -> Argv {
    let mut args = base_args();
    args.extend(control_args(control_path));
    args.push("-O".to_string());
    args.push(command.to_string());
    args.push(host.to_string());
    Argv::new(&config.ssh_program, args)
}

/// Interpret the result of a `-O check` probe.
pub fn parse_check(output: &ProcessOutput) -> CheckOutcome {
    if output.success() {
        return CheckOutcome::Alive;
    }
    if output.stderr.contains("No such file or directory")
        || output.stderr.contains("Control socket connect")
    {
        return CheckOutcome::NoSocket;
    }
    CheckOutcome::Unknown(output.stderr.trim().to_string())
}
