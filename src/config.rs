//! Configuration for the connection layer.
//!
//! This module defines the tool paths and timeout knobs used when
//! driving the OpenSSH client family. Values deserialize from TOML
//! with per-field defaults, so a partial config file is enough.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default connect timeout for the control master, in seconds.
pub const DEFAULT_CONNECT_TIMEOUT: u64 = 30;

/// Default idle persistence of the control master, in seconds.
pub const DEFAULT_PERSIST: u64 = 300;

/// Configuration for multiplexed SSH connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxConfig {
    /// Path or name of the `ssh` executable.
    #[serde(default = "default_ssh_program")]
    pub ssh_program: String,

    /// Path or name of the `scp` executable (file download).
    #[serde(default = "default_scp_program")]
    pub scp_program: String,

    /// Path or name of the `rsync` executable (symlink-preserving upload).
    #[serde(default = "default_rsync_program")]
    pub rsync_program: String,

    /// Seconds to wait for the control master to establish its socket.
    /// Also passed to ssh as `ConnectTimeout`.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Seconds the control master persists after the last command
    /// (ssh `ControlPersist`).
    #[serde(default = "default_persist")]
    pub persist_secs: u64,

    /// Deadline for remote command execution.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Deadline for file transfers.
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_secs: u64,

    /// Deadline for in-band control commands (`-O check/forward/cancel/exit`).
    #[serde(default = "default_control_timeout")]
    pub control_timeout_secs: u64,

    /// Grace period for the keepalive sub-connection to exit before it
    /// is forcibly terminated.
    #[serde(default = "default_keepalive_grace")]
    pub keepalive_grace_secs: u64,
}

fn default_ssh_program() -> String {
    "ssh".to_string()
}

fn default_scp_program() -> String {
    "scp".to_string()
}

fn default_rsync_program() -> String {
    "rsync".to_string()
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_persist() -> u64 {
    DEFAULT_PERSIST
}

fn default_command_timeout() -> u64 {
    60
}

fn default_transfer_timeout() -> u64 {
    600
}

fn default_control_timeout() -> u64 {
    10
}

fn default_keepalive_grace() -> u64 {
    5
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            ssh_program: default_ssh_program(),
            scp_program: default_scp_program(),
            rsync_program: default_rsync_program(),
            connect_timeout_secs: default_connect_timeout(),
            persist_secs: default_persist(),
            command_timeout_secs: default_command_timeout(),
            transfer_timeout_secs: default_transfer_timeout(),
            control_timeout_secs: default_control_timeout(),
            keepalive_grace_secs: default_keepalive_grace(),
        }
    }
}

impl MuxConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Failed to parse config: {}", e),
            ))
        })
    }

    /// Verify that the configured OpenSSH tools can be found on `PATH`.
    ///
    /// This is a fail-fast check for embedders; nothing in the crate
    /// calls it implicitly.
    pub fn verify_tools(&self) -> Result<()> {
        for program in [&self.ssh_program, &self.scp_program, &self.rsync_program] {
            which::which(program).map_err(|e| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("'{}' not found: {}", program, e),
                ))
            })?;
        }
        Ok(())
    }

    /// Control master connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Remote command deadline.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// File transfer deadline.
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    /// In-band control command deadline.
    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout_secs)
    }

    /// Keepalive graceful-exit deadline.
    pub fn keepalive_grace(&self) -> Duration {
        Duration::from_secs(self.keepalive_grace_secs)
    }

    /// Set the connect timeout, in seconds.
    pub fn with_connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    /// Set the remote command deadline, in seconds.
    pub fn with_command_timeout(mut self, secs: u64) -> Self {
        self.command_timeout_secs = secs;
        self
    }

    /// Set the in-band control command deadline, in seconds.
    pub fn with_control_timeout(mut self, secs: u64) -> Self {
        self.control_timeout_secs = secs;
        self
    }
}
