//! Error types for sshmux.
//!
//! One error enum covers the whole crate. Every fallible operation
//! returns [`Result`]; there are no sentinel return values.

use thiserror::Error;

/// Result type alias for sshmux operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing multiplexed SSH connections.
#[derive(Error, Debug)]
pub enum Error {
    /// An operation requiring a connected session was invoked while
    /// disconnected.
    #[error("Operation '{operation}' requires a connected session to '{host}'")]
    NotConnected {
        /// The operation that was attempted.
        operation: String,
        /// Canonical host of the offending connection.
        host: String,
    },

    /// The control master failed to start: the process exited early or
    /// the control socket never appeared within the timeout.
    #[error("Failed to connect to '{host}': {message}")]
    ConnectFailed {
        /// Canonical host.
        host: String,
        /// What went wrong.
        message: String,
    },

    /// A forward removal was requested for a forward that was never
    /// added (or was already removed). Distinct from a generic failure
    /// so callers can treat it as "already gone".
    #[error("No port forward registered for '{spec}' on '{host}'")]
    ForwardNotFound {
        /// Canonical host.
        host: String,
        /// The `remote_host:remote_port` forward key.
        spec: String,
    },

    /// Attempt to remove a still-connected connection from the manager
    /// registry without disconnecting it first.
    #[error("Registry state error: {0}")]
    RegistryState(String),

    /// A bounded subprocess wait exceeded its deadline.
    #[error("Operation '{operation}' timed out after {seconds} seconds")]
    Timeout {
        /// The operation whose wait expired.
        operation: String,
        /// The deadline that was exceeded, in seconds.
        seconds: u64,
    },

    /// A spawned process exited with a non-zero status where success
    /// was required.
    #[error("Operation '{operation}' failed with exit code {exit_code}: {stderr}")]
    ProcessFailed {
        /// The operation that ran the process.
        operation: String,
        /// Exit code reported by the process (`-1` if killed by signal).
        exit_code: i32,
        /// Captured standard error.
        stderr: String,
    },

    /// The hostname could not be canonicalized.
    #[error("Failed to resolve host '{host}': {message}")]
    HostResolution {
        /// Hostname as supplied by the caller.
        host: String,
        /// Resolver error message.
        message: String,
    },

    /// I/O error while spawning processes or touching the filesystem.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
