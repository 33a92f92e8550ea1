//! # sshmux - multiplexed SSH connection management
//!
//! sshmux pools remote command execution, file transfer, and local port
//! forwarding over persistent OpenSSH *control master* connections, one
//! per canonical remote host. The authenticated network connection is
//! paid for once; every later operation rides the established channel
//! through its control socket.
//!
//! The crate drives the external OpenSSH client family (`ssh`, `scp`,
//! `rsync`) - it does not implement the SSH wire protocol, and it
//! assumes public-key authentication (password prompts are disabled on
//! every invocation). Host-key checking stays strict.
//!
//! ## Core types
//!
//! - [`SshConnection`]: the lifecycle of one multiplexed channel to one
//!   host - connect (adopting an already-running master when one
//!   answers a probe), run commands, transfer files, manage forwards,
//!   disconnect. A keepalive sub-connection rides the master so health
//!   can be polled cheaply via [`SshConnection::is_connected`].
//! - [`SshConnectionManager`]: a registry keyed by canonical host with
//!   get-or-create semantics, per-host dispatchers, and bulk teardown.
//!
//! The external collaborators - process execution, port allocation, and
//! hostname canonicalization - are traits ([`ProcessRunner`],
//! [`PortAllocator`], [`HostResolver`]) with production implementations,
//! so embedders and tests can substitute their own.
//!
//! ## Example
//!
//! ```rust,ignore
//! use sshmux::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> sshmux::Result<()> {
//!     let manager = SshConnectionManager::with_defaults(MuxConfig::default());
//!
//!     // First call connects; later calls reuse the same channel.
//!     let conn = manager.get("web01").await?;
//!     conn.run_command("systemctl restart nginx").await?;
//!
//!     let local = manager.request_forward("web01", "db.internal", 5432).await?;
//!     println!("postgres reachable on 127.0.0.1:{local}");
//!
//!     manager.close_all().await
//! }
//! ```
//!
//! ## Concurrency
//!
//! A connection shared through the manager is safe for concurrent use:
//! operations on one connection serialize behind its internal lock, so
//! sequential callers observe the effects of all prior operations.
//! Nothing retries or reconnects automatically; callers wanting
//! resilience combine [`SshConnection::is_connected`] with
//! [`SshConnection::connect`] themselves.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod openssh;
pub mod ports;
pub mod process;
pub mod resolver;

pub use config::MuxConfig;
pub use connection::SshConnection;
pub use error::{Error, Result};
pub use manager::SshConnectionManager;
pub use ports::{OsPortAllocator, PortAllocator, RangePortAllocator};
pub use process::{Argv, OpenSshRunner, ProcessHandle, ProcessOutput, ProcessRunner};
pub use resolver::{DnsHostResolver, HostResolver, StaticHostResolver};

/// Convenient re-exports of the commonly used types.
pub mod prelude {
    pub use crate::config::MuxConfig;
    pub use crate::connection::SshConnection;
    pub use crate::error::{Error, Result};
    pub use crate::manager::SshConnectionManager;
    pub use crate::ports::{OsPortAllocator, PortAllocator, RangePortAllocator};
    pub use crate::process::{Argv, OpenSshRunner, ProcessOutput, ProcessRunner};
    pub use crate::resolver::{DnsHostResolver, HostResolver, StaticHostResolver};
}
