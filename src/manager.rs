//! Process-wide connection registry.
//!
//! [`SshConnectionManager`] maps canonical host identity to one shared
//! [`SshConnection`], so unrelated callers asking for "a connection to
//! host X" transparently reuse one multiplexed channel instead of each
//! opening their own. Construct one at application startup and pass it
//! by reference; there is no hidden global.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::MuxConfig;
use crate::connection::SshConnection;
use crate::error::{Error, Result};
use crate::ports::{OsPortAllocator, PortAllocator};
use crate::process::{OpenSshRunner, ProcessRunner};
use crate::resolver::{DnsHostResolver, HostResolver};

/// Registry of multiplexed SSH connections, keyed by canonical host.
///
/// The registry lock is never held across an await; connections are
/// cloned out as `Arc`s first. Invariant: every value's host equals
/// its key, and no host has two entries.
pub struct SshConnectionManager {
    runner: Arc<dyn ProcessRunner>,
    allocator: Arc<dyn PortAllocator>,
    resolver: Arc<dyn HostResolver>,
    config: MuxConfig,
    connections: RwLock<HashMap<String, Arc<SshConnection>>>,
}

impl SshConnectionManager {
    /// Create a manager with injected collaborators.
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        allocator: Arc<dyn PortAllocator>,
        resolver: Arc<dyn HostResolver>,
        config: MuxConfig,
    ) -> Self {
        Self {
            runner,
            allocator,
            resolver,
            config,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Create a manager wired to the real OpenSSH tools, OS port
    /// allocation, and DNS canonicalization.
    pub fn with_defaults(config: MuxConfig) -> Self {
        Self::new(
            Arc::new(OpenSshRunner::new()),
            Arc::new(OsPortAllocator::new()),
            Arc::new(DnsHostResolver::new()),
            config,
        )
    }

    /// Get the connection for `host`, creating and connecting one if
    /// none is registered. This is the only method that implicitly
    /// creates a connection.
    pub async fn get(&self, host: &str) -> Result<Arc<SshConnection>> {
        let canonical = self.resolver.canonicalize(host)?;

        if let Some(connection) = self.connections.read().get(&canonical).cloned() {
            return Ok(connection);
        }

        let connection = Arc::new(SshConnection::new(
            canonical.clone(),
            self.runner.clone(),
            self.allocator.clone(),
            self.config.clone(),
        ));
        connection.connect().await?;

        // Another task may have registered the host while we were
        // connecting; keep the earlier entry and fold ours back down.
        let raced = {
            let mut connections = self.connections.write();
            match connections.get(&canonical) {
                Some(existing) => Some(existing.clone()),
                None => {
                    debug!(host = %canonical, "Registered new connection");
                    connections.insert(canonical.clone(), connection.clone());
                    None
                }
            }
        };

        if let Some(existing) = raced {
            warn!(host = %canonical, "Concurrent connect raced; discarding the younger connection");
            connection.disconnect().await?;
            return Ok(existing);
        }
        Ok(connection)
    }

    /// Alias for [`get`](Self::get).
    pub async fn open(&self, host: &str) -> Result<Arc<SshConnection>> {
        self.get(host).await
    }

    /// Register an already-constructed connection under its own host.
    /// Does not overwrite an existing entry.
    pub fn add_connection(&self, connection: Arc<SshConnection>) {
        let mut connections = self.connections.write();
        connections
            .entry(connection.host().to_string())
            .or_insert(connection);
    }

    /// Remove `connection` from the registry. Fails with
    /// [`Error::RegistryState`] while it is still connected; callers
    /// must disconnect first.
    pub async fn remove_connection(&self, connection: &SshConnection) -> Result<()> {
        if connection.is_connected().await {
            return Err(Error::RegistryState(format!(
                "connection to '{}' is still connected; disconnect before removing",
                connection.host()
            )));
        }
        self.connections.write().remove(connection.host());
        Ok(())
    }

    /// Unconditionally delete the registry entry for `name`. Does not
    /// check connection state; used during bulk teardown.
    pub fn remove_by_name(&self, name: &str) {
        self.connections.write().remove(name);
    }

    /// Disconnect the connection for `host` and remove it from the
    /// registry.
    pub async fn close(&self, host: &str) -> Result<()> {
        let canonical = self.resolver.canonicalize(host)?;
        let connection = self
            .connections
            .read()
            .get(&canonical)
            .cloned()
            .ok_or_else(|| {
                Error::RegistryState(format!("no connection registered for '{}'", canonical))
            })?;

        connection.disconnect().await?;
        self.remove_by_name(&canonical);
        Ok(())
    }

    /// Open a forward to `remote_host:remote_port` through the
    /// connection for `host`; returns the bound local port.
    pub async fn request_forward(
        &self,
        host: &str,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<u16> {
        self.get(host)
            .await?
            .add_port_forward(remote_host, remote_port)
            .await
    }

    /// Cancel the forward to `remote_host:remote_port` on the
    /// connection for `host`.
    pub async fn remove_forward(
        &self,
        host: &str,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<()> {
        self.get(host)
            .await?
            .remove_port_forward(remote_host, remote_port)
            .await
    }

    /// Upload `local_path` to `remote_path` on `host`.
    pub async fn put_file(&self, host: &str, local_path: &Path, remote_path: &str) -> Result<()> {
        self.get(host).await?.put_file(local_path, remote_path).await
    }

    /// Download `remote_path` from `host` to `local_path`.
    pub async fn get_file(&self, host: &str, remote_path: &str, local_path: &Path) -> Result<()> {
        self.get(host).await?.get_file(remote_path, local_path).await
    }

    /// Disconnect every registered connection and empty the registry.
    ///
    /// Meant for process shutdown: already-disconnected entries are
    /// skipped without error, teardown always runs to completion, and
    /// the first disconnect failure (if any) is returned afterwards.
    pub async fn close_all(&self) -> Result<()> {
        let drained: Vec<Arc<SshConnection>> = {
            let mut connections = self.connections.write();
            connections.drain().map(|(_, conn)| conn).collect()
        };

        let mut first_error: Option<Error> = None;
        for connection in drained {
            match connection.disconnect().await {
                Ok(()) => {}
                Err(Error::NotConnected { .. }) => {}
                Err(e) => {
                    warn!(host = %connection.host(), error = %e, "Failed to disconnect during close_all");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Canonical names of all registered connections.
    pub fn hosts(&self) -> Vec<String> {
        self.connections.read().keys().cloned().collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// `true` when no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}

impl std::fmt::Debug for SshConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnectionManager")
            .field("hosts", &self.hosts())
            .finish_non_exhaustive()
    }
}
