//! Local port allocation for forward listeners.
//!
//! The connection layer never picks port numbers itself; it asks a
//! [`PortAllocator`]. The OS-backed allocator is the production choice,
//! the range allocator gives deterministic ports for tests and for
//! embedders that must confine forwards to a firewall window.

use std::net::TcpListener;
use std::ops::RangeInclusive;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Hands out unused local TCP port numbers.
pub trait PortAllocator: Send + Sync {
    /// Allocate one unused local port.
    fn allocate(&self) -> Result<u16>;
}

/// Asks the operating system for an ephemeral port by binding port 0.
///
/// The listener is dropped before the port is handed to ssh, so there
/// is a small reuse window; acceptable because ssh itself fails loudly
/// if the port is taken by the time it binds.
#[derive(Debug, Default, Clone)]
pub struct OsPortAllocator;

impl OsPortAllocator {
    /// Create a new OS-backed allocator.
    pub fn new() -> Self {
        Self
    }
}

impl PortAllocator for OsPortAllocator {
    fn allocate(&self) -> Result<u16> {
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        Ok(listener.local_addr()?.port())
    }
}

/// Hands out ports from a fixed window, never repeating one.
#[derive(Debug)]
pub struct RangePortAllocator {
    end: u16,
    next: Mutex<u32>,
}

impl RangePortAllocator {
    /// Create an allocator over an inclusive port range.
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            end: *range.end(),
            next: Mutex::new(u32::from(*range.start())),
        }
    }
}

impl PortAllocator for RangePortAllocator {
    fn allocate(&self) -> Result<u16> {
        let mut next = self.next.lock();
        if *next > u32::from(self.end) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("port range exhausted at {}", self.end),
            )));
        }
        let port = *next as u16;
        *next += 1;
        Ok(port)
    }
}
