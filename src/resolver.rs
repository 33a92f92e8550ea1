//! Canonical host identity.
//!
//! The manager keys its registry by the fully-qualified form of a
//! hostname, so `web01` and `web01.example.com` share one connection
//! when they are the same machine. [`HostResolver`] is the seam;
//! [`DnsHostResolver`] asks the system resolver for the canonical name,
//! [`StaticHostResolver`] serves tests and air-gapped setups from a
//! fixed alias table.

use std::collections::HashMap;

use dns_lookup::{getaddrinfo, AddrInfoHints};

use crate::error::{Error, Result};

/// Resolves a caller-supplied hostname to its canonical registry key.
pub trait HostResolver: Send + Sync {
    /// Fully-qualify `host`. Equivalent spellings of the same machine
    /// must map to the same string.
    fn canonicalize(&self, host: &str) -> Result<String>;
}

/// System-resolver-backed canonicalization via getaddrinfo with the
/// canonical-name flag. Falls back to the input spelling (lowercased)
/// when the resolver returns no canonical name.
#[derive(Debug, Default, Clone)]
pub struct DnsHostResolver;

impl DnsHostResolver {
    /// Create a new DNS-backed resolver.
    pub fn new() -> Self {
        Self
    }
}

impl HostResolver for DnsHostResolver {
    fn canonicalize(&self, host: &str) -> Result<String> {
        let hints = AddrInfoHints {
            flags: libc::AI_CANONNAME,
            ..AddrInfoHints::default()
        };

        let entries = getaddrinfo(Some(host), None, Some(hints)).map_err(|e| {
            Error::HostResolution {
                host: host.to_string(),
                message: std::io::Error::from(e).to_string(),
            }
        })?;

        for entry in entries {
            let entry = entry.map_err(|e| Error::HostResolution {
                host: host.to_string(),
                message: e.to_string(),
            })?;
            if let Some(name) = entry.canonname {
                return Ok(name.to_lowercase());
            }
        }

        Ok(host.to_lowercase())
    }
}

/// Canonicalizes from a fixed alias table; unknown names map to
/// themselves, lowercased.
#[derive(Debug, Default, Clone)]
pub struct StaticHostResolver {
    aliases: HashMap<String, String>,
}

impl StaticHostResolver {
    /// Create a resolver from `(alias, canonical)` pairs.
    pub fn new<I, S, T>(aliases: I) -> Self
    where
        I: IntoIterator<Item = (S, T)>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            aliases: aliases
                .into_iter()
                .map(|(alias, canonical)| (alias.into().to_lowercase(), canonical.into().to_lowercase()))
                .collect(),
        }
    }
}

impl HostResolver for StaticHostResolver {
    fn canonicalize(&self, host: &str) -> Result<String> {
        let lowered = host.to_lowercase();
        Ok(self.aliases.get(&lowered).cloned().unwrap_or(lowered))
    }
}
