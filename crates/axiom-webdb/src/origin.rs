//! Security origins
//!
//! Databases are namespaced by scheme, host and port. The tracker stores an
//! origin by its database identifier, which is also the name of the origin's
//! directory on disk.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::DatabaseError;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SecurityOrigin {
    scheme: String,
    host: String,
    port: u16,
}

impl SecurityOrigin {
    pub fn new(scheme: &str, host: &str, port: u16) -> Self {
        Self {
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_ascii_lowercase(),
            port,
        }
    }

    /// Origin of a document URL. Ports default per scheme.
    pub fn from_url(url: &str) -> Result<Self> {
        let parsed =
            Url::parse(url).map_err(|e| DatabaseError::InvalidOrigin(format!("{url}: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| DatabaseError::InvalidOrigin(format!("{url}: no host")))?;
        let port = parsed.port_or_known_default().unwrap_or(0);

        Ok(Self::new(parsed.scheme(), host, port))
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `scheme_host_port`, safe to use as a file name. Host bytes outside
    /// `[a-z0-9.-]` are percent-encoded so the identifier splits back
    /// unambiguously.
    pub fn database_identifier(&self) -> String {
        let mut host = String::with_capacity(self.host.len());
        for byte in self.host.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'.' || byte == b'-' {
                host.push(byte as char);
            } else {
                host.push_str(&format!("%{byte:02X}"));
            }
        }
        format!("{}_{}_{}", self.scheme, host, self.port)
    }

    pub fn from_database_identifier(identifier: &str) -> Option<Self> {
        let (scheme, rest) = identifier.split_once('_')?;
        let (host, port) = rest.rsplit_once('_')?;
        let port = port.parse().ok()?;

        let mut decoded = Vec::with_capacity(host.len());
        let bytes = host.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'%' && i + 2 < bytes.len() {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok()?;
                decoded.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            } else {
                decoded.push(bytes[i]);
                i += 1;
            }
        }
        let host = String::from_utf8(decoded).ok()?;

        Some(Self::new(scheme, &host, port))
    }
}

impl std::fmt::Display for SecurityOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}
