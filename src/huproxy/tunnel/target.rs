use std::fmt;

use crate::huproxy::{net, tunnel::error::SetupError};

/// A validated `(host, port)` pair to dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    host: String,
    port: String,
}

impl Target {
    /// Both parts are required; nothing is resolved or dialed here.
    pub fn new(host: &str, port: &str) -> Result<Self, SetupError> {
        let host = host.trim();
        let port = port.trim();
        if host.is_empty() || port.is_empty() {
            return Err(SetupError::MissingTarget);
        }
        Ok(Self {
            host: host.to_string(),
            port: port.to_string(),
        })
    }

    pub fn addr(&self) -> String {
        net::join_host_port(&self.host, &self.port)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr())
    }
}

/// Pick the tunnel target for a request.
///
/// A `Connect: host:port` header wins over path parameters. A header that does not split into
/// host and port yields empty parts, which the caller then rejects as a missing target.
pub fn resolve(connect_header: Option<&str>, path: Option<(String, String)>) -> (String, String) {
    match connect_header.map(str::trim).filter(|h| !h.is_empty()) {
        Some(h) => net::split_host_port(h).unwrap_or_default(),
        None => path.unwrap_or_default(),
    }
}
