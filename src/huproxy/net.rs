use std::borrow::Cow;

/// Normalize a bind/listen address.
///
/// Accepts the shorthand `":PORT"` for "bind on all interfaces", which Tokio bind APIs do not
/// understand, and rewrites it to `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Combine host and port into a dialable `host:port`, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Split `host:port` (or `[v6]:port`) into its parts.
///
/// Returns `None` for anything that is not exactly one host and one port.
pub fn split_host_port(addr: &str) -> Option<(String, String)> {
    let addr = addr.trim();
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?;
        if port.contains(':') {
            return None;
        }
        return Some((host.to_string(), port.to_string()));
    }

    let (host, port) = addr.rsplit_once(':')?;
    if host.contains(':') {
        // Unbracketed IPv6 literal: ambiguous.
        return None;
    }
    Some((host.to_string(), port.to_string()))
}
