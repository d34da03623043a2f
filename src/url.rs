//! Server address parsing

use anyhow::{bail, Context, Result};

/// Split `HOST` or `HOST:PORT`. `[v6]:PORT` is accepted for IPv6 literals.
pub fn parse_host(s: &str, default_port: u16) -> Result<(String, u16)> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty server address");
    }
    if let Some(rest) = s.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .with_context(|| format!("unterminated IPv6 literal in {}", s))?;
        return match tail.strip_prefix(':') {
            Some(port) => Ok((host.to_string(), parse_port(port)?)),
            None if tail.is_empty() => Ok((host.to_string(), default_port)),
            None => bail!("unexpected text after address: {}", s),
        };
    }
    match s.rsplit_once(':') {
        // A bare IPv6 address has several colons and no port
        Some((host, _)) if host.contains(':') => Ok((s.to_string(), default_port)),
        Some((host, port)) if !host.is_empty() => Ok((host.to_string(), parse_port(port)?)),
        Some(_) => bail!("missing host in {}", s),
        None => Ok((s.to_string(), default_port)),
    }
}

fn parse_port(s: &str) -> Result<u16> {
    s.parse().with_context(|| format!("invalid port {:?}", s))
}
