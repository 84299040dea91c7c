/// Utility functions and helpers
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use crate::error::{PasarelaError, PasarelaResult};

/// Generate a unique ID based on timestamp and random component
pub fn generate_id(prefix: &str) -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();

    let random: u32 = rand::random();
    format!("{}-{}-{:x}", prefix, timestamp, random)
}

/// Short hex fingerprint of a byte string, safe to log in place of secrets
pub fn short_digest(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex::encode(&digest[..6])
}

/// A backend address split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAddress {
    /// `host:port` without the group suffix
    pub address: String,
    /// Set when the host is a literal IP; host names are left to the caller's resolver
    pub socket_addr: Option<SocketAddr>,
    pub group: Option<String>,
}

/// Parse `host:port[@group]`.
///
/// IPv6 literals must be bracketed (`[::1]:3306`).
pub fn parse_backend_address(input: &str) -> PasarelaResult<ParsedAddress> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(PasarelaError::malformed(input, "empty address"));
    }

    let (host_port, group) = match trimmed.split_once('@') {
        Some((_, "")) => return Err(PasarelaError::malformed(input, "empty group name")),
        Some((host_port, group)) => (host_port, Some(group.to_string())),
        None => (trimmed, None),
    };

    if let Ok(socket_addr) = host_port.parse::<SocketAddr>() {
        return Ok(ParsedAddress {
            address: socket_addr.to_string(),
            socket_addr: Some(socket_addr),
            group,
        });
    }

    let (host, port) = host_port
        .rsplit_once(':')
        .ok_or_else(|| PasarelaError::malformed(input, "missing port"))?;

    if host.is_empty() {
        return Err(PasarelaError::malformed(input, "missing host"));
    }
    if host.contains(':') || host.starts_with('[') {
        return Err(PasarelaError::malformed(input, "invalid IPv6 literal"));
    }
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
    {
        return Err(PasarelaError::malformed(input, "invalid host name"));
    }
    port.parse::<u16>()
        .map_err(|_| PasarelaError::malformed(input, format!("invalid port '{}'", port)))?;

    Ok(ParsedAddress {
        address: host_port.to_string(),
        socket_addr: None,
        group,
    })
}

/// Format duration for human-readable output
pub fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
