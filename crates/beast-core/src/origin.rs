//! Connection origin: where a feeder connection comes from.

use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Network origin of a feeder connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// NetBird peer. The primary overlay network.
    NetBird,
    /// Tailscale peer.
    Tailscale,
    /// Anything else.
    Public,
}

impl Origin {
    /// Stored/displayed name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetBird => "netbird",
            Self::Tailscale => "tailscale",
            Self::Public => "public",
        }
    }

    pub fn is_overlay(&self) -> bool {
        !matches!(self, Self::Public)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Ranges ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
#[error("invalid address range {input:?}")]
pub struct CidrError {
    input: String,
    #[source]
    source: ipnet::AddrParseError,
}

/// Parse an overlay range such as `100.64.0.0/10`.
///
/// A bare address is a single-host range. Host bits are cleared, so
/// `100.64.1.2/10` becomes `100.64.0.0/10`.
pub fn parse_range(s: &str) -> Result<IpNet, CidrError> {
    let s = s.trim();
    if let Ok(addr) = s.parse::<IpAddr>() {
        return Ok(IpNet::from(addr));
    }
    s.parse::<IpNet>()
        .map(|net| net.trunc())
        .map_err(|source| CidrError {
            input: s.to_string(),
            source,
        })
}
