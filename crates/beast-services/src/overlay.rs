//! Overlay peer directories.
//!
//! - NetBird: management API, `GET {api_url}/api/peers` with a bearer token.
//! - Tailscale: tailscaled LocalAPI, `GET /localapi/v0/status` over the
//!   daemon's Unix socket (reqwest's Unix socket transport).
//!
//! Both return the complete peer list; the classifier caches it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::classifier::PeerDirectory;
use crate::peer_cache::PeerRecord;

/// Upper bound on one directory request.
pub const DIRECTORY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    /// The directory is not reachable in this deployment (no socket, no
    /// token). Expected, logged quietly.
    #[error("directory unavailable: {0}")]
    Unavailable(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("directory returned status {0}")]
    Status(u16),

    #[error("failed to parse directory response: {0}")]
    Parse(#[from] serde_json::Error),
}

// ── NetBird ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct NetBirdPeer {
    #[serde(default)]
    ip: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    ip_addresses: Vec<String>,
}

pub struct NetBirdDirectory {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

impl NetBirdDirectory {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Result<Self, DirectoryError> {
        let client = reqwest::Client::builder()
            .timeout(DIRECTORY_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }
}

#[async_trait]
impl PeerDirectory for NetBirdDirectory {
    async fn list_peers(&self) -> Result<Vec<PeerRecord>, DirectoryError> {
        if self.token.is_empty() {
            return Err(DirectoryError::Unavailable("no NetBird API token".into()));
        }

        let response = self
            .client
            .get(format!("{}/api/peers", self.api_url))
            .bearer_auth(&self.token)
            .header("Content-Type", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DirectoryError::Status(response.status().as_u16()));
        }

        let body = response.bytes().await?;
        parse_netbird_peers(&body)
    }
}

/// Convert a NetBird `/api/peers` body. Peers without a usable address are
/// skipped; the display name is `name`, falling back to `hostname`.
pub fn parse_netbird_peers(body: &[u8]) -> Result<Vec<PeerRecord>, DirectoryError> {
    let peers: Vec<NetBirdPeer> = serde_json::from_slice(body)?;
    Ok(peers
        .into_iter()
        .filter_map(|p| {
            let address: IpAddr = p.ip.parse().ok()?;
            let name = p
                .name
                .filter(|n| !n.is_empty())
                .or(p.hostname.filter(|h| !h.is_empty()));
            let extra_addresses = p
                .ip_addresses
                .iter()
                .filter_map(|a| a.parse().ok())
                .filter(|a| *a != address)
                .collect();
            Some(PeerRecord {
                address,
                name,
                extra_addresses,
            })
        })
        .collect())
}

// ── Tailscale ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TailscaleStatus {
    #[serde(rename = "Peer", default)]
    peer: HashMap<String, TailscalePeer>,
}

#[derive(Debug, Deserialize)]
struct TailscalePeer {
    #[serde(rename = "HostName", default)]
    host_name: String,
    #[serde(rename = "TailscaleIPs", default)]
    tailscale_ips: Vec<IpAddr>,
}

/// Host part of LocalAPI URLs. tailscaled ignores it; the socket decides
/// where the request goes.
const LOCALAPI_STATUS_URL: &str = "http://local-tailscaled.sock/localapi/v0/status";

pub struct TailscaleDirectory {
    client: reqwest::Client,
    socket: PathBuf,
}

impl TailscaleDirectory {
    pub fn new(socket: impl Into<PathBuf>) -> Result<Self, DirectoryError> {
        let socket = socket.into();
        let client = reqwest::Client::builder()
            .unix_socket(socket.clone())
            .timeout(DIRECTORY_TIMEOUT)
            .build()?;
        Ok(Self { client, socket })
    }
}

#[async_trait]
impl PeerDirectory for TailscaleDirectory {
    async fn list_peers(&self) -> Result<Vec<PeerRecord>, DirectoryError> {
        if !self.socket.exists() {
            return Err(DirectoryError::Unavailable(format!(
                "no tailscaled socket at {}",
                self.socket.display()
            )));
        }

        let response = self
            .client
            .get(LOCALAPI_STATUS_URL)
            .header("Sec-Tailscale", "localapi")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DirectoryError::Status(response.status().as_u16()));
        }

        let status: TailscaleStatus = response.json().await?;
        Ok(tailscale_peers(status))
    }
}

/// Each peer maps all of its Tailscale addresses; the first one is the
/// primary.
fn tailscale_peers(status: TailscaleStatus) -> Vec<PeerRecord> {
    status
        .peer
        .into_values()
        .filter_map(|p| {
            let mut ips = p.tailscale_ips.into_iter();
            let address = ips.next()?;
            Some(PeerRecord {
                address,
                name: (!p.host_name.is_empty()).then_some(p.host_name),
                extra_addresses: ips.collect(),
            })
        })
        .collect()
}
