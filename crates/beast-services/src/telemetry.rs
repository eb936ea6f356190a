//! Per-tick telemetry: MLAT client state and the aggregator's aircraft count.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One feeder as reported by the MLAT server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MlatClient {
    pub name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub message_rate: Option<f64>,
    pub peer_count: Option<u32>,
}

#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// MLAT clients currently connected, keyed by source address.
    async fn live_clients(&self) -> Result<HashMap<IpAddr, MlatClient>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AircraftCount {
    pub total: usize,
    pub with_position: usize,
}

#[async_trait]
pub trait AircraftCounter: Send + Sync {
    async fn current_count(&self) -> Result<AircraftCount>;
}

// ── mlat-server clients.json ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ClientEntry {
    #[serde(default)]
    user: Option<String>,
    source_ip: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    alt: Option<f64>,
    message_rate: Option<f64>,
    peer_count: Option<u32>,
}

pub struct MlatClientsFile {
    path: PathBuf,
}

impl MlatClientsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TelemetrySource for MlatClientsFile {
    async fn live_clients(&self) -> Result<HashMap<IpAddr, MlatClient>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            // No MLAT server writing here yet: nobody is live.
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read {}", self.path.display()))
            }
        };
        parse_clients(&raw)
    }
}

/// Parse `clients.json`: an object keyed by user name. Entries without a
/// parseable `source_ip` are dropped.
pub fn parse_clients(raw: &[u8]) -> Result<HashMap<IpAddr, MlatClient>> {
    let entries: HashMap<String, ClientEntry> =
        serde_json::from_slice(raw).context("invalid clients.json")?;

    Ok(entries
        .into_iter()
        .filter_map(|(key, entry)| {
            let addr: IpAddr = entry.source_ip.as_deref()?.parse().ok()?;
            let client = MlatClient {
                name: entry.user.unwrap_or(key),
                latitude: entry.lat,
                longitude: entry.lon,
                altitude: entry.alt,
                message_rate: entry.message_rate,
                peer_count: entry.peer_count,
            };
            Some((addr.to_canonical(), client))
        })
        .collect())
}

// ── readsb aircraft.json ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AircraftFile {
    #[serde(default)]
    aircraft: Vec<serde_json::Map<String, serde_json::Value>>,
}

pub struct AircraftJson {
    path: PathBuf,
}

impl AircraftJson {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AircraftCounter for AircraftJson {
    async fn current_count(&self) -> Result<AircraftCount> {
        let raw = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        count_aircraft(&raw)
    }
}

pub fn count_aircraft(raw: &[u8]) -> Result<AircraftCount> {
    let file: AircraftFile = serde_json::from_slice(raw).context("invalid aircraft.json")?;
    let with_position = file
        .aircraft
        .iter()
        .filter(|a| a.contains_key("lat") && a.contains_key("lon"))
        .count();
    Ok(AircraftCount {
        total: file.aircraft.len(),
        with_position,
    })
}
