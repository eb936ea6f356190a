//! Configuration system for the Beast relay.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $BEAST_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/beast-relay/config.toml
//!   3. ~/.config/beast-relay/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BeastConfig {
    pub network: NetworkConfig,
    pub stats: StatsConfig,
    pub store: StoreConfig,
    pub netbird: NetBirdConfig,
    pub tailscale: TailscaleConfig,
    pub geoip: GeoIpConfig,
    pub mlat: MlatConfig,
    pub readsb: ReadsbConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address feeders connect to.
    pub listen_host: String,
    pub listen_port: u16,
    /// Aggregator that receives the relayed Beast stream.
    pub upstream_host: String,
    pub upstream_port: u16,
    /// Upper bound on opening the upstream connection.
    pub connect_timeout_secs: u64,
    /// Loopback status API port. 0 = disabled.
    pub api_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Seconds between reconciler ticks.
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetBirdConfig {
    pub enabled: bool,
    pub cidr: String,
    /// Management API base URL.
    pub api_url: String,
    /// Personal access token. Empty = no peer lookups, range-only matching.
    pub api_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TailscaleConfig {
    pub enabled: bool,
    pub cidr: String,
    /// tailscaled LocalAPI socket.
    pub api_socket: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoIpConfig {
    pub enabled: bool,
    /// GeoLite2-City database.
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MlatConfig {
    /// mlat-server clients.json.
    pub clients_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadsbConfig {
    /// readsb aircraft.json.
    pub aircraft_path: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

/// Default CGNAT range shared by both overlay networks.
pub const DEFAULT_OVERLAY_CIDR: &str = "100.64.0.0/10";

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 30004,
            upstream_host: "readsb".to_string(),
            upstream_port: 30006,
            connect_timeout_secs: 10,
            api_port: 8090,
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self { interval_secs: 30 }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: data_dir().join("aggregator.db"),
        }
    }
}

impl Default for NetBirdConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cidr: DEFAULT_OVERLAY_CIDR.to_string(),
            api_url: "http://localhost:33073".to_string(),
            api_token: String::new(),
        }
    }
}

impl Default for TailscaleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cidr: DEFAULT_OVERLAY_CIDR.to_string(),
            api_socket: PathBuf::from("/var/run/tailscale/tailscaled.sock"),
        }
    }
}

impl Default for GeoIpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            db_path: PathBuf::from("/app/GeoLite2-City.mmdb"),
        }
    }
}

impl Default for MlatConfig {
    fn default() -> Self {
        Self {
            clients_path: PathBuf::from("/mlat-data/clients.json"),
        }
    }
}

impl Default for ReadsbConfig {
    fn default() -> Self {
        Self {
            aircraft_path: PathBuf::from("/run/readsb/aircraft.json"),
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

impl StatsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("beast-relay")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("beast-relay")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl BeastConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            BeastConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("BEAST_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&BeastConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply BEAST_<SECTION>__<KEY> overrides. `lookup` is the environment
    /// in production and a map in tests.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let flag = |v: String| v == "true" || v == "1";

        if let Some(v) = lookup("BEAST_NETWORK__LISTEN_HOST") {
            self.network.listen_host = v;
        }
        if let Some(p) = lookup("BEAST_NETWORK__LISTEN_PORT").and_then(|v| v.parse().ok()) {
            self.network.listen_port = p;
        }
        if let Some(v) = lookup("BEAST_NETWORK__UPSTREAM_HOST") {
            self.network.upstream_host = v;
        }
        if let Some(p) = lookup("BEAST_NETWORK__UPSTREAM_PORT").and_then(|v| v.parse().ok()) {
            self.network.upstream_port = p;
        }
        if let Some(s) = lookup("BEAST_NETWORK__CONNECT_TIMEOUT_SECS").and_then(|v| v.parse().ok())
        {
            self.network.connect_timeout_secs = s;
        }
        if let Some(p) = lookup("BEAST_NETWORK__API_PORT").and_then(|v| v.parse().ok()) {
            self.network.api_port = p;
        }
        if let Some(s) = lookup("BEAST_STATS__INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.stats.interval_secs = s;
        }
        if let Some(v) = lookup("BEAST_STORE__DB_PATH") {
            self.store.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("BEAST_NETBIRD__ENABLED") {
            self.netbird.enabled = flag(v);
        }
        if let Some(v) = lookup("BEAST_NETBIRD__CIDR") {
            self.netbird.cidr = v;
        }
        if let Some(v) = lookup("BEAST_NETBIRD__API_URL") {
            self.netbird.api_url = v;
        }
        if let Some(v) = lookup("BEAST_NETBIRD__API_TOKEN") {
            self.netbird.api_token = v;
        }
        if let Some(v) = lookup("BEAST_TAILSCALE__ENABLED") {
            self.tailscale.enabled = flag(v);
        }
        if let Some(v) = lookup("BEAST_TAILSCALE__CIDR") {
            self.tailscale.cidr = v;
        }
        if let Some(v) = lookup("BEAST_TAILSCALE__API_SOCKET") {
            self.tailscale.api_socket = PathBuf::from(v);
        }
        if let Some(v) = lookup("BEAST_GEOIP__ENABLED") {
            self.geoip.enabled = flag(v);
        }
        if let Some(v) = lookup("BEAST_GEOIP__DB_PATH") {
            self.geoip.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("BEAST_MLAT__CLIENTS_PATH") {
            self.mlat.clients_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("BEAST_READSB__AIRCRAFT_PATH") {
            self.readsb.aircraft_path = PathBuf::from(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_deployment() {
        let config = BeastConfig::default();
        assert_eq!(config.network.listen_port, 30004);
        assert_eq!(config.network.upstream_host, "readsb");
        assert_eq!(config.network.upstream_port, 30006);
        assert_eq!(config.stats.interval_secs, 30);
        assert!(config.tailscale.enabled);
        assert!(!config.netbird.enabled);
        assert!(!config.geoip.enabled);
        assert_eq!(config.netbird.cidr, config.tailscale.cidr);
    }

    #[test]
    fn overrides_replace_values() {
        let env: HashMap<&str, &str> = [
            ("BEAST_NETWORK__LISTEN_PORT", "4000"),
            ("BEAST_NETWORK__UPSTREAM_HOST", "127.0.0.1"),
            ("BEAST_NETBIRD__ENABLED", "1"),
            ("BEAST_NETBIRD__API_TOKEN", "secret"),
            ("BEAST_TAILSCALE__ENABLED", "false"),
            ("BEAST_STATS__INTERVAL_SECS", "5"),
        ]
        .into_iter()
        .collect();

        let mut config = BeastConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.network.listen_port, 4000);
        assert_eq!(config.network.upstream_host, "127.0.0.1");
        assert!(config.netbird.enabled);
        assert_eq!(config.netbird.api_token, "secret");
        assert!(!config.tailscale.enabled);
        assert_eq!(config.stats.interval(), Duration::from_secs(5));
    }

    #[test]
    fn unparsable_numbers_are_ignored() {
        let mut config = BeastConfig::default();
        config.apply_overrides(|k| (k == "BEAST_NETWORK__LISTEN_PORT").then(|| "abc".to_string()));
        assert_eq!(config.network.listen_port, 30004);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = BeastConfig::from_toml(
            r#"
            [network]
            upstream_port = 40000

            [netbird]
            enabled = true
            "#,
        )
        .expect("partial config parses");
        assert_eq!(config.network.upstream_port, 40000);
        assert_eq!(config.network.listen_port, 30004);
        assert!(config.netbird.enabled);
        assert_eq!(config.netbird.api_url, "http://localhost:33073");
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = std::env::temp_dir().join(format!("beast-config-test-{}", std::process::id()));
        let config_path = tmp.join("config.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        unsafe {
            std::env::set_var("BEAST_CONFIG", config_path.to_str().unwrap());
        }

        let path = BeastConfig::write_default_if_missing().expect("write_default_if_missing failed");
        assert!(path.exists());

        let config = BeastConfig::load().expect("load should succeed");
        assert_eq!(config.network.listen_port, 30004);

        unsafe {
            std::env::remove_var("BEAST_CONFIG");
        }
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
