//! Durable feeder store.
//!
//! [`FeederStore`] is the seam the relay and reconciler write through;
//! [`SqliteStore`] is the production implementation: one `tokio_rusqlite`
//! connection in WAL mode. Statements run on the connection's own thread,
//! in call order, so runtime workers never block on SQLite.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, params_from_iter, OptionalExtension};
use serde::Serialize;
use tokio_rusqlite::Connection;

use beast_core::Origin;

use crate::session::Counters;

pub type FeederId = i64;
pub type ConnectionId = i64;

const SCHEMA_VERSION: i64 = 1;

/// SQLite `strftime` expression for "now" in the stored timestamp format.
const NOW: &str = "strftime('%Y-%m-%d %H:%M:%S','now')";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeederStatus {
    Active,
    Stale,
    Offline,
}

impl FeederStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Stale => "stale",
            Self::Offline => "offline",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "stale" => Some(Self::Stale),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

/// Identity of a feeder as seen on connect.
#[derive(Debug, Clone)]
pub struct NewFeeder {
    pub address: IpAddr,
    pub hostname: Option<String>,
    pub origin: Origin,
    pub location: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl NewFeeder {
    pub fn new(address: IpAddr, origin: Origin) -> Self {
        Self {
            address,
            hostname: None,
            origin,
            location: None,
            latitude: None,
            longitude: None,
        }
    }

    /// Display name for a feeder seen for the first time.
    pub fn display_name(&self) -> String {
        let tail: String = {
            let digits: Vec<char> = self
                .address
                .to_string()
                .chars()
                .filter(|c| *c != '.' && *c != ':')
                .collect();
            digits[digits.len().saturating_sub(4)..].iter().collect()
        };

        if let Some(host) = self.hostname.as_deref().filter(|h| !h.is_empty()) {
            return host.to_string();
        }
        match self.location.as_deref().filter(|l| !l.is_empty()) {
            Some(location) => {
                let slug = location.to_lowercase().replace(' ', "-").replace(',', "");
                format!("feeder-{slug}-{tail}")
            }
            None => format!("feeder-{tail}"),
        }
    }
}

/// MLAT state of a feeder at one reconciler tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MlatStatus {
    pub live: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
}

impl MlatStatus {
    pub fn offline() -> Self {
        Self::default()
    }
}

/// A stored feeder row.
#[derive(Debug, Clone, Serialize)]
pub struct FeederRecord {
    pub id: FeederId,
    pub name: String,
    pub address: String,
    pub hostname: Option<String>,
    pub origin: String,
    pub location: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub status: FeederStatus,
    pub bytes_received: u64,
    pub messages_received: u64,
    pub positions_received: u64,
    pub mlat_enabled: bool,
    pub last_seen: String,
}

/// Writes feeder lifecycle and counters.
#[async_trait]
pub trait FeederStore: Send + Sync {
    /// Create or refresh the feeder for this address; marks it active.
    async fn upsert_feeder(&self, feeder: &NewFeeder) -> Result<FeederId>;

    /// Open a connection record and log a "connected" event.
    async fn log_connection(&self, feeder_id: FeederId, address: IpAddr) -> Result<ConnectionId>;

    /// Close a connection record. Returns the connection duration in seconds
    /// as computed by the store. The feeder goes `offline`.
    async fn log_disconnection(
        &self,
        feeder_id: FeederId,
        connection_id: ConnectionId,
        bytes_transferred: u64,
    ) -> Result<i64>;

    /// Add a counter delta and mark the feeder active.
    async fn add_counters(&self, feeder_id: FeederId, delta: Counters) -> Result<()>;

    /// Mark the feeder active without new data.
    async fn touch(&self, feeder_id: FeederId) -> Result<()>;

    async fn set_mlat_status(&self, feeder_id: FeederId, status: MlatStatus) -> Result<()>;

    /// Every `active` feeder not in `live` becomes `stale`. Returns how many
    /// rows changed.
    async fn mark_stale_except(&self, live: &HashSet<FeederId>) -> Result<usize>;
}

// ── SQLite ────────────────────────────────────────────────────────────────────

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (and if needed create) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .await
            .with_context(|| format!("failed to open database {}", path.display()))?;
        conn.call(|conn: &mut rusqlite::Connection| {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.busy_timeout(Duration::from_secs(5))?;
            Ok(())
        })
        .await
        .context("failed to configure database")?;

        Self::init(conn).await
    }

    /// Ephemeral database, used by tests.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        conn.call(|conn: &mut rusqlite::Connection| {
            conn.pragma_update(None, "foreign_keys", "ON")?;
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS schema_version (
                    version INTEGER PRIMARY KEY
                );

                CREATE TABLE IF NOT EXISTS feeders (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    conn_type TEXT NOT NULL,
                    ip_address TEXT NOT NULL UNIQUE,
                    hostname TEXT,
                    location TEXT,
                    latitude REAL,
                    longitude REAL,
                    altitude REAL,
                    first_seen TEXT NOT NULL,
                    last_seen TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'active',
                    bytes_received INTEGER NOT NULL DEFAULT 0,
                    messages_received INTEGER NOT NULL DEFAULT 0,
                    positions_received INTEGER NOT NULL DEFAULT 0,
                    mlat_enabled INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS connections (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    feeder_id INTEGER NOT NULL REFERENCES feeders(id) ON DELETE CASCADE,
                    ip_address TEXT NOT NULL,
                    connected_at TEXT NOT NULL,
                    disconnected_at TEXT,
                    duration_seconds INTEGER,
                    bytes_transferred INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS activity_log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    event_type TEXT NOT NULL,
                    feeder_id INTEGER REFERENCES feeders(id) ON DELETE CASCADE,
                    message TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%S','now'))
                );

                CREATE INDEX IF NOT EXISTS idx_feeders_status ON feeders(status);
                CREATE INDEX IF NOT EXISTS idx_connections_feeder ON connections(feeder_id);
                CREATE INDEX IF NOT EXISTS idx_activity_feeder ON activity_log(feeder_id, created_at);
                "#,
            )?;
            conn.execute(
                "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
            Ok(())
        })
        .await
        .context("failed to create schema")?;

        Ok(Self { conn })
    }

    /// Fetch one feeder row.
    pub async fn feeder(&self, id: FeederId) -> Result<Option<FeederRecord>> {
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                let row = conn
                    .query_row(
                        "SELECT id, name, ip_address, hostname, conn_type, location, latitude,
                                longitude, altitude, status, bytes_received, messages_received,
                                positions_received, mlat_enabled, last_seen
                         FROM feeders WHERE id = ?1",
                        params![id],
                        |row| {
                            let status: String = row.get(9)?;
                            Ok(FeederRecord {
                                id: row.get(0)?,
                                name: row.get(1)?,
                                address: row.get(2)?,
                                hostname: row.get(3)?,
                                origin: row.get(4)?,
                                location: row.get(5)?,
                                latitude: row.get(6)?,
                                longitude: row.get(7)?,
                                altitude: row.get(8)?,
                                status: FeederStatus::parse(&status)
                                    .unwrap_or(FeederStatus::Offline),
                                bytes_received: row.get::<_, i64>(10)? as u64,
                                messages_received: row.get::<_, i64>(11)? as u64,
                                positions_received: row.get::<_, i64>(12)? as u64,
                                mlat_enabled: row.get(13)?,
                                last_seen: row.get(14)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(row)
            })
            .await
            .context("failed to load feeder")
    }

    /// Number of stored feeders in a given state.
    pub async fn count_with_status(&self, status: FeederStatus) -> Result<usize> {
        let n: i64 = self
            .conn
            .call(move |conn: &mut rusqlite::Connection| {
                let n = conn.query_row(
                    "SELECT COUNT(*) FROM feeders WHERE status = ?1",
                    params![status.as_str()],
                    |row| row.get(0),
                )?;
                Ok(n)
            })
            .await
            .context("failed to count feeders")?;
        Ok(n as usize)
    }
}

#[async_trait]
impl FeederStore for SqliteStore {
    async fn upsert_feeder(&self, feeder: &NewFeeder) -> Result<FeederId> {
        let feeder = feeder.clone();
        let name = feeder.display_name();
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                let tx = conn.transaction()?;
                let address = feeder.address.to_string();

                let existing: Option<FeederId> = tx
                    .query_row(
                        "SELECT id FROM feeders WHERE ip_address = ?1",
                        params![address],
                        |row| row.get(0),
                    )
                    .optional()?;

                let id = match existing {
                    Some(id) => {
                        tx.execute(
                            &format!(
                                "UPDATE feeders SET
                                    hostname = COALESCE(?1, hostname),
                                    conn_type = ?2,
                                    location = COALESCE(?3, location),
                                    latitude = COALESCE(?4, latitude),
                                    longitude = COALESCE(?5, longitude),
                                    last_seen = {NOW},
                                    status = 'active',
                                    updated_at = {NOW}
                                 WHERE id = ?6"
                            ),
                            params![
                                feeder.hostname,
                                feeder.origin.as_str(),
                                feeder.location,
                                feeder.latitude,
                                feeder.longitude,
                                id
                            ],
                        )?;
                        id
                    }
                    None => {
                        tx.execute(
                            &format!(
                                "INSERT INTO feeders
                                    (name, conn_type, ip_address, hostname, location, latitude,
                                     longitude, first_seen, last_seen, status, created_at, updated_at)
                                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, {NOW}, {NOW}, 'active', {NOW}, {NOW})"
                            ),
                            params![
                                name,
                                feeder.origin.as_str(),
                                address,
                                feeder.hostname,
                                feeder.location,
                                feeder.latitude,
                                feeder.longitude
                            ],
                        )?;
                        tx.last_insert_rowid()
                    }
                };

                tx.commit()?;
                Ok(id)
            })
            .await
            .context("failed to upsert feeder")
    }

    async fn log_connection(&self, feeder_id: FeederId, address: IpAddr) -> Result<ConnectionId> {
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                let tx = conn.transaction()?;
                tx.execute(
                    &format!(
                        "INSERT INTO connections (feeder_id, ip_address, connected_at)
                         VALUES (?1, ?2, {NOW})"
                    ),
                    params![feeder_id, address.to_string()],
                )?;
                let id = tx.last_insert_rowid();
                tx.execute(
                    "INSERT INTO activity_log (event_type, feeder_id, message) VALUES (?1, ?2, ?3)",
                    params![
                        "feeder_connected",
                        feeder_id,
                        format!("Feeder connected from {address}")
                    ],
                )?;
                tx.commit()?;
                Ok(id)
            })
            .await
            .context("failed to log connection")
    }

    async fn log_disconnection(
        &self,
        feeder_id: FeederId,
        connection_id: ConnectionId,
        bytes_transferred: u64,
    ) -> Result<i64> {
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                let tx = conn.transaction()?;
                tx.execute(
                    &format!(
                        "UPDATE connections SET
                            disconnected_at = {NOW},
                            duration_seconds = CAST((julianday({NOW}) - julianday(connected_at)) * 86400 AS INTEGER),
                            bytes_transferred = ?1
                         WHERE id = ?2"
                    ),
                    params![bytes_transferred as i64, connection_id],
                )?;
                let duration: i64 = tx
                    .query_row(
                        "SELECT COALESCE(duration_seconds, 0) FROM connections WHERE id = ?1",
                        params![connection_id],
                        |row| row.get(0),
                    )
                    .optional()?
                    .unwrap_or(0);
                tx.execute(
                    &format!(
                        "UPDATE feeders SET status = 'offline', last_seen = {NOW}, updated_at = {NOW}
                         WHERE id = ?1"
                    ),
                    params![feeder_id],
                )?;
                tx.execute(
                    "INSERT INTO activity_log (event_type, feeder_id, message) VALUES (?1, ?2, ?3)",
                    params!["feeder_disconnected", feeder_id, "Feeder disconnected"],
                )?;
                tx.commit()?;
                Ok(duration)
            })
            .await
            .context("failed to log disconnection")
    }

    async fn add_counters(&self, feeder_id: FeederId, delta: Counters) -> Result<()> {
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                conn.execute(
                    &format!(
                        "UPDATE feeders SET
                            bytes_received = bytes_received + ?1,
                            messages_received = messages_received + ?2,
                            positions_received = positions_received + ?3,
                            last_seen = {NOW},
                            status = 'active',
                            updated_at = {NOW}
                         WHERE id = ?4"
                    ),
                    params![
                        delta.bytes as i64,
                        delta.messages as i64,
                        delta.positions as i64,
                        feeder_id
                    ],
                )?;
                Ok(())
            })
            .await
            .context("failed to add counters")
    }

    async fn touch(&self, feeder_id: FeederId) -> Result<()> {
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                conn.execute(
                    &format!(
                        "UPDATE feeders SET last_seen = {NOW}, status = 'active', updated_at = {NOW}
                         WHERE id = ?1"
                    ),
                    params![feeder_id],
                )?;
                Ok(())
            })
            .await
            .context("failed to touch feeder")
    }

    async fn set_mlat_status(&self, feeder_id: FeederId, status: MlatStatus) -> Result<()> {
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                match (status.live, status.latitude, status.longitude) {
                    (true, Some(lat), Some(lon)) => conn.execute(
                        &format!(
                            "UPDATE feeders SET
                                mlat_enabled = 1, latitude = ?1, longitude = ?2, altitude = ?3,
                                updated_at = {NOW}
                             WHERE id = ?4"
                        ),
                        params![lat, lon, status.altitude, feeder_id],
                    )?,
                    _ => conn.execute(
                        &format!(
                            "UPDATE feeders SET mlat_enabled = ?1, updated_at = {NOW} WHERE id = ?2"
                        ),
                        params![status.live, feeder_id],
                    )?,
                };
                Ok(())
            })
            .await
            .context("failed to set MLAT status")
    }

    async fn mark_stale_except(&self, live: &HashSet<FeederId>) -> Result<usize> {
        let live: Vec<FeederId> = live.iter().copied().collect();
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                let changed = if live.is_empty() {
                    conn.execute(
                        &format!(
                            "UPDATE feeders SET status = 'stale', updated_at = {NOW}
                             WHERE status = 'active'"
                        ),
                        [],
                    )?
                } else {
                    let placeholders = vec!["?"; live.len()].join(",");
                    conn.execute(
                        &format!(
                            "UPDATE feeders SET status = 'stale', updated_at = {NOW}
                             WHERE status = 'active' AND id NOT IN ({placeholders})"
                        ),
                        params_from_iter(live.iter()),
                    )?
                };
                Ok(changed)
            })
            .await
            .context("failed to mark stale feeders")
    }
}
