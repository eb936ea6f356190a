//! Live-session table: one entry per relayed feeder connection.
//!
//! Counters follow a single-writer rule: only the inbound copy loop of a
//! session adds to its totals, through the session's [`StatsRecorder`].
//! The recorder is not `Clone`, so there is exactly one per session. Every
//! other holder (the reconciler, teardown, the API) goes through the
//! shared [`SessionStats`] handle, which can only read totals and advance
//! the flushed watermarks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use beast_core::{FrameCount, Origin};

use crate::store::{ConnectionId, FeederId};

/// Unique per-connection handle, assigned by the listener.
pub type SessionId = u64;

/// Byte/message/position triple, used for totals, watermarks and deltas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub bytes: u64,
    pub messages: u64,
    pub positions: u64,
}

impl Counters {
    pub fn is_zero(&self) -> bool {
        self.bytes == 0 && self.messages == 0 && self.positions == 0
    }

    fn saturating_sub(self, other: Counters) -> Counters {
        Counters {
            bytes: self.bytes.saturating_sub(other.bytes),
            messages: self.messages.saturating_sub(other.messages),
            positions: self.positions.saturating_sub(other.positions),
        }
    }
}

/// Running counters for one session.
#[derive(Debug)]
pub struct SessionStats {
    bytes: AtomicU64,
    messages: AtomicU64,
    positions: AtomicU64,
    /// Milliseconds after `started` at which data last arrived.
    last_data_ms: AtomicU64,
    started: Instant,
    flushed: Mutex<Counters>,
}

/// Exclusive write handle for a session's totals.
#[derive(Debug)]
pub struct StatsRecorder {
    stats: Arc<SessionStats>,
}

impl SessionStats {
    /// Create the shared stats handle and its one recorder.
    pub fn new() -> (Arc<SessionStats>, StatsRecorder) {
        let stats = Arc::new(SessionStats {
            bytes: AtomicU64::new(0),
            messages: AtomicU64::new(0),
            positions: AtomicU64::new(0),
            last_data_ms: AtomicU64::new(0),
            started: Instant::now(),
            flushed: Mutex::new(Counters::default()),
        });
        let recorder = StatsRecorder {
            stats: stats.clone(),
        };
        (stats, recorder)
    }

    pub fn totals(&self) -> Counters {
        Counters {
            bytes: self.bytes.load(Ordering::Acquire),
            messages: self.messages.load(Ordering::Acquire),
            positions: self.positions.load(Ordering::Acquire),
        }
    }

    /// Watermarks: what has already been written to the store.
    pub fn flushed(&self) -> Counters {
        *self.lock_flushed()
    }

    /// Totals minus watermarks, without claiming them.
    pub fn unflushed(&self) -> Counters {
        let flushed = self.lock_flushed();
        self.totals().saturating_sub(*flushed)
    }

    /// Claim the unflushed delta and advance the watermarks to the current
    /// totals. Two concurrent callers never receive the same delta.
    pub fn take_unflushed(&self) -> Counters {
        let mut flushed = self.lock_flushed();
        let totals = self.totals();
        let delta = totals.saturating_sub(*flushed);
        *flushed = totals;
        delta
    }

    /// Hand back a delta whose store write failed so the next flush retries it.
    pub fn restore(&self, delta: Counters) {
        let mut flushed = self.lock_flushed();
        *flushed = flushed.saturating_sub(delta);
    }

    /// Time since the last inbound data, or since the session started if
    /// nothing has arrived yet.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_data_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    fn lock_flushed(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.flushed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StatsRecorder {
    /// Account for one chunk read from the feeder.
    pub fn record(&mut self, bytes: usize, frames: FrameCount) {
        let s = &self.stats;
        s.bytes.fetch_add(bytes as u64, Ordering::AcqRel);
        s.messages.fetch_add(frames.messages, Ordering::AcqRel);
        s.positions.fetch_add(frames.positions, Ordering::AcqRel);
        let now_ms = s.started.elapsed().as_millis() as u64;
        s.last_data_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn stats(&self) -> &Arc<SessionStats> {
        &self.stats
    }
}

/// Fixed metadata about a registered session.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub feeder_id: FeederId,
    pub connection_id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub origin: Origin,
    /// Overlay hostname or geolocation label, if one was found.
    pub label: Option<String>,
    pub connected_at: Instant,
}

/// A live session as seen by the reconciler and the API.
#[derive(Debug, Clone)]
pub struct LiveSession {
    pub meta: SessionMeta,
    pub stats: Arc<SessionStats>,
}

/// The session table, shared by the listener, sessions, reconciler and API.
pub type SessionTable = Arc<DashMap<SessionId, LiveSession>>;

/// Create a new empty session table.
pub fn new_session_table() -> SessionTable {
    Arc::new(DashMap::new())
}

/// Point-in-time copy of the table. Sessions added or removed after this
/// call are not reflected in the returned list.
pub fn snapshot(table: &SessionTable) -> Vec<(SessionId, LiveSession)> {
    table
        .iter()
        .map(|entry| (*entry.key(), entry.value().clone()))
        .collect()
}
