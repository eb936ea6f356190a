//! Periodic stats reconciliation.
//!
//! Every tick flushes counter deltas of live sessions, syncs MLAT state,
//! marks feeders without a session stale, invalidates the overlay peer
//! caches and logs a one-line status summary.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};

use beast_services::{
    snapshot, AircraftCount, AircraftCounter, FeederStore, LiveSession, MlatClient, MlatStatus,
    OriginClassifier, SessionTable, TelemetrySource,
};

/// Outcome of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub feeders: usize,
    pub mlat: usize,
    pub aircraft: usize,
    pub aircraft_with_position: usize,
    pub flush_failures: usize,
    pub marked_stale: usize,
}

pub struct Reconciler {
    sessions: SessionTable,
    store: Arc<dyn FeederStore>,
    classifier: Arc<OriginClassifier>,
    telemetry: Arc<dyn TelemetrySource>,
    aircraft: Arc<dyn AircraftCounter>,
    interval: Duration,
    started_at: Instant,
}

impl Reconciler {
    pub fn new(
        sessions: SessionTable,
        store: Arc<dyn FeederStore>,
        classifier: Arc<OriginClassifier>,
        telemetry: Arc<dyn TelemetrySource>,
        aircraft: Arc<dyn AircraftCounter>,
        interval: Duration,
    ) -> Self {
        Self {
            sessions,
            store,
            classifier,
            telemetry,
            aircraft,
            interval,
            started_at: Instant::now(),
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        // First tick one full interval after start.
        let mut interval = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("reconciler shutting down");
                    return Ok(());
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    pub async fn tick(&self) -> TickReport {
        let clients = match self.telemetry.live_clients().await {
            Ok(clients) => clients,
            Err(e) => {
                tracing::warn!(error = %e, "MLAT telemetry unavailable");
                HashMap::new()
            }
        };

        let mut report = TickReport::default();
        let mut live_ids = HashSet::new();

        for (id, session) in snapshot(&self.sessions) {
            // Torn down since the snapshot: its disconnect is already written.
            if !self.sessions.contains_key(&id) {
                continue;
            }
            report.feeders += 1;
            live_ids.insert(session.meta.feeder_id);

            let ip = session.meta.peer_addr.ip().to_canonical();
            let client = clients.get(&ip);
            if client.is_some() {
                report.mlat += 1;
            }
            if !self.reconcile_session(&session, client).await {
                report.flush_failures += 1;
            }
        }

        let AircraftCount {
            total,
            with_position,
        } = match self.aircraft.current_count().await {
            Ok(count) => count,
            Err(e) => {
                tracing::debug!(error = %e, "aircraft count unavailable");
                AircraftCount::default()
            }
        };
        report.aircraft = total;
        report.aircraft_with_position = with_position;

        match self.store.mark_stale_except(&live_ids).await {
            Ok(n) => report.marked_stale = n,
            Err(e) => tracing::warn!(error = %e, "failed to mark stale feeders"),
        }

        self.classifier.refresh_caches();

        tracing::info!(
            feeders = report.feeders,
            mlat = report.mlat,
            aircraft = report.aircraft,
            with_position = report.aircraft_with_position,
            uptime = %format_uptime(self.started_at.elapsed()),
            "status: {} feeders ({} mlat), {} aircraft ({} with pos)",
            report.feeders,
            report.mlat,
            report.aircraft,
            report.aircraft_with_position,
        );
        report
    }

    /// Flush one session and sync its MLAT state. Returns false if the
    /// counter flush failed.
    async fn reconcile_session(&self, session: &LiveSession, client: Option<&MlatClient>) -> bool {
        let feeder_id = session.meta.feeder_id;
        let mut flushed = true;

        let delta = session.stats.take_unflushed();
        let result = if delta.is_zero() {
            self.store.touch(feeder_id).await
        } else {
            self.store.add_counters(feeder_id, delta).await
        };
        if let Err(e) = result {
            session.stats.restore(delta);
            tracing::warn!(feeder_id, error = %e, "counter flush failed");
            flushed = false;
        }

        let status = match client {
            Some(c) => MlatStatus {
                live: true,
                latitude: c.latitude,
                longitude: c.longitude,
                altitude: c.altitude,
            },
            None => MlatStatus::offline(),
        };
        if let Err(e) = self.store.set_mlat_status(feeder_id, status).await {
            tracing::warn!(feeder_id, error = %e, "failed to update MLAT status");
        }
        if let Some(c) = client {
            tracing::debug!(feeder_id, mlat_name = %c.name, peers = ?c.peer_count, "feeder live in MLAT");
        }

        flushed
    }
}

/// `XhYmZs`.
pub fn format_uptime(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}
