//! /status and /caches/refresh handlers.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use beast_services::{snapshot, CacheSummary, Counters};

use super::ApiState;

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub live_sessions: usize,
    pub totals: TotalsInfo,
    pub caches: Vec<CacheSummary>,
}

/// Counters summed over the live sessions.
#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct TotalsInfo {
    pub bytes: u64,
    pub messages: u64,
    pub positions: u64,
}

impl TotalsInfo {
    fn add(&mut self, c: Counters) {
        self.bytes += c.bytes;
        self.messages += c.messages;
        self.positions += c.positions;
    }
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let live = snapshot(&state.sessions);
    let mut totals = TotalsInfo::default();
    for (_, session) in &live {
        totals.add(session.stats.totals());
    }

    Json(StatusResponse {
        uptime_secs: state.started_at.elapsed().as_secs(),
        live_sessions: live.len(),
        totals,
        caches: state.classifier.cache_summary(),
    })
}

// ── /caches/refresh ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub invalidated: usize,
}

pub async fn handle_caches_refresh(State(state): State<ApiState>) -> Json<RefreshResponse> {
    state.classifier.refresh_caches();
    let invalidated = state.classifier.cache_summary().len();
    tracing::info!(networks = invalidated, "peer caches invalidated via API");
    Json(RefreshResponse { invalidated })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use beast_core::{parse_range, FrameCount, Origin};
    use beast_services::{
        new_session_table, LiveSession, OriginClassifier, OverlayNetwork, SessionMeta,
        SessionStats,
    };
    use tokio::time::Instant;

    fn classifier() -> Arc<OriginClassifier> {
        let range = parse_range("100.64.0.0/10").unwrap();
        Arc::new(OriginClassifier::new(
            None,
            Some(OverlayNetwork::new(Origin::Tailscale, range, None)),
        ))
    }

    #[tokio::test]
    async fn status_sums_live_counters() {
        let table = new_session_table();
        let (stats, mut recorder) = SessionStats::new();
        recorder.record(
            64,
            FrameCount {
                messages: 4,
                positions: 2,
            },
        );
        table.insert(
            1,
            LiveSession {
                meta: SessionMeta {
                    feeder_id: 1,
                    connection_id: 1,
                    peer_addr: "203.0.113.9:33000".parse().unwrap(),
                    origin: Origin::Public,
                    label: Some("Austin, TX".into()),
                    connected_at: Instant::now(),
                },
                stats,
            },
        );

        let state = ApiState {
            sessions: table,
            classifier: classifier(),
            started_at: Instant::now(),
        };
        let Json(resp) = handle_status(State(state)).await;

        assert_eq!(resp.live_sessions, 1);
        assert_eq!(
            resp.totals,
            TotalsInfo {
                bytes: 64,
                messages: 4,
                positions: 2
            }
        );
        assert_eq!(resp.caches.len(), 1);
    }

    #[tokio::test]
    async fn refresh_reports_configured_networks() {
        let state = ApiState {
            sessions: new_session_table(),
            classifier: classifier(),
            started_at: Instant::now(),
        };
        let Json(resp) = handle_caches_refresh(State(state)).await;
        assert_eq!(resp.invalidated, 1);
    }
}
