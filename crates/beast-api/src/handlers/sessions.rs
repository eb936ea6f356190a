//! /sessions handler: one row per live feeder connection.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use beast_core::Origin;
use beast_services::{snapshot, FeederId, SessionId};

use super::ApiState;

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub peer: String,
    pub origin: Origin,
    pub label: Option<String>,
    pub feeder_id: FeederId,
    pub connected_secs: u64,
    pub bytes: u64,
    pub messages: u64,
    pub positions: u64,
    pub idle_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionInfo>,
}

pub async fn handle_sessions(State(state): State<ApiState>) -> Json<SessionsResponse> {
    let mut sessions: Vec<SessionInfo> = snapshot(&state.sessions)
        .into_iter()
        .map(|(id, live)| {
            let totals = live.stats.totals();
            SessionInfo {
                session_id: id,
                peer: live.meta.peer_addr.to_string(),
                origin: live.meta.origin,
                label: live.meta.label.clone(),
                feeder_id: live.meta.feeder_id,
                connected_secs: live.meta.connected_at.elapsed().as_secs(),
                bytes: totals.bytes,
                messages: totals.messages,
                positions: totals.positions,
                idle_secs: live.stats.idle_for().as_secs(),
            }
        })
        .collect();
    sessions.sort_by_key(|s| s.session_id);

    Json(SessionsResponse { sessions })
}
