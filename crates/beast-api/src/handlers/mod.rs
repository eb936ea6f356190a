//! HTTP API handlers: exposes relay state as JSON.

pub mod sessions;
pub mod status;

use std::sync::Arc;

use tokio::time::Instant;

use beast_services::{OriginClassifier, SessionTable};

pub use sessions::handle_sessions;
pub use status::{handle_caches_refresh, handle_status};

#[derive(Clone)]
pub struct ApiState {
    pub sessions: SessionTable,
    pub classifier: Arc<OriginClassifier>,
    /// When the daemon started, for uptime.
    pub started_at: Instant,
}
