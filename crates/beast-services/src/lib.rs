//! beast-services: shared state and collaborator adapters for the relay.
//!
//! Everything the session engine reads or writes outside a single
//! connection lives here: the live-session table, the overlay peer caches
//! and classifier, the feeder store, and the telemetry/geolocation
//! sources.

pub mod classifier;
pub mod geo;
pub mod overlay;
pub mod peer_cache;
pub mod session;
pub mod store;
pub mod telemetry;

pub use classifier::{CacheSummary, OriginClassifier, OverlayNetwork, PeerDirectory};
pub use geo::{locator_from_config, GeoLocation, GeoLocator, MaxMindLocator, NoGeoLocator};
pub use overlay::{DirectoryError, NetBirdDirectory, TailscaleDirectory};
pub use peer_cache::{PeerCache, PeerRecord, PEER_CACHE_TTL};
pub use session::{
    new_session_table, snapshot, Counters, LiveSession, SessionId, SessionMeta, SessionStats,
    SessionTable, StatsRecorder,
};
pub use store::{
    ConnectionId, FeederId, FeederRecord, FeederStatus, FeederStore, MlatStatus, NewFeeder,
    SqliteStore,
};
pub use telemetry::{
    AircraftCount, AircraftCounter, AircraftJson, MlatClient, MlatClientsFile, TelemetrySource,
};
