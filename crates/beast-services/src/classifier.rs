//! Connection-origin classifier.
//!
//! Decides whether a feeder address belongs to a NetBird peer, a Tailscale
//! peer, or the public internet. Precedence, checked in this order:
//!
//! 1. inside the NetBird range with an explicit NetBird peer → NetBird
//! 2. inside the Tailscale range with an explicit Tailscale peer → Tailscale
//! 3. inside the NetBird range → NetBird
//! 4. inside the Tailscale range → Tailscale
//! 5. otherwise → Public
//!
//! NetBird is the primary network, so it is checked first at both levels.
//! Both ranges default to 100.64.0.0/10, and an explicit peer match always
//! outranks a range-only match.
//!
//! Peer lists are fetched lazily: a lookup refreshes a network's cache only
//! once it is older than the TTL. Refresh failures are logged and leave the
//! previous cache in place.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use beast_core::{IpNet, Origin};

use crate::overlay::DirectoryError;
use crate::peer_cache::{PeerCache, PeerRecord, PEER_CACHE_TTL};

/// Source of an overlay network's full peer list.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    async fn list_peers(&self) -> Result<Vec<PeerRecord>, DirectoryError>;
}

/// One overlay network: its address range, peer directory and cache.
pub struct OverlayNetwork {
    origin: Origin,
    range: IpNet,
    /// None when the network has no usable directory (e.g. no API token);
    /// classification then relies on the range alone.
    directory: Option<Arc<dyn PeerDirectory>>,
    cache: PeerCache,
}

impl OverlayNetwork {
    pub fn new(origin: Origin, range: IpNet, directory: Option<Arc<dyn PeerDirectory>>) -> Self {
        Self {
            origin,
            range,
            directory,
            cache: PeerCache::new(PEER_CACHE_TTL),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.cache = PeerCache::new(ttl);
        self
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn range(&self) -> IpNet {
        self.range
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.range.contains(&addr)
    }

    /// Cached peer for `addr`, refreshing first if the cache is stale.
    pub async fn peer(&self, addr: IpAddr) -> Option<Arc<PeerRecord>> {
        let directory = self.directory.as_ref()?;
        if self.cache.is_stale() {
            self.refresh(directory.as_ref()).await;
        }
        self.cache.get(&addr)
    }

    async fn refresh(&self, directory: &dyn PeerDirectory) {
        match directory.list_peers().await {
            Ok(peers) => {
                let count = peers.len();
                self.cache.replace(peers);
                tracing::debug!(network = %self.origin, peers = count, "peer cache refreshed");
            }
            Err(DirectoryError::Unavailable(reason)) => {
                tracing::debug!(network = %self.origin, reason = %reason, "peer directory unavailable");
            }
            Err(e) => {
                tracing::warn!(network = %self.origin, error = %e, "peer cache refresh failed");
            }
        }
    }

    pub fn invalidate(&self) {
        self.cache.invalidate();
    }

    pub fn summary(&self) -> CacheSummary {
        CacheSummary {
            network: self.origin,
            range: self.range.to_string(),
            directory: self.directory.is_some(),
            peers: self.cache.len(),
            age_secs: self.cache.age().map(|a| a.as_secs()),
        }
    }
}

/// Cache state reported by the status API.
#[derive(Debug, Clone, Serialize)]
pub struct CacheSummary {
    pub network: Origin,
    pub range: String,
    pub directory: bool,
    pub peers: usize,
    pub age_secs: Option<u64>,
}

/// Classifies feeder addresses. Either network may be disabled (`None`).
pub struct OriginClassifier {
    netbird: Option<OverlayNetwork>,
    tailscale: Option<OverlayNetwork>,
}

impl OriginClassifier {
    pub fn new(netbird: Option<OverlayNetwork>, tailscale: Option<OverlayNetwork>) -> Self {
        Self { netbird, tailscale }
    }

    /// A classifier that calls everything public.
    pub fn disabled() -> Self {
        Self::new(None, None)
    }

    pub async fn classify(&self, addr: IpAddr) -> Origin {
        let in_netbird = self.netbird.as_ref().filter(|n| n.contains(addr));
        let in_tailscale = self.tailscale.as_ref().filter(|n| n.contains(addr));

        // Explicit peer match, primary network first.
        if let Some(net) = in_netbird {
            if net.peer(addr).await.is_some() {
                return Origin::NetBird;
            }
        }
        if let Some(net) = in_tailscale {
            if net.peer(addr).await.is_some() {
                return Origin::Tailscale;
            }
        }

        // Range-only fallback, primary network first.
        if in_netbird.is_some() {
            return Origin::NetBird;
        }
        if in_tailscale.is_some() {
            return Origin::Tailscale;
        }
        Origin::Public
    }

    /// Like [`classify`](Self::classify) for textual addresses; anything
    /// that does not parse is public.
    pub async fn classify_str(&self, addr: &str) -> Origin {
        match addr.parse::<IpAddr>() {
            Ok(ip) => self.classify(ip).await,
            Err(_) => Origin::Public,
        }
    }

    /// Advertised name of the cached peer for `addr` in the network named
    /// by `origin`. Public addresses have no name.
    pub async fn resolve_name(&self, addr: IpAddr, origin: Origin) -> Option<String> {
        let network = match origin {
            Origin::NetBird => self.netbird.as_ref()?,
            Origin::Tailscale => self.tailscale.as_ref()?,
            Origin::Public => return None,
        };
        network.peer(addr).await.and_then(|p| p.name.clone())
    }

    /// Make the next lookup on each network refetch its peer list.
    pub fn refresh_caches(&self) {
        for network in self.networks() {
            network.invalidate();
        }
    }

    pub fn cache_summary(&self) -> Vec<CacheSummary> {
        self.networks().map(OverlayNetwork::summary).collect()
    }

    fn networks(&self) -> impl Iterator<Item = &OverlayNetwork> {
        self.netbird.iter().chain(self.tailscale.iter())
    }
}
