//! Overlay peer cache: address → peer record, rebuilt wholesale.
//!
//! The mapping is never patched. A refresh builds a complete new map and
//! swaps it in together with the refresh time; a failed refresh simply
//! never calls [`PeerCache::replace`], so the previous map stays.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::time::Instant;

/// How long a peer list is trusted before the next lookup refreshes it.
pub const PEER_CACHE_TTL: Duration = Duration::from_secs(60);

/// A peer as reported by an overlay network's directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub address: IpAddr,
    /// Advertised name or hostname.
    pub name: Option<String>,
    /// Further addresses the same peer is reachable at.
    pub extra_addresses: Vec<IpAddr>,
}

impl PeerRecord {
    pub fn new(address: IpAddr, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            address,
            name: (!name.is_empty()).then_some(name),
            extra_addresses: Vec::new(),
        }
    }
}

#[derive(Default)]
struct CacheState {
    peers: HashMap<IpAddr, Arc<PeerRecord>>,
    refreshed_at: Option<Instant>,
}

pub struct PeerCache {
    ttl: Duration,
    state: RwLock<CacheState>,
}

impl PeerCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: RwLock::new(CacheState::default()),
        }
    }

    /// Never filled, invalidated, or older than the TTL.
    pub fn is_stale(&self) -> bool {
        match self.read().refreshed_at {
            Some(at) => at.elapsed() > self.ttl,
            None => true,
        }
    }

    pub fn get(&self, addr: &IpAddr) -> Option<Arc<PeerRecord>> {
        self.read().peers.get(addr).cloned()
    }

    /// Swap in a freshly fetched peer list. Every address of a peer,
    /// primary and extra, maps to the same record.
    pub fn replace(&self, records: Vec<PeerRecord>) {
        let mut peers = HashMap::with_capacity(records.len());
        for record in records {
            let record = Arc::new(record);
            peers.insert(record.address, record.clone());
            for extra in &record.extra_addresses {
                if *extra != record.address {
                    peers.insert(*extra, record.clone());
                }
            }
        }

        let mut state = self.write();
        state.peers = peers;
        state.refreshed_at = Some(Instant::now());
    }

    /// Force the next lookup to refresh. The current map stays usable.
    pub fn invalidate(&self) {
        self.write().refreshed_at = None;
    }

    /// Number of addresses currently mapped.
    pub fn len(&self) -> usize {
        self.read().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Time since the last successful refresh.
    pub fn age(&self) -> Option<Duration> {
        self.read().refreshed_at.map(|at| at.elapsed())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for PeerCache {
    fn default() -> Self {
        Self::new(PEER_CACHE_TTL)
    }
}
