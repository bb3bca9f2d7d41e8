//! Time-bounded peer list cache with single-flight refresh.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::mapper::PeerNode;

/// Caching mode, derived from a signed refresh interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPolicy {
    /// Every call queries the directory.
    Disabled,
    /// An entry is served until it is `ttl` old.
    Ttl(Duration),
    /// A non-empty entry is served forever.
    Infinite,
}

impl RefreshPolicy {
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            0 => RefreshPolicy::Disabled,
            ms if ms > 0 => RefreshPolicy::Ttl(Duration::from_millis(ms.unsigned_abs())),
            _ => RefreshPolicy::Infinite,
        }
    }

    fn is_fresh(&self, entry: &CacheEntry, now: Instant) -> bool {
        match self {
            RefreshPolicy::Disabled => false,
            RefreshPolicy::Ttl(ttl) => now.saturating_duration_since(entry.refreshed_at) < *ttl,
            RefreshPolicy::Infinite => !entry.peers.is_empty(),
        }
    }
}

/// The last computed peer list. Replaced wholesale, never mutated.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub peers: Arc<[PeerNode]>,
    pub refreshed_at: Instant,
}

/// Holds the last peer list and decides when it must be recomputed.
///
/// Concurrent callers that find the entry stale queue on a refresh lock;
/// the first one recomputes and the rest are served its result.
#[derive(Debug)]
pub struct RefreshCache {
    entry: RwLock<Option<CacheEntry>>,
    policy: RefreshPolicy,
    refresh_lock: Mutex<()>,
}

impl RefreshCache {
    pub fn new(policy: RefreshPolicy) -> Self {
        Self {
            entry: RwLock::new(None),
            policy,
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> RefreshPolicy {
        self.policy
    }

    /// Current entry, regardless of age.
    pub async fn current(&self) -> Option<CacheEntry> {
        self.entry.read().await.clone()
    }

    /// Return the cached peers if still valid, otherwise run `refresh`.
    ///
    /// A failed refresh never replaces the entry: the previous peers (or an
    /// empty list) are returned instead.
    pub async fn get_or_refresh<F, Fut, E>(&self, refresh: F) -> Arc<[PeerNode]>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<PeerNode>, E>>,
        E: Display,
    {
        if let Some(peers) = self.fresh().await {
            trace!(peers = peers.len(), "Using cached peer list");
            return peers;
        }

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while this one waited.
        if let Some(peers) = self.fresh().await {
            trace!(peers = peers.len(), "Using peer list refreshed by a concurrent caller");
            return peers;
        }

        let started = Instant::now();
        match refresh().await {
            Ok(peers) => {
                let peers: Arc<[PeerNode]> = peers.into();
                *self.entry.write().await = Some(CacheEntry {
                    peers: Arc::clone(&peers),
                    refreshed_at: started,
                });
                peers
            }
            Err(e) => {
                let previous = self
                    .entry
                    .read()
                    .await
                    .as_ref()
                    .map(|entry| Arc::clone(&entry.peers));
                warn!(
                    error = %e,
                    stale_peers = previous.as_ref().map_or(0, |p| p.len()),
                    "Peer list refresh failed, keeping previous peer list"
                );
                previous.unwrap_or_else(|| Arc::from(Vec::new()))
            }
        }
    }

    async fn fresh(&self) -> Option<Arc<[PeerNode]>> {
        let entry = self.entry.read().await;
        entry
            .as_ref()
            .filter(|entry| self.policy.is_fresh(entry, Instant::now()))
            .map(|entry| Arc::clone(&entry.peers))
    }
}
