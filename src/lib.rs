//! roster: seed host resolution for clustered services on Kubernetes.
//!
//! Queries a directory (service endpoints, a label-selected pod listing, or
//! a headless-service DNS name), drops the local node, and turns what is
//! left into [`PeerNode`]s a membership layer can dial. Results are cached
//! under a signed refresh interval.
//!
//! # Quick start
//!
//! 1. Fill in a [`Config`] (or load one with [`Config::from_settings`]).
//! 2. Create a [`HostResolver`] with [`from_config`](HostResolver::from_config).
//! 3. Call [`build_peer_list`](HostResolver::build_peer_list) on every
//!    discovery round. It never fails; the worst case is a stale or empty
//!    list.
//! 4. Call [`shutdown`](HostResolver::shutdown) to release the API client.

pub mod address;
pub mod cache;
pub mod config;
pub mod directory;
pub mod kubernetes;
pub mod local;
pub mod mapper;

pub use cache::{CacheEntry, RefreshCache, RefreshPolicy};
pub use config::{ApiConfig, Config, DirectoryConfig};
pub use directory::{
    Directory, DirectoryClient, DirectoryError, DirectoryQuery, DnsDirectory, EndpointPort,
    EndpointRecord,
};
pub use kubernetes::KubernetesDirectory;
pub use local::{LocalAddress, PublishAddress};
pub use mapper::{MapOutcome, PeerNode, SkipReason, SkippedRecord};

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

// ============================================================================
// RosterError
// ============================================================================

/// Errors raised while resolving peers.
///
/// Only [`ConfigurationIncomplete`](RosterError::ConfigurationIncomplete) and
/// [`InvalidSetting`](RosterError::InvalidSetting) reach callers; the rest are
/// recovered inside [`HostResolver::build_peer_list`] and logged.
#[derive(Debug, Error)]
pub enum RosterError {
    #[error("Configuration incomplete: {0}")]
    ConfigurationIncomplete(String),
    #[error("Directory query failed: {0}")]
    DirectoryQueryFailed(#[from] DirectoryError),
    #[error("Invalid setting {key}: {value:?}")]
    InvalidSetting { key: String, value: String },
    #[error("Publish address unavailable: {0}")]
    SelfAddressUnavailable(String),
    #[error("Unresolvable address {address:?}: {reason}")]
    UnresolvableAddress { address: String, reason: String },
}

// ============================================================================
// HostResolver
// ============================================================================

/// Resolves the current set of candidate peers.
///
/// Generic over `D` (the [`Directory`] queried) and `L` (the
/// [`LocalAddress`] used for self-filtering). Safe to share across tasks.
pub struct HostResolver<D: Directory = DirectoryClient, L: LocalAddress = PublishAddress> {
    cache: RefreshCache,
    config: Config,
    directory: D,
    local: L,
    query: DirectoryQuery,
}

impl HostResolver {
    /// Build a resolver with the directory and local address the config
    /// selects.
    pub fn from_config(config: Config) -> Result<Self, RosterError> {
        let directory = build_directory(&config)?;
        let local = PublishAddress::new(config.publish_host.clone());
        Self::new(config, directory, local)
    }
}

impl<D: Directory, L: LocalAddress> HostResolver<D, L> {
    /// Create a resolver. Fails if the config does not select a query.
    pub fn new(config: Config, directory: D, local: L) -> Result<Self, RosterError> {
        let query = config.query()?;
        let policy = config.refresh_policy();

        info!(query = %query, policy = ?policy, "Host resolver initialized");

        Ok(Self {
            cache: RefreshCache::new(policy),
            config,
            directory,
            local,
            query,
        })
    }

    /// Current candidate peers.
    ///
    /// Serves the cache when the refresh policy allows it, otherwise queries
    /// the directory. Directory failures fall back to the previous list (or
    /// an empty one) and are only logged.
    pub async fn build_peer_list(&self) -> Arc<[PeerNode]> {
        self.cache.get_or_refresh(|| self.refresh()).await
    }

    /// The last resolved peers, without querying.
    pub async fn cached(&self) -> Option<Arc<[PeerNode]>> {
        self.cache.current().await.map(|entry| entry.peers)
    }

    /// Release the directory's connection. A later call to
    /// [`build_peer_list`](Self::build_peer_list) reconnects.
    pub async fn shutdown(&self) {
        self.directory.close().await;
        debug!(query = %self.query, "Host resolver shut down");
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    pub fn query(&self) -> &DirectoryQuery {
        &self.query
    }

    async fn refresh(&self) -> Result<Vec<PeerNode>, RosterError> {
        debug!(query = %self.query, "Building peer list from directory");

        let timeout = self.config.query_timeout();

        let lookup = match tokio::time::timeout(timeout, self.local.publish_address()).await {
            Ok(Ok(ip)) => Ok(ip),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(_) => Err(format!("lookup timed out after {timeout:?}")),
        };
        let self_address = match lookup {
            Ok(ip) => Some(address::format_ip(ip)),
            Err(reason) => {
                let err = RosterError::SelfAddressUnavailable(reason);
                warn!(error = %err, "Unable to find the publish address, not filtering self");
                None
            }
        };

        let records = match tokio::time::timeout(timeout, self.directory.query()).await {
            Ok(result) => result?,
            Err(_) => return Err(DirectoryError::Timeout(timeout).into()),
        };

        if records.is_empty() {
            warn!(query = %self.query, "No endpoints found");
        }

        // Hostname records resolve through DNS, which gets the same bound.
        let mapping = mapper::map_endpoints(
            &records,
            self_address.as_deref(),
            self.config.default_port,
            &self.config.protocol_version,
        );
        let outcome = match tokio::time::timeout(timeout, mapping).await {
            Ok(outcome) => outcome,
            Err(_) => return Err(DirectoryError::Timeout(timeout).into()),
        };

        debug!(
            peers = outcome.peers.len(),
            skipped = outcome.skipped.len(),
            self_filtered = outcome.self_filtered,
            "Peer list built"
        );

        Ok(outcome.peers)
    }
}

impl<D: Directory + std::fmt::Debug, L: LocalAddress + std::fmt::Debug> std::fmt::Debug
    for HostResolver<D, L>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostResolver")
            .field("query", &self.query)
            .field("policy", &self.cache.policy())
            .field("directory", &self.directory)
            .field("local", &self.local)
            .finish()
    }
}

/// Build the directory the config selects.
pub fn build_directory(config: &Config) -> Result<DirectoryClient, RosterError> {
    let api = config.directory.api.clone();
    let timeout = config.query_timeout();

    let directory = match config.query()? {
        DirectoryQuery::Service { namespace, service } => DirectoryClient::Kubernetes(
            KubernetesDirectory::endpoints(namespace, service, api, timeout),
        ),
        DirectoryQuery::Selector {
            namespace,
            selector,
        } => DirectoryClient::Kubernetes(KubernetesDirectory::pods(
            namespace, selector, api, timeout,
        )),
        DirectoryQuery::Dns { name } => DirectoryClient::Dns(DnsDirectory::new(name)),
    };

    Ok(directory)
}
