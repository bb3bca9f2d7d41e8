//! Pluggable peer directories.
//!
//! - **Kubernetes**: service endpoints or a label-selected pod listing,
//!   read from the Kubernetes API (see [`crate::kubernetes`]).
//! - **DNS**: a headless service name resolved to its backing addresses.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::trace;

use crate::address::format_ip;
use crate::kubernetes::KubernetesDirectory;

/// One directory entry: an address and the ports it exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointRecord {
    /// IP literal or hostname.
    pub address: String,
    pub ports: Vec<EndpointPort>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPort {
    pub name: Option<String>,
    pub port: u16,
}

impl EndpointRecord {
    /// A record with no ports of its own.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ports: Vec::new(),
        }
    }

    /// A record with unnamed ports.
    pub fn with_ports(address: impl Into<String>, ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            address: address.into(),
            ports: ports
                .into_iter()
                .map(|port| EndpointPort { name: None, port })
                .collect(),
        }
    }
}

/// The shape of a directory query, selected from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryQuery {
    /// Endpoints of a named service.
    Service {
        namespace: Option<String>,
        service: String,
    },
    /// Running pods matching a label selector.
    Selector {
        namespace: Option<String>,
        selector: String,
    },
    /// Addresses behind a DNS name.
    Dns { name: String },
}

impl fmt::Display for DirectoryQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ns = |namespace: &Option<String>| namespace.clone().unwrap_or_else(|| "<default>".into());
        match self {
            DirectoryQuery::Service { namespace, service } => {
                write!(f, "service [{service}] in namespace [{}]", ns(namespace))
            }
            DirectoryQuery::Selector {
                namespace,
                selector,
            } => write!(f, "pod selector [{selector}] in namespace [{}]", ns(namespace)),
            DirectoryQuery::Dns { name } => write!(f, "DNS name [{name}]"),
        }
    }
}

/// Errors from a directory query.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Kubernetes API returned {status} for {url}")]
    Status { status: u16, url: String },
    #[error("{kind} [{name}] not found in namespace [{namespace}]")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },
    #[error("Malformed directory response: {0}")]
    Malformed(String),
    #[error("DNS lookup for [{name}] failed: {source}")]
    Dns {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Directory query timed out after {0:?}")]
    Timeout(Duration),
    #[error("Kubernetes API location unknown: {0}")]
    Unconfigured(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A source of endpoint records.
pub trait Directory: Send + Sync + 'static {
    /// Run one query. Failures are whole-query failures, never partial
    /// results.
    fn query(&self) -> impl Future<Output = Result<Vec<EndpointRecord>, DirectoryError>> + Send;

    /// Release any connection held by the directory.
    fn close(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// The built-in directories.
#[derive(Debug)]
pub enum DirectoryClient {
    Kubernetes(KubernetesDirectory),
    Dns(DnsDirectory),
}

impl Directory for DirectoryClient {
    async fn query(&self) -> Result<Vec<EndpointRecord>, DirectoryError> {
        match self {
            DirectoryClient::Kubernetes(d) => d.query().await,
            DirectoryClient::Dns(d) => d.query().await,
        }
    }

    async fn close(&self) {
        match self {
            DirectoryClient::Kubernetes(d) => d.close().await,
            DirectoryClient::Dns(d) => d.close().await,
        }
    }
}

/// Headless-service discovery: every address behind a DNS name.
#[derive(Debug, Clone)]
pub struct DnsDirectory {
    dns_name: String,
}

impl DnsDirectory {
    pub fn new(dns_name: String) -> Self {
        Self { dns_name }
    }
}

impl Directory for DnsDirectory {
    async fn query(&self) -> Result<Vec<EndpointRecord>, DirectoryError> {
        let addrs = tokio::net::lookup_host((self.dns_name.as_str(), 0))
            .await
            .map_err(|source| DirectoryError::Dns {
                name: self.dns_name.clone(),
                source,
            })?;

        let mut seen = HashSet::new();
        let records: Vec<EndpointRecord> = addrs
            .map(|addr| addr.ip())
            .filter(|ip| seen.insert(*ip))
            .map(|ip| EndpointRecord::new(format_ip(ip)))
            .collect();

        trace!(dns = %self.dns_name, records = records.len(), "DNS lookup completed");

        Ok(records)
    }
}
