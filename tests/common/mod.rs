//! Shared test helpers for roster integration tests.
//!
//! Provides a scriptable in-memory `Directory`, local address stubs, and a
//! mock Kubernetes API server on localhost.

// Each test binary compiles this module independently and only uses a subset
// of exports, so unused items are expected.
#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use roster::{Config, Directory, DirectoryError, EndpointRecord, HostResolver, LocalAddress};

// ============================================================================
// ScriptedDirectory: in-memory directory for testing
// ============================================================================

/// What the next queries return.
#[derive(Debug, Clone)]
pub enum Script {
    Records(Vec<EndpointRecord>),
    /// Fail with a 503 from the API server.
    Fail,
    /// Never answer (until the resolver's timeout fires).
    Hang,
    /// Answer after a delay.
    Slow(Duration, Vec<EndpointRecord>),
}

#[derive(Debug)]
struct ScriptState {
    closes: AtomicUsize,
    queries: AtomicUsize,
    script: Mutex<Script>,
}

/// A directory whose answers are set by the test. Clones share state, so the
/// test keeps one handle after moving another into the resolver.
#[derive(Debug, Clone)]
pub struct ScriptedDirectory {
    inner: Arc<ScriptState>,
}

impl ScriptedDirectory {
    pub fn new(script: Script) -> Self {
        Self {
            inner: Arc::new(ScriptState {
                closes: AtomicUsize::new(0),
                queries: AtomicUsize::new(0),
                script: Mutex::new(script),
            }),
        }
    }

    pub fn returning(records: Vec<EndpointRecord>) -> Self {
        Self::new(Script::Records(records))
    }

    pub fn set(&self, script: Script) {
        *self.inner.script.lock().unwrap() = script;
    }

    pub fn queries(&self) -> usize {
        self.inner.queries.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }
}

impl Directory for ScriptedDirectory {
    async fn query(&self) -> Result<Vec<EndpointRecord>, DirectoryError> {
        self.inner.queries.fetch_add(1, Ordering::SeqCst);
        let script = self.inner.script.lock().unwrap().clone();

        match script {
            Script::Records(records) => Ok(records),
            Script::Fail => Err(DirectoryError::Status {
                status: 503,
                url: "scripted".to_string(),
            }),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Vec::new())
            }
            Script::Slow(delay, records) => {
                tokio::time::sleep(delay).await;
                Ok(records)
            }
        }
    }

    async fn close(&self) {
        self.inner.closes.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Local address stubs
// ============================================================================

/// A node with no usable network interface.
pub struct NoLocalAddress;

impl LocalAddress for NoLocalAddress {
    async fn publish_address(&self) -> anyhow::Result<IpAddr> {
        anyhow::bail!("no network interface available")
    }
}

/// A node whose address lookup never completes.
pub struct HangingLocalAddress;

impl LocalAddress for HangingLocalAddress {
    async fn publish_address(&self) -> anyhow::Result<IpAddr> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        anyhow::bail!("unreachable")
    }
}

pub fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(a, b, c, d))
}

// ============================================================================
// Resolver helpers
// ============================================================================

/// Config for a service-endpoints lookup with the given refresh interval.
pub fn service_config(refresh_interval_ms: i64) -> Config {
    let mut config = Config {
        refresh_interval_ms,
        protocol_version: "7.10".to_string(),
        query_timeout_ms: 1000,
        ..Config::default()
    };
    config.directory.namespace = Some("search".to_string());
    config.directory.service_name = Some("es-transport".to_string());
    config
}

/// A resolver over a scripted directory, plus a handle to that directory.
pub fn scripted_resolver(
    config: Config,
    script: Script,
    local: IpAddr,
) -> (HostResolver<ScriptedDirectory, IpAddr>, ScriptedDirectory) {
    let directory = ScriptedDirectory::new(script);
    let resolver = HostResolver::new(config, directory.clone(), local).unwrap();
    (resolver, directory)
}

/// `(host, port)` pairs, for compact assertions.
pub fn hosts_and_ports(peers: &[roster::PeerNode]) -> Vec<(String, u16)> {
    peers.iter().map(|p| (p.host.clone(), p.port)).collect()
}

/// The two-record endpoint listing used across tests.
pub fn two_node_listing() -> Vec<EndpointRecord> {
    vec![
        EndpointRecord::with_ports("10.0.0.5", [9300]),
        EndpointRecord::with_ports("10.0.0.9", [9300, 9301]),
    ]
}

// ============================================================================
// Mock Kubernetes API
// ============================================================================

/// Serve `router` on a random localhost port and return its base URL.
pub async fn spawn_api_server(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    format!("http://{addr}")
}
