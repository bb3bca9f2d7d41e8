//! The local node's publish address, used to drop self from discovery.

use std::future::Future;
use std::net::{IpAddr, ToSocketAddrs};

use anyhow::{anyhow, Context};

use crate::address::parse_ip;

/// Supplies the address other nodes would use to reach this one.
pub trait LocalAddress: Send + Sync + 'static {
    fn publish_address(&self) -> impl Future<Output = anyhow::Result<IpAddr>> + Send;
}

/// A fixed, known address.
impl LocalAddress for IpAddr {
    async fn publish_address(&self) -> anyhow::Result<IpAddr> {
        Ok(*self)
    }
}

/// Resolves the configured publish host, or detects the local IP.
#[derive(Debug, Clone, Default)]
pub struct PublishAddress {
    publish_host: Option<String>,
}

impl PublishAddress {
    pub fn new(publish_host: Option<String>) -> Self {
        Self { publish_host }
    }
}

impl LocalAddress for PublishAddress {
    async fn publish_address(&self) -> anyhow::Result<IpAddr> {
        let Some(host) = self.publish_host.as_deref() else {
            return tokio::task::spawn_blocking(detect_local_ip)
                .await?
                .ok_or_else(|| anyhow!("no routable local address detected"));
        };

        if let Some(ip) = parse_ip(host) {
            return Ok(ip);
        }

        tokio::net::lookup_host((host, 0))
            .await
            .with_context(|| format!("failed to resolve publish host {host}"))?
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| anyhow!("publish host {host} resolved to no addresses"))
    }
}

/// Detect the local IP address of this node.
///
/// Prefers a non-loopback address for `$HOSTNAME` (the pod IP inside
/// Kubernetes), then the source address of a route to a public IP.
pub fn detect_local_ip() -> Option<IpAddr> {
    if let Ok(hostname) = std::env::var("HOSTNAME") {
        if let Ok(addrs) = (hostname.as_str(), 0u16).to_socket_addrs() {
            for addr in addrs {
                if !addr.ip().is_loopback() {
                    return Some(addr.ip());
                }
            }
        }
    }

    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket
        .local_addr()
        .ok()
        .map(|a| a.ip())
        .filter(|ip| !ip.is_unspecified())
}
