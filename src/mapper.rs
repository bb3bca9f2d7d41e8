//! Directory records → peer nodes.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::address;
use crate::directory::EndpointRecord;
use crate::RosterError;

/// Prefix of every generated peer identifier.
pub const IDENTIFIER_PREFIX: &str = "#cloud-";

/// A candidate cluster peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerNode {
    /// `#cloud-{host}-{port}`, unique within one resolution.
    pub identifier: String,
    /// Canonical address.
    pub host: String,
    pub port: u16,
    /// Opaque compatibility token supplied by the caller.
    pub protocol_version: String,
}

impl PeerNode {
    pub fn new(host: impl Into<String>, port: u16, protocol_version: impl Into<String>) -> Self {
        let host = host.into();
        Self {
            identifier: format!("{IDENTIFIER_PREFIX}{host}-{port}"),
            host,
            port,
            protocol_version: protocol_version.into(),
        }
    }

    /// `host:port`, with IPv6 hosts bracketed.
    pub fn transport_address(&self) -> String {
        address::transport_address(&self.host, self.port)
    }
}

/// Why a record produced no peers.
#[derive(Debug)]
pub enum SkipReason {
    Unresolvable(RosterError),
    /// The record had no ports and no default port is configured.
    NoPorts,
}

#[derive(Debug)]
pub struct SkippedRecord {
    pub address: String,
    pub reason: SkipReason,
}

/// Result of one mapping pass.
#[derive(Debug, Default)]
pub struct MapOutcome {
    pub peers: Vec<PeerNode>,
    pub skipped: Vec<SkippedRecord>,
    /// Records dropped because they are this node.
    pub self_filtered: usize,
}

/// Map directory records to peer nodes.
///
/// Records are processed in order and each record's ports in order. A record
/// matching `self_address` is dropped, and a record whose address cannot be
/// canonicalized is skipped without affecting the others. Records without
/// ports of their own use `default_port`.
pub async fn map_endpoints(
    records: &[EndpointRecord],
    self_address: Option<&str>,
    default_port: Option<u16>,
    protocol_version: &str,
) -> MapOutcome {
    let mut outcome = MapOutcome::default();
    let mut seen = HashSet::new();

    for record in records {
        let host = match address::format_address(&record.address).await {
            Ok(host) => host,
            Err(e) => {
                warn!(address = %record.address, error = %e, "Ignoring invalid endpoint address");
                outcome.skipped.push(SkippedRecord {
                    address: record.address.clone(),
                    reason: SkipReason::Unresolvable(e),
                });
                continue;
            }
        };

        if self_address == Some(host.as_str()) {
            trace!(address = %host, "Current node found, ignoring");
            outcome.self_filtered += 1;
            continue;
        }

        let ports = select_ports(record, default_port);
        if ports.is_empty() {
            warn!(address = %host, "Endpoint has no ports and no default port is configured");
            outcome.skipped.push(SkippedRecord {
                address: record.address.clone(),
                reason: SkipReason::NoPorts,
            });
            continue;
        }

        for port in ports {
            let peer = PeerNode::new(host.as_str(), port, protocol_version);
            if !seen.insert(peer.identifier.clone()) {
                trace!(peer = %peer.identifier, "Duplicate endpoint, ignoring");
                continue;
            }
            debug!(
                peer = %peer.identifier,
                transport_address = %peer.transport_address(),
                "Adding peer"
            );
            outcome.peers.push(peer);
        }
    }

    outcome
}

fn select_ports(record: &EndpointRecord, default_port: Option<u16>) -> Vec<u16> {
    if record.ports.is_empty() {
        default_port.into_iter().collect()
    } else {
        record.ports.iter().map(|p| p.port).collect()
    }
}
