//! Address canonicalization.
//!
//! Directory records and the local publish address both pass through
//! [`format_ip`], so self-filtering compares like with like. IPv4-mapped
//! IPv6 addresses collapse to their IPv4 form and IPv6 is rendered in its
//! compressed lowercase form without brackets.

use std::net::IpAddr;

use crate::RosterError;

/// Render an IP address in canonical form.
pub fn format_ip(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
    }
}

/// Parse an IP literal, accepting bracketed IPv6 (`[::1]`).
pub fn parse_ip(raw: &str) -> Option<IpAddr> {
    let trimmed = raw.trim();
    let unbracketed = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(trimmed);
    unbracketed.parse().ok()
}

/// Canonicalize a raw address from the directory.
///
/// IP literals are formatted directly. Anything else must be a syntactically
/// valid hostname, which is resolved and its first address formatted.
pub async fn format_address(raw: &str) -> Result<String, RosterError> {
    if let Some(ip) = parse_ip(raw) {
        return Ok(format_ip(ip));
    }

    let host = raw.trim();
    if !is_valid_hostname(host) {
        return Err(unresolvable(raw, "not an IP literal or hostname"));
    }

    let mut addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| unresolvable(raw, &e.to_string()))?;

    addrs
        .next()
        .map(|addr| format_ip(addr.ip()))
        .ok_or_else(|| unresolvable(raw, "host resolved to no addresses"))
}

/// Build a transport address (`host:port`) from a canonical host.
pub fn transport_address(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{host}]:{port}"),
        _ => format!("{host}:{port}"),
    }
}

/// RFC 1123 hostname syntax. The last label may not be all-numeric, which
/// rejects malformed dotted quads like `10.0.0.300`.
fn is_valid_hostname(host: &str) -> bool {
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.is_empty() || host.len() > 253 {
        return false;
    }

    let labels: Vec<&str> = host.split('.').collect();
    let labels_ok = labels.iter().all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });

    let last_numeric = labels
        .last()
        .is_some_and(|label| label.chars().all(|c| c.is_ascii_digit()));

    labels_ok && !last_numeric
}

fn unresolvable(raw: &str, reason: &str) -> RosterError {
    RosterError::UnresolvableAddress {
        address: raw.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[tokio::test]
    async fn test_ipv4_literal_is_unchanged() {
        assert_eq!(format_address("10.0.0.5").await.unwrap(), "10.0.0.5");
        assert_eq!(format_address(" 10.0.0.5 ").await.unwrap(), "10.0.0.5");
    }

    #[tokio::test]
    async fn test_ipv6_is_compressed_and_unbracketed() {
        assert_eq!(
            format_address("2001:0db8:0000:0000:0000:0000:0000:0001")
                .await
                .unwrap(),
            "2001:db8::1"
        );
        assert_eq!(format_address("[FE80::1]").await.unwrap(), "fe80::1");
    }

    #[tokio::test]
    async fn test_ipv4_mapped_collapses_to_ipv4() {
        assert_eq!(format_address("::ffff:10.0.0.5").await.unwrap(), "10.0.0.5");
    }

    #[tokio::test]
    async fn test_literal_and_local_formatting_agree() {
        // The mapper formats records with `format_address` while the resolver
        // formats its own address with `format_ip`; both must agree.
        let cases = [
            ("10.0.0.5", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))),
            (
                "::ffff:10.0.0.5",
                IpAddr::V6(Ipv4Addr::new(10, 0, 0, 5).to_ipv6_mapped()),
            ),
            (
                "2001:db8:0:0::1",
                IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
            ),
        ];
        for (raw, local) in cases {
            assert_eq!(format_address(raw).await.unwrap(), format_ip(local), "{raw}");
        }
    }

    #[tokio::test]
    async fn test_malformed_addresses_are_unresolvable() {
        for raw in ["", "   ", "10.0.0.300", "not/an/address", "-bad-.example"] {
            let err = format_address(raw).await.unwrap_err();
            assert!(
                matches!(err, RosterError::UnresolvableAddress { .. }),
                "{raw:?} gave {err:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_localhost_resolves_to_loopback() {
        let formatted = format_address("localhost").await.unwrap();
        let ip: IpAddr = formatted.parse().unwrap();
        assert!(ip.is_loopback());
    }

    #[test]
    fn test_transport_address_brackets_ipv6() {
        assert_eq!(transport_address("10.0.0.9", 9300), "10.0.0.9:9300");
        assert_eq!(transport_address("fe80::1", 9300), "[fe80::1]:9300");
        assert_eq!(transport_address("node-1.local", 9300), "node-1.local:9300");
    }

    #[test]
    fn test_hostname_syntax() {
        assert!(is_valid_hostname("es-0.es-headless.default.svc.cluster.local"));
        assert!(is_valid_hostname("localhost."));
        assert!(!is_valid_hostname("under_score.example"));
        assert!(!is_valid_hostname("a..b"));
        assert!(!is_valid_hostname("1.2.3"));
    }
}
