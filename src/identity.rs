//! Client identity from request metadata.
//!
//! Identity is advisory: it keys per-client state but trusts the forwarding
//! headers a client or proxy chooses to send.

use http::HeaderMap;
use std::net::Ipv4Addr;
use tracing::debug;

use crate::error::IdentityError;

/// Candidate headers in priority order, before falling back to the peer.
pub const CLIENT_IP: &str = "client-ip";
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED: &str = "x-forwarded";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_SERVER: &str = "x-forwarded-server";
pub const X_CLUSTER_CLIENT_IP: &str = "x-cluster-client-ip";

const HEADER_PRIORITY: [&str; 6] = [
    CLIENT_IP,
    X_FORWARDED_FOR,
    X_FORWARDED,
    X_FORWARDED_HOST,
    X_FORWARDED_SERVER,
    X_CLUSTER_CLIENT_IP,
];

/// Inclusive IPv4 ranges never accepted from headers.
const NON_ROUTABLE: [(Ipv4Addr, Ipv4Addr); 8] = [
    (Ipv4Addr::new(0, 0, 0, 0), Ipv4Addr::new(2, 255, 255, 255)),
    (Ipv4Addr::new(10, 0, 0, 0), Ipv4Addr::new(10, 255, 255, 255)),
    (Ipv4Addr::new(127, 0, 0, 0), Ipv4Addr::new(127, 255, 255, 255)),
    (Ipv4Addr::new(169, 254, 0, 0), Ipv4Addr::new(169, 254, 255, 255)),
    (Ipv4Addr::new(172, 16, 0, 0), Ipv4Addr::new(172, 31, 255, 255)),
    (Ipv4Addr::new(192, 0, 2, 0), Ipv4Addr::new(192, 0, 2, 255)),
    (Ipv4Addr::new(192, 168, 0, 0), Ipv4Addr::new(192, 168, 255, 255)),
    (Ipv4Addr::new(255, 255, 255, 0), Ipv4Addr::new(255, 255, 255, 255)),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    Header(&'static str),
    Peer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub address: String,
    /// Trimmed forwarded-for entries, when that header was present.
    pub forwarded_chain: Option<Vec<String>>,
    pub source: IdentitySource,
}

impl ClientIdentity {
    pub fn as_str(&self) -> &str {
        &self.address
    }
}

/// True for a dotted-quad IPv4 address outside the non-routable list.
pub fn is_public_ipv4(candidate: &str) -> bool {
    match candidate.trim().parse::<Ipv4Addr>() {
        Ok(ip) => !NON_ROUTABLE
            .iter()
            .any(|(low, high)| ip >= *low && ip <= *high),
        Err(_) => false,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityResolver;

impl IdentityResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve the identity for a request.
    ///
    /// Falls back to `peer` unvalidated; fails only when nothing at all is
    /// available.
    pub fn resolve(
        &self,
        headers: &HeaderMap,
        peer: Option<&str>,
    ) -> Result<ClientIdentity, IdentityError> {
        let forwarded_chain = header(headers, X_FORWARDED_FOR).map(|list| {
            list.split(',')
                .map(|entry| entry.trim().to_string())
                .filter(|entry| !entry.is_empty())
                .collect::<Vec<_>>()
        });

        for name in HEADER_PRIORITY {
            let Some(value) = header(headers, name) else {
                continue;
            };
            let accepted = if name == X_FORWARDED_FOR {
                value
                    .split(',')
                    .map(str::trim)
                    .find(|entry| is_public_ipv4(entry))
            } else {
                Some(value.trim()).filter(|v| is_public_ipv4(v))
            };
            if let Some(address) = accepted {
                debug!(source = name, address, "identity resolved from header");
                return Ok(ClientIdentity {
                    address: address.to_string(),
                    forwarded_chain,
                    source: IdentitySource::Header(name),
                });
            }
        }

        let peer = peer
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or(IdentityError::NoPeerAddress)?;
        Ok(ClientIdentity {
            address: peer.to_string(),
            forwarded_chain,
            source: IdentitySource::Peer,
        })
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_client_ip_header_wins() {
        let h = headers(&[(CLIENT_IP, "203.0.113.5")]);
        let identity = IdentityResolver::new().resolve(&h, Some("10.1.1.1")).unwrap();
        assert_eq!(identity.address, "203.0.113.5");
        assert_eq!(identity.source, IdentitySource::Header(CLIENT_IP));
    }

    #[test]
    fn test_private_client_ip_falls_through_to_forwarded_list() {
        let h = headers(&[
            (CLIENT_IP, "10.0.0.5"),
            (X_FORWARDED_FOR, "198.51.100.9, 10.0.0.5"),
        ]);
        let identity = IdentityResolver::new().resolve(&h, None).unwrap();
        assert_eq!(identity.address, "198.51.100.9");
        assert_eq!(
            identity.forwarded_chain,
            Some(vec!["198.51.100.9".to_string(), "10.0.0.5".to_string()])
        );
    }

    #[test]
    fn test_forwarded_list_skips_private_entries() {
        let h = headers(&[(X_FORWARDED_FOR, "192.168.1.4 ,  8.8.4.4, 9.9.9.9")]);
        let identity = IdentityResolver::new().resolve(&h, None).unwrap();
        assert_eq!(identity.address, "8.8.4.4");
    }

    #[test]
    fn test_lower_priority_headers() {
        let h = headers(&[
            (X_FORWARDED, "127.0.0.1"),
            (X_CLUSTER_CLIENT_IP, "93.184.216.34"),
        ]);
        let identity = IdentityResolver::new().resolve(&h, Some("10.0.0.1")).unwrap();
        assert_eq!(identity.address, "93.184.216.34");
    }

    #[test]
    fn test_falls_back_to_raw_peer() {
        let h = headers(&[(CLIENT_IP, "not-an-ip"), (X_FORWARDED_HOST, "example.com")]);
        let identity = IdentityResolver::new().resolve(&h, Some("127.0.0.1")).unwrap();
        assert_eq!(identity.address, "127.0.0.1");
        assert_eq!(identity.source, IdentitySource::Peer);
    }

    #[test]
    fn test_nothing_available() {
        let err = IdentityResolver::new().resolve(&HeaderMap::new(), None).unwrap_err();
        assert_eq!(err, IdentityError::NoPeerAddress);
    }

    #[test]
    fn test_non_routable_ranges() {
        for ip in [
            "0.0.0.0",
            "2.255.255.255",
            "10.20.30.40",
            "127.0.0.1",
            "169.254.1.1",
            "172.16.0.1",
            "172.31.255.255",
            "192.0.2.77",
            "192.168.0.1",
            "255.255.255.255",
        ] {
            assert!(!is_public_ipv4(ip), "{} should be rejected", ip);
        }
        for ip in ["3.0.0.0", "172.15.255.255", "172.32.0.0", "192.0.3.1", "203.0.113.5"] {
            assert!(is_public_ipv4(ip), "{} should be accepted", ip);
        }
        assert!(!is_public_ipv4("::1"));
        assert!(!is_public_ipv4("1.2.3"));
    }
}
