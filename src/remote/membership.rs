use std::fmt;

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// One collector node reachable for dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
    /// Whether this address is the local node.
    pub is_self: bool,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16, is_self: bool) -> Self {
        Self {
            host: host.into(),
            port,
            is_self,
        }
    }

    /// Parses "host:port".
    pub fn parse(addr: &str, is_self: bool) -> Result<Self> {
        let Some((host, port)) = addr.rsplit_once(':') else {
            bail!("peer address {addr} must be host:port");
        };
        if host.is_empty() {
            bail!("peer address {addr} has an empty host");
        }
        let port = port
            .parse()
            .with_context(|| format!("parsing port of peer address {addr}"))?;

        Ok(Self::new(host, port, is_self))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Source of the current cluster peer list, self included.
pub trait ClusterMembership: Send + Sync {
    fn current_peers(&self) -> Vec<PeerAddress>;
}

/// Sorts and de-duplicates peers so every node computes the same
/// assignment from the same membership.
pub fn normalize(mut peers: Vec<PeerAddress>) -> Vec<PeerAddress> {
    // Duplicates keep the self-flagged entry.
    peers.sort_by(|a, b| {
        (&a.host, a.port)
            .cmp(&(&b.host, b.port))
            .then(b.is_self.cmp(&a.is_self))
    });
    peers.dedup_by(|a, b| a.host == b.host && a.port == b.port);
    peers
}

/// Membership backed by a configured list, replaceable at runtime.
pub struct StaticMembership {
    peers: RwLock<Vec<PeerAddress>>,
}

impl StaticMembership {
    pub fn new(peers: Vec<PeerAddress>) -> Self {
        Self {
            peers: RwLock::new(normalize(peers)),
        }
    }

    /// A single-node cluster containing only the local node.
    pub fn standalone() -> Self {
        Self::new(vec![PeerAddress::new("127.0.0.1", 0, true)])
    }

    /// Builds the member list from "host:port" strings, flagging the one
    /// equal to `self_address`. The local node is added if missing.
    pub fn from_addresses(self_address: &str, addresses: &[String]) -> Result<Self> {
        let local = PeerAddress::parse(self_address, true).context("parsing self_address")?;

        let mut peers = Vec::with_capacity(addresses.len() + 1);
        for addr in addresses {
            let peer = PeerAddress::parse(addr, false)?;
            let is_self = peer.host == local.host && peer.port == local.port;
            peers.push(PeerAddress { is_self, ..peer });
        }
        if !peers.iter().any(|p| p.is_self) {
            peers.push(local);
        }

        Ok(Self::new(peers))
    }

    pub fn set_peers(&self, peers: Vec<PeerAddress>) {
        *self.peers.write() = normalize(peers);
    }
}

impl ClusterMembership for StaticMembership {
    fn current_peers(&self) -> Vec<PeerAddress> {
        self.peers.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peer_address() {
        let peer = PeerAddress::parse("10.0.0.2:11800", false).unwrap();
        assert_eq!(peer, PeerAddress::new("10.0.0.2", 11800, false));
        assert_eq!(peer.to_string(), "10.0.0.2:11800");

        assert!(PeerAddress::parse("10.0.0.2", false).is_err());
        assert!(PeerAddress::parse(":80", false).is_err());
        assert!(PeerAddress::parse("host:notaport", false).is_err());
    }

    #[test]
    fn test_normalize_sorts_and_dedups() {
        let peers = normalize(vec![
            PeerAddress::new("b", 1, false),
            PeerAddress::new("a", 2, false),
            PeerAddress::new("b", 1, true),
            PeerAddress::new("a", 1, false),
        ]);
        let addrs: Vec<String> = peers.iter().map(ToString::to_string).collect();
        assert_eq!(addrs, vec!["a:1", "a:2", "b:1"]);
        assert!(peers[2].is_self);
    }

    #[test]
    fn test_from_addresses_flags_self() {
        let membership = StaticMembership::from_addresses(
            "10.0.0.2:11800",
            &["10.0.0.3:11800".to_string(), "10.0.0.2:11800".to_string()],
        )
        .unwrap();

        let peers = membership.current_peers();
        assert_eq!(peers.len(), 2);
        assert!(peers[0].is_self);
        assert!(!peers[1].is_self);
    }

    #[test]
    fn test_from_addresses_adds_missing_self() {
        let membership =
            StaticMembership::from_addresses("10.0.0.9:1", &["10.0.0.3:1".to_string()]).unwrap();
        let peers = membership.current_peers();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers.iter().filter(|p| p.is_self).count(), 1);
    }

    #[test]
    fn test_set_peers_replaces_snapshot() {
        let membership = StaticMembership::standalone();
        assert_eq!(membership.current_peers().len(), 1);

        membership.set_peers(vec![
            PeerAddress::new("a", 1, true),
            PeerAddress::new("b", 1, false),
        ]);
        assert_eq!(membership.current_peers().len(), 2);
    }
}
