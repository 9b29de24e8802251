//! Resolved peer directory.
//!
//! Configured host identifiers are resolved once at startup. Every inbound
//! datagram is attributed by its source address, so after resolution the
//! directory is keyed by address within each role.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use hub_proto::{PeerRole, Secret};
use tracing::{info, warn};

use crate::config::{PeerEntry, PeerTable};
use crate::error::RelayError;

/// A resolved counterparty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Name as written in the configuration.
    pub name: String,
    /// Resolved address, or the name itself when resolution failed.
    pub address: String,
    /// Local port this counterparty talks to.
    pub port: u16,
    /// Remote port datagrams to this counterparty go to.
    pub send_port: u16,
    /// Shared secret.
    pub secret: Secret,
    /// Role of the counterparty.
    pub role: PeerRole,
}

impl Peer {
    /// Creates a peer whose send port equals its listen port.
    #[must_use]
    pub fn new(
        role: PeerRole,
        name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        secret: impl Into<Secret>,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
            send_port: port,
            secret: secret.into(),
            role,
        }
    }

    /// Overrides the remote port.
    #[must_use]
    pub const fn with_send_port(mut self, send_port: u16) -> Self {
        self.send_port = send_port;
        self
    }

    /// `address:port`, the stable identity recorded on gossip from this peer.
    #[must_use]
    pub fn origin(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Destination for datagrams sent to this peer.
    #[must_use]
    pub fn destination(&self) -> (&str, u16) {
        (self.address.as_str(), self.send_port)
    }
}

/// Peers by role, keyed by resolved address.
#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    roles: BTreeMap<PeerRole, BTreeMap<String, Peer>>,
}

impl PeerDirectory {
    /// Resolves every configured peer.
    ///
    /// A name that fails to resolve is kept verbatim, with a warning; traffic
    /// from it can then only match if the name is itself an address.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::DuplicatePeer`] if two names under one role
    /// resolve to the same address.
    pub async fn resolve(table: &PeerTable) -> Result<Self, RelayError> {
        let sections = [
            (PeerRole::Source, &table.sources),
            (PeerRole::Upstream, &table.upstream),
            (PeerRole::Downstream, &table.downstream),
        ];

        let mut peers = Vec::new();
        for (role, section) in sections {
            for (name, entry) in section {
                let address = resolve_name(name).await;
                peers.push(peer_from_entry(role, name, address, entry));
            }
        }

        let directory = Self::from_peers(peers)?;
        info!(
            sources = directory.peers(PeerRole::Source).count(),
            upstream = directory.peers(PeerRole::Upstream).count(),
            downstream = directory.peers(PeerRole::Downstream).count(),
            "peer directory resolved"
        );
        Ok(directory)
    }

    /// Builds a directory from already resolved peers.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::DuplicatePeer`] if two peers share a role and an
    /// address.
    pub fn from_peers(peers: impl IntoIterator<Item = Peer>) -> Result<Self, RelayError> {
        let mut roles: BTreeMap<PeerRole, BTreeMap<String, Peer>> = BTreeMap::new();
        for peer in peers {
            let by_address = roles.entry(peer.role).or_default();
            if let Some(existing) = by_address.get(&peer.address) {
                return Err(RelayError::DuplicatePeer {
                    role: peer.role,
                    address: peer.address.clone(),
                    first: existing.name.clone(),
                    second: peer.name,
                });
            }
            by_address.insert(peer.address.clone(), peer);
        }
        Ok(Self { roles })
    }

    /// Looks up the peer with `address` in `role`.
    #[must_use]
    pub fn peer(&self, role: PeerRole, address: &str) -> Option<&Peer> {
        self.roles.get(&role).and_then(|peers| peers.get(address))
    }

    /// Returns true if `address` is configured under any role.
    #[must_use]
    pub fn is_known(&self, address: &str) -> bool {
        self.roles.values().any(|peers| peers.contains_key(address))
    }

    /// Peers of one role, ordered by address.
    pub fn peers(&self, role: PeerRole) -> impl Iterator<Item = &Peer> {
        self.roles.get(&role).into_iter().flat_map(BTreeMap::values)
    }

    /// Distinct local ports across all roles, ascending.
    #[must_use]
    pub fn listen_ports(&self) -> Vec<u16> {
        self.roles
            .values()
            .flat_map(BTreeMap::values)
            .map(|peer| peer.port)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Total number of peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.roles.values().map(BTreeMap::len).sum()
    }

    /// Returns true if no peers are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn peer_from_entry(role: PeerRole, name: &str, address: String, entry: &PeerEntry) -> Peer {
    let peer = Peer::new(role, name, address, entry.port, entry.secret.clone());
    match entry.send_port {
        Some(send_port) => peer.with_send_port(send_port),
        None => peer,
    }
}

async fn resolve_name(name: &str) -> String {
    if let Ok(ip) = name.parse::<IpAddr>() {
        return ip.to_string();
    }

    match tokio::net::lookup_host((name, 0)).await {
        Ok(addrs) => {
            let addrs: Vec<_> = addrs.map(|addr| addr.ip()).collect();
            let chosen = addrs
                .iter()
                .find(|ip| ip.is_ipv4())
                .or_else(|| addrs.first());
            match chosen {
                Some(ip) => {
                    let address = ip.to_string();
                    info!(name, address = %address, "resolved peer");
                    address
                }
                None => {
                    warn!(name, "peer resolved to no addresses, using name as given");
                    name.to_string()
                }
            }
        }
        Err(e) => {
            warn!(name, error = %e, "failed to resolve peer, using name as given");
            name.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(port: u16, secret: &str) -> PeerEntry {
        PeerEntry {
            port,
            secret: Secret::from(secret),
            send_port: None,
        }
    }

    #[test]
    fn test_lookup_by_role_and_address() {
        let directory = PeerDirectory::from_peers([
            Peer::new(PeerRole::Source, "game", "10.0.0.1", 27967, "a"),
            Peer::new(PeerRole::Upstream, "hub", "10.0.0.2", 9534, "b"),
        ])
        .expect("directory");

        assert!(directory.peer(PeerRole::Source, "10.0.0.1").is_some());
        assert!(directory.peer(PeerRole::Upstream, "10.0.0.1").is_none());
        assert!(directory.is_known("10.0.0.2"));
        assert!(!directory.is_known("10.0.0.3"));
        assert_eq!(directory.len(), 2);
    }

    #[test]
    fn test_same_address_in_two_roles_is_allowed() {
        let directory = PeerDirectory::from_peers([
            Peer::new(PeerRole::Upstream, "hub", "10.0.0.2", 9534, "b"),
            Peer::new(PeerRole::Downstream, "hub", "10.0.0.2", 9535, "b"),
        ])
        .expect("directory");

        assert_eq!(directory.len(), 2);
        assert_eq!(directory.listen_ports(), vec![9534, 9535]);
    }

    #[test]
    fn test_duplicate_address_in_one_role_is_rejected() {
        let result = PeerDirectory::from_peers([
            Peer::new(PeerRole::Source, "a", "10.0.0.1", 1, "a"),
            Peer::new(PeerRole::Source, "b", "10.0.0.1", 2, "b"),
        ]);

        assert!(matches!(
            result,
            Err(RelayError::DuplicatePeer { role: PeerRole::Source, .. })
        ));
    }

    #[test]
    fn test_listen_ports_are_distinct() {
        let directory = PeerDirectory::from_peers([
            Peer::new(PeerRole::Source, "a", "10.0.0.1", 27967, "a"),
            Peer::new(PeerRole::Source, "b", "10.0.0.2", 27967, "b"),
            Peer::new(PeerRole::Upstream, "c", "10.0.0.3", 9534, "c"),
        ])
        .expect("directory");

        assert_eq!(directory.listen_ports(), vec![9534, 27967]);
    }

    #[test]
    fn test_origin_and_destination() {
        let peer =
            Peer::new(PeerRole::Downstream, "hub", "10.0.0.2", 9535, "s").with_send_port(2821);
        assert_eq!(peer.origin(), "10.0.0.2:9535");
        assert_eq!(peer.destination(), ("10.0.0.2", 2821));
    }

    #[tokio::test]
    async fn test_resolve_literal_addresses() {
        let mut table = PeerTable::default();
        table.sources.insert("127.0.0.1".to_string(), entry(27967, "s"));
        let mut downstream = entry(9535, "d");
        downstream.send_port = Some(9534);
        table.downstream.insert("127.0.0.2".to_string(), downstream);

        let directory = PeerDirectory::resolve(&table).await.expect("resolve");

        let source = directory.peer(PeerRole::Source, "127.0.0.1").expect("source");
        assert_eq!(source.port, 27967);
        assert_eq!(source.send_port, 27967);
        let hub = directory.peer(PeerRole::Downstream, "127.0.0.2").expect("downstream");
        assert_eq!(hub.send_port, 9534);
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let mut table = PeerTable::default();
        table.upstream.insert("localhost".to_string(), entry(9534, "s"));

        let directory = PeerDirectory::resolve(&table).await.expect("resolve");

        assert!(directory.peer(PeerRole::Upstream, "127.0.0.1").is_some());
    }

    #[tokio::test]
    async fn test_unresolvable_name_is_kept() {
        let mut table = PeerTable::default();
        table
            .sources
            .insert("no-such-host.invalid".to_string(), entry(27967, "s"));

        let directory = PeerDirectory::resolve(&table).await.expect("resolve");

        assert!(directory.peer(PeerRole::Source, "no-such-host.invalid").is_some());
    }
}
