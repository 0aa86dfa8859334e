//! Peer table, scoring and blacklist.

use std::net::SocketAddr;

use hashbrown::{HashMap, HashSet};
use tracing::{info, warn};

use crate::error::P2pError;
use crate::message::NodeMeta;

/// Connection id, unique for the process lifetime.
pub type PeerId = u64;

/// Admission and penalty policy.
#[derive(Clone, Copy, Debug)]
pub struct Policy {
    /// Connected peers allowed at once.
    pub max_peers: usize,
    /// Failed chain responses that get a peer blacklisted.
    pub ban_threshold: u32,
    /// Whether penalties blacklist the peer's IP.
    pub blacklisting: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_peers: 80,
            ban_threshold: 3,
            blacklisting: false,
        }
    }
}

/// A connected peer.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    /// Connection id.
    pub id: PeerId,
    /// Remote socket address.
    pub remote: SocketAddr,
    /// Whether we dialed this peer.
    pub outbound: bool,
    /// Address other nodes can dial, once known.
    pub advertised: Option<String>,
    /// Bus address from the peer's `META`.
    pub bus_address: Option<String>,
    /// Failed chain responses.
    pub score: u32,
}

/// Connected peers plus the IP blacklist.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<PeerId, PeerInfo>,
    blacklist: HashSet<String>,
    next_id: PeerId,
    policy: Policy,
}

/// Host part of a `host:port` address.
pub fn host_of(address: &str) -> &str {
    match address.parse::<SocketAddr>() {
        Ok(_) => address
            .rsplit_once(':')
            .map(|(h, _)| h.trim_start_matches('[').trim_end_matches(']'))
            .unwrap_or(address),
        Err(_) => address.split(':').next().unwrap_or(address),
    }
}

impl PeerTable {
    /// Empty table under `policy`.
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Current policy.
    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Register a connection.
    ///
    /// `dialed` is the address we connected to, for outbound connections.
    pub fn admit(&mut self, remote: SocketAddr, dialed: Option<String>) -> Result<PeerId, P2pError> {
        let ip = remote.ip().to_string();
        if self.blacklist.contains(&ip) {
            return Err(P2pError::Policy(format!("blacklisted peer {ip}")));
        }
        if self.peers.len() >= self.policy.max_peers {
            return Err(P2pError::Policy("peer limit reached".into()));
        }
        if self.peers.values().any(|p| p.remote == remote) {
            return Err(P2pError::Policy(format!("duplicated peer {remote}")));
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.peers.insert(
            id,
            PeerInfo {
                id,
                remote,
                outbound: dialed.is_some(),
                advertised: dialed,
                bus_address: None,
                score: 0,
            },
        );
        Ok(id)
    }

    /// Record a peer's `META`.
    ///
    /// Fails for a connection to ourselves or a second connection to the
    /// same node.
    pub fn identify(&mut self, id: PeerId, meta: &NodeMeta, own_bus_address: &str) -> Result<(), P2pError> {
        if meta.bus_address == own_bus_address {
            return Err(P2pError::Policy("self connection".into()));
        }
        let duplicate = self
            .peers
            .values()
            .any(|p| p.id != id && p.bus_address.as_deref() == Some(meta.bus_address.as_str()));
        if duplicate {
            return Err(P2pError::Policy(format!(
                "second connection to {}",
                meta.bus_address
            )));
        }
        let peer = self.peers.get_mut(&id).ok_or(P2pError::Disconnected)?;
        peer.bus_address = Some(meta.bus_address.clone());
        if peer.advertised.is_none() {
            if let Some(port) = meta.listen_port {
                peer.advertised = Some(SocketAddr::new(peer.remote.ip(), port).to_string());
            }
        }
        Ok(())
    }

    /// Forget a connection.
    pub fn remove(&mut self, id: PeerId) -> Option<PeerInfo> {
        self.peers.remove(&id)
    }

    /// Peer by id.
    pub fn get(&self, id: PeerId) -> Option<&PeerInfo> {
        self.peers.get(&id)
    }

    /// Add a failure point; returns `true` if the peer must be dropped.
    pub fn penalize(&mut self, id: PeerId) -> bool {
        let Some(peer) = self.peers.get_mut(&id) else {
            return false;
        };
        peer.score += 1;
        if !self.policy.blacklisting || peer.score < self.policy.ban_threshold {
            return false;
        }
        let ip = peer.remote.ip().to_string();
        warn!(peer = id, %ip, score = peer.score, "Add ip to blacklist");
        self.blacklist.insert(ip);
        true
    }

    /// Blacklist an IP.
    pub fn blacklist(&mut self, ip: impl Into<String>) {
        let ip = ip.into();
        if self.blacklist.insert(ip.clone()) {
            info!(%ip, "Add ip to blacklist");
        }
    }

    /// Whether `address` (`host` or `host:port`) is blacklisted.
    pub fn is_blacklisted(&self, address: &str) -> bool {
        self.blacklist.contains(host_of(address))
    }

    /// Connected peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peer is connected.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Connection ids.
    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    /// Dialable addresses of connected peers, sorted.
    pub fn addresses(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .peers
            .values()
            .filter_map(|p| p.advertised.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        out.sort();
        out
    }

    /// Addresses from `offered` worth dialing: unknown, not blacklisted,
    /// not in `own`, and within the peer limit.
    pub fn candidates(&self, offered: &[String], own: &[String]) -> Vec<String> {
        let known: HashSet<String> = self.addresses().into_iter().collect();
        let room = self.policy.max_peers.saturating_sub(self.peers.len());
        let mut seen = HashSet::new();
        offered
            .iter()
            .filter(|a| !known.contains(*a) && !own.contains(*a) && !self.is_blacklisted(a))
            .filter(|a| seen.insert(a.as_str()))
            .take(room)
            .cloned()
            .collect()
    }
}
