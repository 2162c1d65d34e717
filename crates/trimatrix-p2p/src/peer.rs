// crates/trimatrix-p2p/src/peer.rs
//
// Connected-peer bookkeeping. Each peer holds the sender side of its
// connection's outgoing line queue; the writer task owns the socket half.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use trimatrix_core::MatrixError;

/// Who opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerDirection {
    Inbound,
    Outbound,
}

/// Connection lifecycle: Connecting -> Open -> Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    Connecting,
    Open,
    Closed,
}

/// Externally visible peer state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub address: String,
    pub direction: PeerDirection,
    pub status: PeerStatus,
    pub protocol: String,
}

/// A connected peer: its advertised address, negotiated protocol label,
/// and the outgoing line queue.
#[derive(Debug)]
pub struct Peer {
    pub info: PeerInfo,
    tx: mpsc::Sender<String>,
}

impl Peer {
    pub fn new(
        address: String,
        direction: PeerDirection,
        protocol: String,
        tx: mpsc::Sender<String>,
    ) -> Self {
        Self {
            info: PeerInfo {
                address,
                direction,
                status: PeerStatus::Open,
                protocol,
            },
            tx,
        }
    }

    /// Clone of the outgoing queue handle, for sends that must wait for
    /// queue space without holding the peer set lock.
    pub fn sender(&self) -> mpsc::Sender<String> {
        self.tx.clone()
    }

    /// Queue a line without waiting. Fails when the queue is full or the
    /// connection's writer task has already gone away.
    pub fn try_send(&self, line: String) -> Result<(), MatrixError> {
        self.tx.try_send(line).map_err(|e| {
            let state = match e {
                mpsc::error::TrySendError::Full(_) => "full",
                mpsc::error::TrySendError::Closed(_) => "closed",
            };
            MatrixError::Network(format!("peer {} write queue {}", self.info.address, state))
        })
    }
}

/// The set of active peers, keyed by advertised address.
#[derive(Debug, Default)]
pub struct PeerSet {
    peers: HashMap<String, Peer>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.peers.contains_key(address)
    }

    pub fn insert(&mut self, peer: Peer) {
        self.peers.insert(peer.info.address.clone(), peer);
    }

    pub fn remove(&mut self, address: &str) -> Option<Peer> {
        self.peers.remove(address)
    }

    /// Advertised addresses of all active peers.
    pub fn addresses(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    pub fn infos(&self) -> Vec<PeerInfo> {
        self.peers.values().map(|p| p.info.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }
}
