//! Peers and the channels that connect them
//!
//! A peer is a pair of unbounded channels: messages the remote sent us and
//! a sender for messages to the remote. Transport is out of scope; tests
//! and in-process setups wire two nodes together with `connected_peers`.

use super::message::SyncMessage;
use std::fmt;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(name: &str) -> Self {
        PeerId(name.to_string())
    }

    pub fn random() -> Self {
        PeerId(format!("peer_{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the remote side is to us
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Only receives what it asks for
    Client,
    /// Gets everything pushed to it and answers loads
    Server,
    /// Like a server, backed by persistent storage
    Storage,
}

impl PeerRole {
    /// Whether values are pushed to this peer unasked
    pub fn is_upstream(&self) -> bool {
        matches!(self, PeerRole::Server | PeerRole::Storage)
    }
}

#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    pub role: PeerRole,
    /// Keep asking this peer for values it said it lacks
    pub retry_unavailable: bool,
    pub incoming: mpsc::UnboundedReceiver<SyncMessage>,
    pub outgoing: mpsc::UnboundedSender<SyncMessage>,
}

impl Peer {
    pub fn new(
        id: PeerId,
        role: PeerRole,
        incoming: mpsc::UnboundedReceiver<SyncMessage>,
        outgoing: mpsc::UnboundedSender<SyncMessage>,
    ) -> Self {
        Peer {
            id,
            role,
            retry_unavailable: false,
            incoming,
            outgoing,
        }
    }

    pub fn with_retry_unavailable(mut self, retry: bool) -> Self {
        self.retry_unavailable = retry;
        self
    }
}

/// Two peers talking to each other over in-memory channels
///
/// Returns the peer handed to `a` (representing `b`) and the peer handed
/// to `b` (representing `a`). `roles` gives the role of `b` as seen by `a`
/// and of `a` as seen by `b`.
pub fn connected_peers(a: &str, b: &str, roles: (PeerRole, PeerRole)) -> (Peer, Peer) {
    let (to_b, from_a) = mpsc::unbounded_channel();
    let (to_a, from_b) = mpsc::unbounded_channel();
    (
        Peer::new(PeerId::new(b), roles.0, from_b, to_b),
        Peer::new(PeerId::new(a), roles.1, from_a, to_a),
    )
}
