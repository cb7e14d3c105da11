//! Peer ID to network endpoint resolution.
//!
//! Discovery itself is an external collaborator; the coordinator only needs
//! something that maps an opaque peer ID to a connectable address. The
//! default [`StaticResolver`] is a runtime-updatable table, suitable for
//! configs listing known peers or for a discovery service to feed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use ferry_protocol::error::{FerryError, Result};
use ferry_protocol::PeerId;

/// Maps a peer ID to a connectable socket address.
pub trait Resolver: Send + Sync {
    /// Resolve `peer`, or `NotFound` if no endpoint is known for it.
    fn resolve(&self, peer: &PeerId) -> Result<SocketAddr>;
}

/// In-memory peer table.
#[derive(Default)]
pub struct StaticResolver {
    peers: Mutex<HashMap<PeerId, SocketAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the endpoint for a peer.
    pub fn insert(&self, peer: PeerId, addr: SocketAddr) {
        self.peers.lock().unwrap().insert(peer, addr);
    }

    /// Forget a peer.
    pub fn remove(&self, peer: &PeerId) {
        self.peers.lock().unwrap().remove(peer);
    }
}

impl Resolver for StaticResolver {
    fn resolve(&self, peer: &PeerId) -> Result<SocketAddr> {
        self.peers
            .lock()
            .unwrap()
            .get(peer)
            .copied()
            .ok_or_else(|| FerryError::NotFound(format!("no endpoint known for peer {peer}")))
    }
}
