//! In-process transport for tests: peers connected by `tokio::io::duplex`
//! pipes, with connect-failure injection for exercising retry paths. No
//! sockets involved.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ferry_protocol::error::{FerryError, Result};
use ferry_protocol::PeerId;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use crate::Connector;

/// Send half of an in-memory connection.
pub type MemSend = WriteHalf<DuplexStream>;
/// Receive half of an in-memory connection.
pub type MemRecv = ReadHalf<DuplexStream>;

const PIPE_CAPACITY: usize = 1024 * 1024;

struct NetInner {
    peers: HashMap<PeerId, mpsc::UnboundedSender<(MemSend, MemRecv)>>,
    fail_next: HashMap<PeerId, u32>,
}

/// A simulated network of in-process peers.
pub struct MemoryNetwork {
    inner: Mutex<NetInner>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(NetInner {
                peers: HashMap::new(),
                fail_next: HashMap::new(),
            }),
        })
    }

    /// Attach a peer to the network. Returns the stream of inbound
    /// connections other peers open to it.
    pub fn register_peer(&self, peer: &PeerId) -> mpsc::UnboundedReceiver<(MemSend, MemRecv)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().peers.insert(peer.clone(), tx);
        rx
    }

    /// Detach a peer; subsequent connects to it fail as unreachable.
    pub fn unregister_peer(&self, peer: &PeerId) {
        self.inner.lock().unwrap().peers.remove(peer);
    }

    /// Make the next `count` connects to `peer` fail with a retryable
    /// connection error.
    pub fn fail_next_connects(&self, peer: &PeerId, count: u32) {
        self.inner.lock().unwrap().fail_next.insert(peer.clone(), count);
    }

    /// A connector dialing through this network.
    pub fn connector(self: &Arc<Self>) -> MemoryConnector {
        MemoryConnector {
            net: Arc::clone(self),
        }
    }
}

/// [`Connector`] over a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryConnector {
    net: Arc<MemoryNetwork>,
}

impl Connector for MemoryConnector {
    type SendStream = MemSend;
    type RecvStream = MemRecv;

    async fn connect(&self, peer: &PeerId) -> Result<(MemSend, MemRecv)> {
        let mut inner = self.net.inner.lock().unwrap();

        if let Some(remaining) = inner.fail_next.get_mut(peer) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FerryError::Connection(format!(
                    "injected connect failure to peer {peer}"
                )));
            }
        }

        let tx = inner
            .peers
            .get(peer)
            .ok_or_else(|| FerryError::Connection(format!("peer {peer} is unreachable")))?;

        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        let (near_recv, near_send) = tokio::io::split(near);
        let (far_recv, far_send) = tokio::io::split(far);

        tx.send((far_send, far_recv))
            .map_err(|_| FerryError::Connection(format!("peer {peer} went away")))?;

        tracing::debug!(peer = %peer, "in-memory connection established");
        Ok((near_send, near_recv))
    }
}
