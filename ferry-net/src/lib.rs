//! Peer connectivity: endpoint resolution, connectors, and listeners.
//!
//! The [`Connector`] trait abstracts how a peer ID becomes a pair of byte
//! streams. [`tcp::TcpConnector`] dials real sockets through a [`Resolver`];
//! [`memory::MemoryNetwork`] wires peers together in-process for tests.

pub mod memory;
pub mod resolver;
pub mod tcp;

use ferry_protocol::error::Result;
use ferry_protocol::PeerId;

pub use memory::{MemoryConnector, MemoryNetwork};
pub use resolver::{Resolver, StaticResolver};
pub use tcp::{IncomingStream, TcpConnector, TransferListener};

/// Establishes a bidirectional byte-stream connection to a peer.
///
/// Implemented by [`TcpConnector`] for real sockets and [`MemoryConnector`]
/// for in-process tests. The connect future is `Send` so session tasks
/// driving a generic connector can be spawned.
pub trait Connector: Send + Sync {
    /// The send half of the connection.
    type SendStream: tokio::io::AsyncWrite + Send + Unpin;
    /// The receive half of the connection.
    type RecvStream: tokio::io::AsyncRead + Send + Unpin;

    /// Connect to `peer`.
    ///
    /// Transport-level failures (unreachable, refused, timed out) surface as
    /// retryable `Connection` errors; an unresolvable peer is `NotFound`.
    fn connect(
        &self,
        peer: &PeerId,
    ) -> impl std::future::Future<Output = Result<(Self::SendStream, Self::RecvStream)>> + Send;
}
