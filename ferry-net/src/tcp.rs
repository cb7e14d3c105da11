//! TCP transport: outbound dialing through a resolver and an inbound
//! listener that forwards accepted connections over a channel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ferry_protocol::error::{FerryError, Result};
use ferry_protocol::PeerId;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::{Connector, Resolver};

/// Default time allowed for a TCP connect.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Dials peers over TCP using a [`Resolver`] for endpoint lookup.
pub struct TcpConnector {
    resolver: Arc<dyn Resolver>,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self {
            resolver,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Connector for TcpConnector {
    type SendStream = OwnedWriteHalf;
    type RecvStream = OwnedReadHalf;

    async fn connect(&self, peer: &PeerId) -> Result<(Self::SendStream, Self::RecvStream)> {
        let addr = self.resolver.resolve(peer)?;
        tracing::debug!(peer = %peer, addr = %addr, "dialing peer");

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| FerryError::Connection(format!("connect to {addr} timed out")))?
            .map_err(|e| FerryError::Connection(format!("connect to {addr} failed: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| FerryError::Connection(format!("set_nodelay failed: {e}")))?;

        tracing::info!(peer = %peer, addr = %addr, "connected to peer");
        let (recv, send) = stream.into_split();
        Ok((send, recv))
    }
}

/// One accepted inbound connection.
pub struct IncomingStream {
    pub remote_addr: SocketAddr,
    pub send: OwnedWriteHalf,
    pub recv: OwnedReadHalf,
}

/// Accepts inbound transfer connections and forwards them over a channel.
pub struct TransferListener {
    local_addr: SocketAddr,
    incoming: mpsc::UnboundedReceiver<IncomingStream>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl TransferListener {
    /// Bind and start accepting in the background.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| FerryError::Connection(format!("bind {addr} failed: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| FerryError::Connection(format!("local_addr failed: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote_addr)) => {
                        tracing::info!(remote = %remote_addr, "accepted inbound connection");
                        let _ = stream.set_nodelay(true);
                        let (recv, send) = stream.into_split();
                        if tx
                            .send(IncomingStream {
                                remote_addr,
                                send,
                                recv,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }
        });

        tracing::info!(addr = %local_addr, "transfer listener bound");
        Ok(Self {
            local_addr,
            incoming: rx,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next inbound connection, or `None` once the listener shuts down.
    pub async fn accept(&mut self) -> Option<IncomingStream> {
        self.incoming.recv().await
    }
}

impl Drop for TransferListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}
