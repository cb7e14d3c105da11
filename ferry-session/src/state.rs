//! Per-transfer state machine.
//!
//! Transitions are closed: anything not listed in [`TransferSession::transition`]
//! is rejected, so a logic bug surfaces as an error instead of a silently
//! corrupted session.

use std::time::Instant;

use ferry_protocol::{FerryError, PeerId, Result, SessionId, UploadId};

/// Lifecycle of a single transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Connecting,
    Transferring,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Connecting => "connecting",
            SessionState::Transferring => "transferring",
            SessionState::Paused => "paused",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        }
    }
}

/// Which side of the wire this session drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Snapshot of one transfer between a local upload and a remote peer.
#[derive(Debug, Clone)]
pub struct TransferSession {
    pub session_id: SessionId,
    pub upload_id: UploadId,
    pub peer_id: PeerId,
    pub direction: Direction,
    pub state: SessionState,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub retry_count: u32,
    pub error: Option<String>,
    pub finished_at: Option<Instant>,
}

impl TransferSession {
    pub fn new(
        upload_id: UploadId,
        peer_id: PeerId,
        direction: Direction,
        total_bytes: u64,
    ) -> Self {
        Self {
            session_id: SessionId::generate(),
            upload_id,
            peer_id,
            direction,
            state: SessionState::Created,
            bytes_transferred: 0,
            total_bytes,
            retry_count: 0,
            error: None,
            finished_at: None,
        }
    }

    /// Moves to `next` if the edge exists in the lifecycle graph.
    ///
    /// Completion additionally requires every byte to be accounted for.
    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        use SessionState::*;
        let allowed = match (self.state, next) {
            (Created, Connecting) => true,
            (Connecting, Transferring) => true,
            // Reconnect attempts loop back through Connecting. A session
            // can lose its connection while paused, so Paused reconnects
            // too.
            (Connecting | Transferring | Paused, Connecting) => true,
            (Transferring, Paused) | (Paused, Transferring) => true,
            (Transferring, Completed) => {
                if self.bytes_transferred != self.total_bytes {
                    return Err(FerryError::InvalidTransition {
                        from: self.state.name(),
                        to: next.name(),
                    });
                }
                true
            }
            (Connecting | Transferring | Paused, Failed) => true,
            (from, Cancelled) if !from.is_terminal() => true,
            _ => false,
        };
        if !allowed {
            return Err(FerryError::InvalidTransition {
                from: self.state.name(),
                to: next.name(),
            });
        }
        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(Instant::now());
        }
        Ok(())
    }

    /// Accounts `delta` more bytes. Progress only moves while transferring
    /// and never past the declared total.
    pub fn record_progress(&mut self, delta: u64) -> Result<()> {
        if self.state != SessionState::Transferring {
            return Err(FerryError::Protocol(format!(
                "progress recorded in state {}",
                self.state.name()
            )));
        }
        let next = self.bytes_transferred.saturating_add(delta);
        if next > self.total_bytes {
            return Err(FerryError::Protocol(format!(
                "progress {next} exceeds total {}",
                self.total_bytes
            )));
        }
        self.bytes_transferred = next;
        Ok(())
    }

    /// Raises the progress counter to an absolute byte position.
    ///
    /// Used when reconnecting: the peer's resume point may trail what was
    /// already acknowledged, and progress never moves backwards.
    pub fn advance_to(&mut self, position: u64) -> Result<()> {
        if self.state != SessionState::Transferring {
            return Err(FerryError::Protocol(format!(
                "progress recorded in state {}",
                self.state.name()
            )));
        }
        if position > self.total_bytes {
            return Err(FerryError::Protocol(format!(
                "progress {position} exceeds total {}",
                self.total_bytes
            )));
        }
        self.bytes_transferred = self.bytes_transferred.max(position);
        Ok(())
    }
}
