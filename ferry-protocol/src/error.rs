//! Error taxonomy shared by all ferry crates.
//!
//! Callers match on variants to decide what to display; sessions use
//! [`FerryError::is_retryable`] to decide whether a failed attempt consumes
//! the retry budget or fails the session outright.

use thiserror::Error;

use crate::types::{PeerId, SessionId, UploadId};

/// All errors surfaced by the ferry coordinator.
#[derive(Debug, Error)]
pub enum FerryError {
    /// Disk or metadata I/O failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// No record exists for the given identifier.
    #[error("not found: {0}")]
    NotFound(String),

    /// A non-terminal session already exists for this (upload, peer) pair.
    #[error("transfer already in progress for upload {upload_id} to peer {peer_id}")]
    DuplicateSession {
        upload_id: UploadId,
        peer_id: PeerId,
    },

    /// Another writer currently holds this upload ID.
    #[error("conflicting write to upload {0}")]
    Conflict(UploadId),

    /// Transport-level failure. Retryable within the session's budget.
    #[error("connection error: {0}")]
    Connection(String),

    /// The remote peer declined the transfer. Not retryable.
    #[error("peer rejected transfer: {0}")]
    PeerRejected(String),

    /// A checksum did not match. Fatal for the session, not for the store.
    #[error("integrity error in session {session_id}: {detail}")]
    Integrity {
        session_id: SessionId,
        detail: String,
    },

    /// The remote peer violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A state machine transition that the session lifecycle forbids.
    #[error("invalid session transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    /// User configuration could not be read or written.
    #[error("config error: {0}")]
    Config(String),
}

impl FerryError {
    /// Whether a session may retry after this error.
    ///
    /// Only transport failures (including per-operation timeouts) are
    /// retryable; everything else surfaces immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FerryError::Connection(_))
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, FerryError>;
