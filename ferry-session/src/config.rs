//! Tunables for transfer sessions.

use std::time::Duration;

/// Knobs governing chunking, retries, and timeouts for every session.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Preferred chunk size; the receiver may negotiate down.
    pub chunk_size: u32,
    /// Connect/transport retries before a session fails.
    pub max_session_retries: u32,
    /// Retransmissions of a single chunk before the session fails with an
    /// integrity error.
    pub max_chunk_retries: u32,
    /// Deadline for each network operation; expiry counts as a retryable
    /// connection error.
    pub io_timeout: Duration,
    /// How long terminal sessions stay visible in the registry.
    pub retention: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 256 * 1024,
            max_session_retries: 3,
            max_chunk_retries: 3,
            io_timeout: Duration::from_secs(30),
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}
