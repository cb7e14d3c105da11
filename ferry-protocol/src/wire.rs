//! Transfer wire protocol: messages and length-prefixed postcard framing.
//!
//! Every message travels as a u32 length prefix followed by a postcard
//! payload. A transfer is one offer/reply handshake, a stop-and-wait chunk
//! exchange, and a final close message carrying the receiver's whole-file
//! verification verdict.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::FerryError;
use crate::types::{PeerId, UploadId};

/// Wire protocol version, first byte of every offer.
pub const PROTOCOL_VERSION: u8 = 1;

/// Upper bound on any single frame. Caps memory per read regardless of what
/// the remote claims.
pub const MAX_FRAME_LEN: u32 = 2 * 1024 * 1024;

/// Sender's opening message describing the file it wants to transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOffer {
    pub version: u8,
    pub upload_id: UploadId,
    pub sender: PeerId,
    pub file_name: String,
    pub file_size: u64,
    pub file_hash: [u8; 32],
    /// Chunk size the sender proposes; the receiver may negotiate down.
    pub chunk_size: u32,
}

/// Receiver's answer to a [`TransferOffer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OfferReply {
    /// Transfer accepted with the negotiated chunk size.
    ///
    /// `resume_from` is the first chunk the receiver still needs; non-zero
    /// when it kept partial bytes from an earlier interrupted attempt.
    Accept { chunk_size: u32, resume_from: u32 },
    /// Transfer declined; the session fails with `PeerRejected`.
    Reject { reason: String },
    /// Receiver cannot take this transfer right now, typically because an
    /// earlier session for the same upload is still winding down. The
    /// sender treats this as retryable and redials after backoff.
    Busy { reason: String },
}

/// One fixed-size slice of file bytes with its own checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFrame {
    pub index: u32,
    pub checksum: [u8; 32],
    pub data: Vec<u8>,
}

/// Receiver's per-chunk response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkReply {
    /// Chunk received and checksum verified.
    Ack { index: u32 },
    /// Chunk received, but the sender must hold off until [`ChunkReply::Resume`].
    Pause { index: u32 },
    /// Lifts a previous pause.
    Resume,
    /// Checksum mismatch; the sender retransmits this chunk.
    ChecksumMismatch { index: u32 },
}

/// Receiver's final verdict after the last chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferClose {
    /// Whole-file hash matched the offer.
    Verified,
    /// Whole-file hash did not match; the session fails with `IntegrityError`.
    HashMismatch,
}

/// SHA-256 of a byte slice.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let digest = Sha256::new().chain_update(data).finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Write one length-prefixed postcard frame.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), FerryError>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let bytes = postcard::to_allocvec(msg)
        .map_err(|e| FerryError::Protocol(format!("failed to encode frame: {e}")))?;
    if bytes.len() as u32 > MAX_FRAME_LEN {
        return Err(FerryError::Protocol(format!(
            "frame too large: {} bytes",
            bytes.len()
        )));
    }
    writer
        .write_u32(bytes.len() as u32)
        .await
        .map_err(conn_err)?;
    writer.write_all(&bytes).await.map_err(conn_err)?;
    writer.flush().await.map_err(conn_err)?;
    Ok(())
}

/// Read one length-prefixed postcard frame.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, FerryError>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await.map_err(conn_err)?;
    if len > MAX_FRAME_LEN {
        return Err(FerryError::Protocol(format!(
            "peer announced oversized frame: {len} bytes"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await.map_err(conn_err)?;
    postcard::from_bytes(&buf)
        .map_err(|e| FerryError::Protocol(format!("failed to decode frame: {e}")))
}

fn conn_err(e: std::io::Error) -> FerryError {
    FerryError::Connection(e.to_string())
}
