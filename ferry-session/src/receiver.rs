//! Inbound transfer drive loop.
//!
//! Runs over an already-accepted connection whose offer has been read and
//! admitted. Chunks are verified individually as they arrive and the whole
//! file is re-hashed before the blob is committed, so a `Verified` close is
//! only ever sent for bytes that match the offer.

use std::sync::Arc;

use ferry_protocol::wire::{
    read_frame, sha256, write_frame, ChunkFrame, ChunkReply, OfferReply, TransferClose,
    TransferOffer,
};
use ferry_protocol::{FerryError, Result};
use ferry_store::ContentStore;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{info, warn};

use crate::config::TransferConfig;
use crate::registry::SessionHandle;
use crate::state::SessionState;
use crate::util::timed;

/// Drives one inbound session to a terminal state.
///
/// Cancellation abandons the receive; the partially written bytes stay on
/// disk and the upload is marked failed, which is what later resume attempts
/// look for.
pub async fn run_receiver<S, R>(
    handle: Arc<SessionHandle>,
    store: Arc<ContentStore>,
    offer: TransferOffer,
    mut send: S,
    mut recv: R,
    local_user: String,
    cfg: TransferConfig,
) where
    S: AsyncWrite + Send + Unpin,
    R: AsyncRead + Send + Unpin,
{
    let outcome = tokio::select! {
        _ = handle.wait_cancelled() => {
            info!(session_id = %handle.id(), "inbound transfer cancelled");
            return;
        }
        res = drive_receiver(&handle, &store, &offer, &mut send, &mut recv, &local_user, &cfg) => res,
    };

    if let Err(e) = outcome {
        handle.fail(&e);
    }
}

async fn drive_receiver<S, R>(
    handle: &SessionHandle,
    store: &ContentStore,
    offer: &TransferOffer,
    send: &mut S,
    recv: &mut R,
    local_user: &str,
    cfg: &TransferConfig,
) -> Result<()>
where
    S: AsyncWrite + Send + Unpin,
    R: AsyncRead + Send + Unpin,
{
    handle.transition(SessionState::Connecting)?;

    if offer.chunk_size == 0 {
        let reason = "offered chunk size of zero".to_string();
        let _ = write_frame(send, &OfferReply::Reject { reason: reason.clone() }).await;
        return Err(FerryError::Protocol(reason));
    }
    let chunk_size = offer.chunk_size.min(cfg.chunk_size);

    // Bytes kept from an earlier interrupted attempt, floored to a chunk
    // boundary so the sender restarts on a whole chunk.
    let kept = store
        .partial_for_resume(&offer.upload_id, offer.file_hash)
        .unwrap_or(0);
    let full_chunks_in_file = offer.file_size - offer.file_size % chunk_size as u64;
    let boundary = (kept - kept % chunk_size as u64).min(full_chunks_in_file);
    let resume_from = (boundary / chunk_size as u64) as u32;

    let mut slot = match store
        .begin_receive(
            &offer.upload_id,
            &offer.file_name,
            local_user,
            offer.file_size,
            offer.file_hash,
            boundary,
        )
        .await
    {
        Ok(slot) => slot,
        Err(e) => {
            // A conflicting claim clears once the other writer finishes,
            // so tell the sender to redial instead of giving up.
            let reply = match &e {
                FerryError::Conflict(_) => OfferReply::Busy {
                    reason: e.to_string(),
                },
                _ => OfferReply::Reject {
                    reason: e.to_string(),
                },
            };
            let _ = write_frame(send, &reply).await;
            return Err(e);
        }
    };

    // Kept bytes feed the whole-file hash just like freshly received ones.
    let mut hasher = Sha256::new();
    if boundary > 0 {
        let mut prefix = slot.resumed_prefix_reader().await?;
        let mut remaining = boundary;
        let mut buf = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let want = (buf.len() as u64).min(remaining) as usize;
            prefix
                .read_exact(&mut buf[..want])
                .await
                .map_err(|e| FerryError::Storage(format!("failed to re-read kept bytes: {e}")))?;
            hasher.update(&buf[..want]);
            remaining -= want as u64;
        }
    }

    timed(
        cfg.io_timeout,
        "send accept",
        write_frame(
            send,
            &OfferReply::Accept {
                chunk_size,
                resume_from,
            },
        ),
    )
    .await?;

    handle.transition(SessionState::Transferring)?;
    handle.record_progress(boundary)?;

    info!(
        session_id = %handle.id(),
        upload_id = %offer.upload_id,
        sender = %offer.sender,
        file_size = offer.file_size,
        chunk_size,
        resume_from,
        "receiving chunks"
    );

    let chunk_count = offer.file_size.div_ceil(chunk_size as u64) as u32;
    let mut pause_rx = handle.paused();
    let mut expected = resume_from;
    let mut mismatches = 0u32;

    while expected < chunk_count {
        let chunk: ChunkFrame =
            timed(cfg.io_timeout, "read chunk", read_frame(recv)).await?;
        if chunk.index != expected {
            return Err(FerryError::Protocol(format!(
                "expected chunk {expected}, got {}",
                chunk.index
            )));
        }

        if sha256(&chunk.data) != chunk.checksum {
            mismatches += 1;
            if mismatches > cfg.max_chunk_retries {
                return Err(FerryError::Integrity {
                    session_id: handle.id(),
                    detail: format!(
                        "chunk {expected} failed checksum after {} retransmissions",
                        cfg.max_chunk_retries
                    ),
                });
            }
            warn!(index = expected, mismatches, "chunk checksum mismatch, requesting retransmit");
            timed(
                cfg.io_timeout,
                "send chunk reply",
                write_frame(send, &ChunkReply::ChecksumMismatch { index: expected }),
            )
            .await?;
            continue;
        }

        let offset = expected as u64 * chunk_size as u64;
        let want = (offer.file_size - offset).min(chunk_size as u64) as usize;
        if chunk.data.len() != want {
            return Err(FerryError::Protocol(format!(
                "chunk {expected} carried {} bytes, expected {want}",
                chunk.data.len()
            )));
        }

        slot.write(&chunk.data).await?;
        hasher.update(&chunk.data);
        handle.record_progress(chunk.data.len() as u64)?;
        mismatches = 0;
        expected += 1;

        if *pause_rx.borrow_and_update() {
            timed(
                cfg.io_timeout,
                "send chunk reply",
                write_frame(send, &ChunkReply::Pause { index: chunk.index }),
            )
            .await?;
            handle.transition(SessionState::Paused)?;
            // Held until the local operator lifts the pause; no deadline.
            while *pause_rx.borrow_and_update() {
                if pause_rx.changed().await.is_err() {
                    break;
                }
            }
            handle.transition(SessionState::Transferring)?;
            timed(
                cfg.io_timeout,
                "send resume",
                write_frame(send, &ChunkReply::Resume),
            )
            .await?;
        } else {
            timed(
                cfg.io_timeout,
                "send chunk reply",
                write_frame(send, &ChunkReply::Ack { index: chunk.index }),
            )
            .await?;
        }
    }

    let digest = hasher.finalize();
    if digest.as_slice() != offer.file_hash {
        drop(slot);
        let _ = write_frame(send, &TransferClose::HashMismatch).await;
        return Err(FerryError::Integrity {
            session_id: handle.id(),
            detail: "whole-file hash did not match the offer".into(),
        });
    }

    slot.commit().await?;
    timed(
        cfg.io_timeout,
        "send close",
        write_frame(send, &TransferClose::Verified),
    )
    .await?;
    handle.transition(SessionState::Completed)?;
    info!(
        session_id = %handle.id(),
        upload_id = %offer.upload_id,
        "inbound transfer verified and committed"
    );
    Ok(())
}
