//! Outbound transfer drive loop.
//!
//! One task per session: connect, offer, stream chunks stop-and-wait, then
//! read the receiver's whole-file verdict. Transient connection faults
//! reconnect with exponential backoff; the receiver's accept tells the
//! sender which chunk to restart from.

use std::sync::Arc;

use ferry_net::Connector;
use ferry_protocol::wire::{
    read_frame, sha256, write_frame, ChunkFrame, ChunkReply, OfferReply, TransferClose,
    TransferOffer, PROTOCOL_VERSION,
};
use ferry_protocol::{FerryError, PeerId, Result};
use ferry_store::{ContentStore, FileUpload, UploadStatus};
use tracing::{info, warn};

use crate::backoff::backoff_delay;
use crate::config::TransferConfig;
use crate::registry::SessionHandle;
use crate::state::SessionState;
use crate::util::timed;

/// Drives one outbound session to a terminal state.
///
/// Cancellation preempts any in-flight network operation. The upload's
/// store status tracks the outcome: `Sent` on success, back to `Stored`
/// otherwise so the blob stays available for another attempt.
pub async fn run_sender<C: Connector>(
    handle: Arc<SessionHandle>,
    store: Arc<ContentStore>,
    connector: Arc<C>,
    local_peer: PeerId,
    cfg: TransferConfig,
) {
    let upload_id = handle.snapshot().upload_id;

    let outcome = tokio::select! {
        _ = handle.wait_cancelled() => {
            info!(session_id = %handle.id(), "outbound transfer cancelled");
            let _ = store.set_status(&upload_id, UploadStatus::Stored);
            return;
        }
        res = drive_sender(&handle, &store, &*connector, &local_peer, &cfg) => res,
    };

    match outcome {
        Ok(()) => {
            let _ = store.set_status(&upload_id, UploadStatus::Sent);
        }
        Err(e) => {
            handle.fail(&e);
            let _ = store.set_status(&upload_id, UploadStatus::Stored);
        }
    }
}

async fn drive_sender<C: Connector>(
    handle: &SessionHandle,
    store: &ContentStore,
    connector: &C,
    local_peer: &PeerId,
    cfg: &TransferConfig,
) -> Result<()> {
    let snap = handle.snapshot();
    handle.transition(SessionState::Connecting)?;
    let record = store.metadata(&snap.upload_id)?;
    store.set_status(&record.id, UploadStatus::Sending)?;

    let mut attempt = 0u32;
    loop {
        match attempt_transfer(handle, store, connector, local_peer, &record, &snap.peer_id, cfg)
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && attempt < cfg.max_session_retries => {
                let retries = handle.add_retry();
                let delay = backoff_delay(attempt);
                warn!(
                    session_id = %snap.session_id,
                    peer_id = %snap.peer_id,
                    retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transfer attempt failed, reconnecting"
                );
                tokio::time::sleep(delay).await;
                handle.transition(SessionState::Connecting)?;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn attempt_transfer<C: Connector>(
    handle: &SessionHandle,
    store: &ContentStore,
    connector: &C,
    local_peer: &PeerId,
    record: &FileUpload,
    peer: &PeerId,
    cfg: &TransferConfig,
) -> Result<()> {
    let (mut send, mut recv) = timed(cfg.io_timeout, "connect", connector.connect(peer)).await?;

    let offer = TransferOffer {
        version: PROTOCOL_VERSION,
        upload_id: record.id.clone(),
        sender: local_peer.clone(),
        file_name: record.filename.clone(),
        file_size: record.size,
        file_hash: record.sha256,
        chunk_size: cfg.chunk_size,
    };
    timed(cfg.io_timeout, "send offer", write_frame(&mut send, &offer)).await?;

    let reply: OfferReply =
        timed(cfg.io_timeout, "read offer reply", read_frame(&mut recv)).await?;
    let (chunk_size, resume_from) = match reply {
        OfferReply::Accept {
            chunk_size,
            resume_from,
        } => (chunk_size, resume_from),
        OfferReply::Reject { reason } => return Err(FerryError::PeerRejected(reason)),
        // Retryable: the peer may still be tearing down a stale session
        // for this upload after a connection drop.
        OfferReply::Busy { reason } => {
            return Err(FerryError::Connection(format!("peer busy: {reason}")))
        }
    };
    if chunk_size == 0 || chunk_size > offer.chunk_size {
        return Err(FerryError::Protocol(format!(
            "peer negotiated invalid chunk size {chunk_size}"
        )));
    }

    let mut reader = store.reader(&record.id, chunk_size).await?;
    if resume_from > reader.chunk_count() {
        return Err(FerryError::Protocol(format!(
            "peer requested resume from chunk {resume_from} of {}",
            reader.chunk_count()
        )));
    }
    reader.seek_to(resume_from).await?;

    handle.transition(SessionState::Transferring)?;
    handle.advance_to((resume_from as u64 * chunk_size as u64).min(record.size))?;

    info!(
        session_id = %handle.id(),
        upload_id = %record.id,
        peer_id = %peer,
        file_size = record.size,
        chunk_size,
        resume_from,
        "streaming chunks"
    );

    while let Some((index, data)) = reader.next_chunk().await? {
        send_chunk(handle, &mut send, &mut recv, index, data, chunk_size, record.size, cfg)
            .await?;
    }

    let close: TransferClose =
        timed(cfg.io_timeout, "read close", read_frame(&mut recv)).await?;
    match close {
        TransferClose::Verified => {
            handle.transition(SessionState::Completed)?;
            info!(session_id = %handle.id(), upload_id = %record.id, "transfer verified");
            Ok(())
        }
        TransferClose::HashMismatch => Err(FerryError::Integrity {
            session_id: handle.id(),
            detail: "receiver reported whole-file hash mismatch".into(),
        }),
    }
}

/// Sends one chunk and waits for its reply, retransmitting on checksum
/// rejection up to the configured limit.
#[allow(clippy::too_many_arguments)]
async fn send_chunk<S, R>(
    handle: &SessionHandle,
    send: &mut S,
    recv: &mut R,
    index: u32,
    data: Vec<u8>,
    chunk_size: u32,
    file_size: u64,
    cfg: &TransferConfig,
) -> Result<()>
where
    S: tokio::io::AsyncWrite + Unpin,
    R: tokio::io::AsyncRead + Unpin,
{
    let acked_position = ((index as u64 + 1) * chunk_size as u64).min(file_size);
    let frame = ChunkFrame {
        index,
        checksum: sha256(&data),
        data,
    };

    let mut mismatches = 0u32;
    loop {
        timed(cfg.io_timeout, "send chunk", write_frame(send, &frame)).await?;
        let reply: ChunkReply =
            timed(cfg.io_timeout, "read chunk reply", read_frame(recv)).await?;
        match reply {
            ChunkReply::Ack { index: acked } if acked == index => {
                handle.advance_to(acked_position)?;
                return Ok(());
            }
            ChunkReply::Pause { index: acked } if acked == index => {
                handle.advance_to(acked_position)?;
                handle.transition(SessionState::Paused)?;
                // The receiver decides when to lift the pause; no deadline.
                let resume: ChunkReply = read_frame(recv).await?;
                if !matches!(resume, ChunkReply::Resume) {
                    return Err(FerryError::Protocol(format!(
                        "expected resume after pause, got {resume:?}"
                    )));
                }
                handle.transition(SessionState::Transferring)?;
                return Ok(());
            }
            ChunkReply::ChecksumMismatch { index: rejected } if rejected == index => {
                mismatches += 1;
                if mismatches > cfg.max_chunk_retries {
                    return Err(FerryError::Integrity {
                        session_id: handle.id(),
                        detail: format!(
                            "chunk {index} failed checksum after {} retransmissions",
                            cfg.max_chunk_retries
                        ),
                    });
                }
                warn!(index, mismatches, "chunk checksum rejected, retransmitting");
            }
            other => {
                return Err(FerryError::Protocol(format!(
                    "unexpected chunk reply: {other:?}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Direction, TransferSession};
    use ferry_net::memory::{MemRecv, MemSend, MemoryNetwork};
    use ferry_protocol::UploadId;
    use std::time::Duration;
    use tempfile::TempDir;

    fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "debug".into()),
            )
            .with_test_writer()
            .try_init();
    }

    fn test_cfg() -> TransferConfig {
        TransferConfig {
            chunk_size: 1024,
            ..TransferConfig::default()
        }
    }

    struct Harness {
        store: Arc<ContentStore>,
        record: FileUpload,
        data: Vec<u8>,
        handle: Arc<SessionHandle>,
        _tmp: TempDir,
    }

    fn harness(size: usize) -> Harness {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(ContentStore::open(tmp.path().to_path_buf()).unwrap());
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let record = store.store("blob.bin", "alice", &data).unwrap();
        let session = TransferSession::new(
            record.id.clone(),
            PeerId("bob".into()),
            Direction::Outbound,
            record.size,
        );
        Harness {
            store,
            record,
            data,
            handle: SessionHandle::new(session),
            _tmp: tmp,
        }
    }

    async fn read_offer(recv: &mut MemRecv) -> TransferOffer {
        read_frame(recv).await.unwrap()
    }

    async fn accept(send: &mut MemSend, chunk_size: u32, resume_from: u32) {
        write_frame(
            send,
            &OfferReply::Accept {
                chunk_size,
                resume_from,
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn completes_when_receiver_verifies() {
        init_test_tracing();
        let h = harness(2500);
        let net = MemoryNetwork::new();
        let mut inbound = net.register_peer(&PeerId("bob".into()));

        let expected = h.data.clone();
        let peer = tokio::spawn(async move {
            let (mut send, mut recv) = inbound.recv().await.unwrap();
            let offer = read_offer(&mut recv).await;
            assert_eq!(offer.version, PROTOCOL_VERSION);
            assert_eq!(offer.file_size, 2500);
            accept(&mut send, offer.chunk_size, 0).await;

            let mut received = Vec::new();
            for expected_index in 0..3u32 {
                let chunk: ChunkFrame = read_frame(&mut recv).await.unwrap();
                assert_eq!(chunk.index, expected_index);
                assert_eq!(chunk.checksum, sha256(&chunk.data));
                received.extend_from_slice(&chunk.data);
                write_frame(&mut send, &ChunkReply::Ack { index: chunk.index })
                    .await
                    .unwrap();
            }
            assert_eq!(received, expected);
            write_frame(&mut send, &TransferClose::Verified).await.unwrap();
        });

        run_sender(
            Arc::clone(&h.handle),
            Arc::clone(&h.store),
            Arc::new(net.connector()),
            PeerId("alice".into()),
            test_cfg(),
        )
        .await;
        peer.await.unwrap();

        let snap = h.handle.snapshot();
        assert_eq!(snap.state, SessionState::Completed);
        assert_eq!(snap.bytes_transferred, snap.total_bytes);
        assert_eq!(snap.retry_count, 0);
        assert_eq!(
            h.store.metadata(&h.record.id).unwrap().status,
            UploadStatus::Sent
        );
    }

    #[tokio::test]
    async fn rejection_fails_without_retry() {
        init_test_tracing();
        let h = harness(100);
        let net = MemoryNetwork::new();
        let mut inbound = net.register_peer(&PeerId("bob".into()));

        let peer = tokio::spawn(async move {
            let (mut send, mut recv) = inbound.recv().await.unwrap();
            let _ = read_offer(&mut recv).await;
            write_frame(
                &mut send,
                &OfferReply::Reject {
                    reason: "storage full".into(),
                },
            )
            .await
            .unwrap();
        });

        run_sender(
            Arc::clone(&h.handle),
            Arc::clone(&h.store),
            Arc::new(net.connector()),
            PeerId("alice".into()),
            test_cfg(),
        )
        .await;
        peer.await.unwrap();

        let snap = h.handle.snapshot();
        assert_eq!(snap.state, SessionState::Failed);
        assert_eq!(snap.retry_count, 0);
        assert!(snap.error.unwrap().contains("storage full"));
        // The blob remains available for another attempt.
        assert_eq!(
            h.store.metadata(&h.record.id).unwrap().status,
            UploadStatus::Stored
        );
    }

    #[tokio::test]
    async fn repeated_checksum_rejection_is_an_integrity_failure() {
        init_test_tracing();
        let h = harness(100);
        let net = MemoryNetwork::new();
        let mut inbound = net.register_peer(&PeerId("bob".into()));

        let peer = tokio::spawn(async move {
            let (mut send, mut recv) = inbound.recv().await.unwrap();
            let offer = read_offer(&mut recv).await;
            accept(&mut send, offer.chunk_size, 0).await;

            // Reject the same chunk four times: the first send plus the
            // three permitted retransmissions.
            let mut rejections = 0;
            while let Ok(chunk) = read_frame::<_, ChunkFrame>(&mut recv).await {
                rejections += 1;
                write_frame(&mut send, &ChunkReply::ChecksumMismatch { index: chunk.index })
                    .await
                    .unwrap();
            }
            rejections
        });

        run_sender(
            Arc::clone(&h.handle),
            Arc::clone(&h.store),
            Arc::new(net.connector()),
            PeerId("alice".into()),
            test_cfg(),
        )
        .await;

        assert_eq!(peer.await.unwrap(), 4);
        let snap = h.handle.snapshot();
        assert_eq!(snap.state, SessionState::Failed);
        assert!(snap.error.unwrap().contains("checksum"));
    }

    #[tokio::test(start_paused = true)]
    async fn connection_failures_retry_with_backoff_then_fail() {
        init_test_tracing();
        let h = harness(100);
        let net = MemoryNetwork::new();
        // Peer is registered but every dial is refused.
        let _inbound = net.register_peer(&PeerId("bob".into()));
        net.fail_next_connects(&PeerId("bob".into()), 16);

        let started = tokio::time::Instant::now();
        run_sender(
            Arc::clone(&h.handle),
            Arc::clone(&h.store),
            Arc::new(net.connector()),
            PeerId("alice".into()),
            test_cfg(),
        )
        .await;

        let snap = h.handle.snapshot();
        assert_eq!(snap.state, SessionState::Failed);
        assert_eq!(snap.retry_count, 3);
        // Backoff between the four attempts: 1s + 2s + 4s.
        assert!(started.elapsed() >= Duration::from_secs(7));
        assert_eq!(
            h.store.metadata(&h.record.id).unwrap().status,
            UploadStatus::Stored
        );
    }

    #[tokio::test]
    async fn pause_reply_holds_the_session_until_resume() {
        init_test_tracing();
        let h = harness(2500);
        let net = MemoryNetwork::new();
        let mut inbound = net.register_peer(&PeerId("bob".into()));

        let observer = Arc::clone(&h.handle);
        let peer = tokio::spawn(async move {
            let (mut send, mut recv) = inbound.recv().await.unwrap();
            let offer = read_offer(&mut recv).await;
            accept(&mut send, offer.chunk_size, 0).await;

            let chunk: ChunkFrame = read_frame(&mut recv).await.unwrap();
            write_frame(&mut send, &ChunkReply::Pause { index: chunk.index })
                .await
                .unwrap();
            // Give the sender a moment to apply the pause before lifting it.
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(observer.snapshot().state, SessionState::Paused);
            write_frame(&mut send, &ChunkReply::Resume).await.unwrap();

            for _ in 0..2 {
                let chunk: ChunkFrame = read_frame(&mut recv).await.unwrap();
                write_frame(&mut send, &ChunkReply::Ack { index: chunk.index })
                    .await
                    .unwrap();
            }
            write_frame(&mut send, &TransferClose::Verified).await.unwrap();
        });

        run_sender(
            Arc::clone(&h.handle),
            Arc::clone(&h.store),
            Arc::new(net.connector()),
            PeerId("alice".into()),
            test_cfg(),
        )
        .await;
        peer.await.unwrap();

        assert_eq!(h.handle.snapshot().state, SessionState::Completed);
    }

    #[tokio::test]
    async fn connection_drop_while_paused_reconnects() {
        init_test_tracing();
        let h = harness(2500);
        let net = MemoryNetwork::new();
        let mut inbound = net.register_peer(&PeerId("bob".into()));

        let peer = tokio::spawn(async move {
            // First connection: pause after the first chunk, then vanish
            // without ever lifting it.
            {
                let (mut send, mut recv) = inbound.recv().await.unwrap();
                let offer = read_offer(&mut recv).await;
                accept(&mut send, offer.chunk_size, 0).await;
                let chunk: ChunkFrame = read_frame(&mut recv).await.unwrap();
                write_frame(&mut send, &ChunkReply::Pause { index: chunk.index })
                    .await
                    .unwrap();
            }
            // Second connection: resume past the acknowledged chunk.
            let (mut send, mut recv) = inbound.recv().await.unwrap();
            let offer = read_offer(&mut recv).await;
            accept(&mut send, offer.chunk_size, 1).await;
            for _ in 0..2 {
                let chunk: ChunkFrame = read_frame(&mut recv).await.unwrap();
                write_frame(&mut send, &ChunkReply::Ack { index: chunk.index })
                    .await
                    .unwrap();
            }
            write_frame(&mut send, &TransferClose::Verified).await.unwrap();
        });

        run_sender(
            Arc::clone(&h.handle),
            Arc::clone(&h.store),
            Arc::new(net.connector()),
            PeerId("alice".into()),
            test_cfg(),
        )
        .await;
        peer.await.unwrap();

        let snap = h.handle.snapshot();
        assert_eq!(snap.state, SessionState::Completed);
        assert_eq!(snap.retry_count, 1);
        assert_eq!(snap.bytes_transferred, snap.total_bytes);
        assert_eq!(
            h.store.metadata(&h.record.id).unwrap().status,
            UploadStatus::Sent
        );
    }

    #[tokio::test]
    async fn busy_reply_redials_instead_of_failing() {
        init_test_tracing();
        let h = harness(100);
        let net = MemoryNetwork::new();
        let mut inbound = net.register_peer(&PeerId("bob".into()));

        let peer = tokio::spawn(async move {
            // First dial lands while the peer still holds a stale session
            // for this upload.
            {
                let (mut send, mut recv) = inbound.recv().await.unwrap();
                let _ = read_offer(&mut recv).await;
                write_frame(
                    &mut send,
                    &OfferReply::Busy {
                        reason: "an earlier session is still closing".into(),
                    },
                )
                .await
                .unwrap();
            }
            // Second dial goes through.
            let (mut send, mut recv) = inbound.recv().await.unwrap();
            let offer = read_offer(&mut recv).await;
            accept(&mut send, offer.chunk_size, 0).await;
            let chunk: ChunkFrame = read_frame(&mut recv).await.unwrap();
            write_frame(&mut send, &ChunkReply::Ack { index: chunk.index })
                .await
                .unwrap();
            write_frame(&mut send, &TransferClose::Verified).await.unwrap();
        });

        run_sender(
            Arc::clone(&h.handle),
            Arc::clone(&h.store),
            Arc::new(net.connector()),
            PeerId("alice".into()),
            test_cfg(),
        )
        .await;
        peer.await.unwrap();

        let snap = h.handle.snapshot();
        assert_eq!(snap.state, SessionState::Completed);
        assert_eq!(snap.retry_count, 1);
        assert_eq!(
            h.store.metadata(&h.record.id).unwrap().status,
            UploadStatus::Sent
        );
    }

    #[tokio::test]
    async fn cancellation_preempts_a_stalled_peer() {
        init_test_tracing();
        let h = harness(2500);
        let net = MemoryNetwork::new();
        let mut inbound = net.register_peer(&PeerId("bob".into()));

        let peer = tokio::spawn(async move {
            let (mut send, mut recv) = inbound.recv().await.unwrap();
            let offer = read_offer(&mut recv).await;
            accept(&mut send, offer.chunk_size, 0).await;
            let chunk: ChunkFrame = read_frame(&mut recv).await.unwrap();
            write_frame(&mut send, &ChunkReply::Ack { index: chunk.index })
                .await
                .unwrap();
            // Stall: never reply to the next chunk.
            std::future::pending::<()>().await;
        });

        let canceller = Arc::clone(&h.handle);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel().unwrap();
        });

        run_sender(
            Arc::clone(&h.handle),
            Arc::clone(&h.store),
            Arc::new(net.connector()),
            PeerId("alice".into()),
            test_cfg(),
        )
        .await;
        peer.abort();

        let snap = h.handle.snapshot();
        assert_eq!(snap.state, SessionState::Cancelled);
        assert!(snap.bytes_transferred < snap.total_bytes);
        assert_eq!(
            h.store.metadata(&h.record.id).unwrap().status,
            UploadStatus::Stored
        );
    }

    #[tokio::test]
    async fn missing_upload_fails_before_dialing() {
        init_test_tracing();
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(ContentStore::open(tmp.path().to_path_buf()).unwrap());
        let net = MemoryNetwork::new();

        let session = TransferSession::new(
            UploadId("ghost".into()),
            PeerId("bob".into()),
            Direction::Outbound,
            10,
        );
        let handle = SessionHandle::new(session);

        run_sender(
            Arc::clone(&handle),
            store,
            Arc::new(net.connector()),
            PeerId("alice".into()),
            test_cfg(),
        )
        .await;

        let snap = handle.snapshot();
        assert_eq!(snap.state, SessionState::Failed);
        assert!(snap.error.unwrap().contains("ghost"));
    }
}
