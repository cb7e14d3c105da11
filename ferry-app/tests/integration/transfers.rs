//! End-to-end transfers between two coordinators over the in-memory
//! network.

use std::time::Duration;

use ferry_net::memory::MemoryNetwork;
use ferry_protocol::wire::{
    read_frame, sha256, write_frame, ChunkFrame, OfferReply, TransferOffer,
};
use ferry_protocol::{FerryError, PeerId};
use ferry_session::{Direction, SessionState};
use ferry_store::UploadStatus;

use crate::helpers::{init_test_tracing, spawn_peer};

const TEN_MIB: u64 = 10 * 1024 * 1024;

#[tokio::test]
async fn ten_mebibyte_file_transfers_end_to_end() {
    init_test_tracing();
    let net = MemoryNetwork::new();
    let alice = spawn_peer(&net, "alice", TEN_MIB);
    let bob = spawn_peer(&net, "bob", TEN_MIB);

    let data: Vec<u8> = (0..TEN_MIB).map(|i| (i % 251) as u8).collect();
    let record = alice.coordinator.upload_file("big.bin", &data).unwrap();
    assert_eq!(record.size, TEN_MIB);

    let session = alice
        .coordinator
        .send_file(&record.id, &bob.peer_id)
        .unwrap();
    assert_eq!(
        alice.coordinator.wait_for(&session).await.unwrap(),
        SessionState::Completed
    );

    let status = alice.coordinator.transfer_status(&session).unwrap();
    assert_eq!(status.bytes_transferred, status.total_bytes);
    assert_eq!(status.retry_count, 0);
    assert_eq!(
        alice.coordinator.upload_metadata(&record.id).unwrap().status,
        UploadStatus::Sent
    );

    // Bob's side surfaces the admitted transfer through receive_file.
    let inbound = bob.coordinator.receive_file().await.unwrap();
    let snap = inbound.snapshot();
    assert_eq!(snap.direction, Direction::Inbound);
    assert_eq!(snap.upload_id, record.id);
    assert_eq!(inbound.wait_terminal().await, SessionState::Completed);
    assert_eq!(bob.coordinator.list_transfers().len(), 1);

    let received = bob.coordinator.upload_metadata(&record.id).unwrap();
    assert_eq!(received.status, UploadStatus::Stored);
    assert_eq!(received.size, TEN_MIB);
    let bytes = std::fs::read(&received.storage_path).unwrap();
    assert_eq!(sha256(&bytes), record.sha256);
}

#[tokio::test(start_paused = true)]
async fn unreachable_peer_exhausts_retries_and_fails() {
    init_test_tracing();
    let net = MemoryNetwork::new();
    let alice = spawn_peer(&net, "alice", TEN_MIB);

    let record = alice.coordinator.upload_file("lost.bin", &[3u8; 4096]).unwrap();
    let session = alice
        .coordinator
        .send_file(&record.id, &PeerId("nobody".into()))
        .unwrap();

    assert_eq!(
        alice.coordinator.wait_for(&session).await.unwrap(),
        SessionState::Failed
    );
    let status = alice.coordinator.transfer_status(&session).unwrap();
    assert_eq!(status.retry_count, 3);
    assert!(status.error.unwrap().contains("connection"));
    // The upload stays stored and sendable.
    assert_eq!(
        alice.coordinator.upload_metadata(&record.id).unwrap().status,
        UploadStatus::Stored
    );
}

#[tokio::test]
async fn receiver_policy_rejection_surfaces_to_the_sender() {
    init_test_tracing();
    let net = MemoryNetwork::new();
    // Alice accepts larger uploads than Bob does.
    let alice = spawn_peer(&net, "alice", 20 * 1024 * 1024);
    let bob = spawn_peer(&net, "bob", TEN_MIB);

    let data = vec![0u8; (TEN_MIB + 1) as usize];
    let record = alice.coordinator.upload_file("big.bin", &data).unwrap();
    let session = alice
        .coordinator
        .send_file(&record.id, &bob.peer_id)
        .unwrap();

    assert_eq!(
        alice.coordinator.wait_for(&session).await.unwrap(),
        SessionState::Failed
    );
    let status = alice.coordinator.transfer_status(&session).unwrap();
    assert!(status.error.unwrap().contains("limit"));
    assert!(bob.coordinator.list_uploads().unwrap().is_empty());
}

#[tokio::test]
async fn cancellation_stops_a_stalled_transfer() {
    init_test_tracing();
    let net = MemoryNetwork::new();
    let alice = spawn_peer(&net, "alice", TEN_MIB);

    // A hand-scripted peer that accepts the offer and then goes silent.
    let mut inbound = net.register_peer(&PeerId("mallory".into()));
    tokio::spawn(async move {
        let (mut send, mut recv) = inbound.recv().await.unwrap();
        let offer: TransferOffer = read_frame(&mut recv).await.unwrap();
        write_frame(
            &mut send,
            &OfferReply::Accept {
                chunk_size: offer.chunk_size,
                resume_from: 0,
            },
        )
        .await
        .unwrap();
        let _: ChunkFrame = read_frame(&mut recv).await.unwrap();
        std::future::pending::<()>().await;
    });

    let record = alice.coordinator.upload_file("stall.bin", &[9u8; 8192]).unwrap();
    let session = alice
        .coordinator
        .send_file(&record.id, &PeerId("mallory".into()))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    alice.coordinator.cancel_transfer(&session).unwrap();
    assert_eq!(
        alice.coordinator.wait_for(&session).await.unwrap(),
        SessionState::Cancelled
    );
    // Cancelling again stays a no-op.
    alice.coordinator.cancel_transfer(&session).unwrap();
    assert_eq!(
        alice.coordinator.upload_metadata(&record.id).unwrap().status,
        UploadStatus::Stored
    );
}

#[tokio::test]
async fn deleted_uploads_cannot_be_sent() {
    init_test_tracing();
    let net = MemoryNetwork::new();
    let alice = spawn_peer(&net, "alice", TEN_MIB);
    let bob = spawn_peer(&net, "bob", TEN_MIB);

    let record = alice.coordinator.upload_file("gone.txt", b"bytes").unwrap();
    alice.coordinator.delete_upload(&record.id).unwrap();

    let result = alice.coordinator.send_file(&record.id, &bob.peer_id);
    assert!(matches!(result, Err(FerryError::NotFound(_))));
}
