//! Shared fixtures: coordinators wired together over an in-memory network.

use std::sync::Arc;

use ferry_app::{Coordinator, Settings};
use ferry_net::memory::{MemoryConnector, MemoryNetwork};
use ferry_protocol::PeerId;
use ferry_session::TransferConfig;
use tempfile::TempDir;

pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with_test_writer()
        .try_init();
}

pub struct TestPeer {
    pub coordinator: Arc<Coordinator<MemoryConnector>>,
    pub peer_id: PeerId,
    _tmp: TempDir,
}

/// Bring up a coordinator attached to the network under `name`, with a task
/// feeding inbound connections into it.
pub fn spawn_peer(net: &Arc<MemoryNetwork>, name: &str, max_upload_bytes: u64) -> TestPeer {
    let tmp = TempDir::new().unwrap();
    let settings = Settings {
        username: name.to_string(),
        user_id: name.to_string(),
        storage_dir: tmp.path().join("data"),
        max_upload_bytes,
        allowed_extensions: Vec::new(),
    };
    let coordinator = Arc::new(
        Coordinator::new(
            settings,
            tmp.path().join("config"),
            net.connector(),
            TransferConfig::default(),
        )
        .unwrap(),
    );

    let peer_id = PeerId(name.to_string());
    let mut inbound = net.register_peer(&peer_id);
    let acceptor = Arc::clone(&coordinator);
    tokio::spawn(async move {
        while let Some((send, recv)) = inbound.recv().await {
            let coordinator = Arc::clone(&acceptor);
            tokio::spawn(async move {
                let _ = coordinator.handle_incoming(send, recv).await;
            });
        }
    });

    TestPeer {
        coordinator,
        peer_id,
        _tmp: tmp,
    }
}
