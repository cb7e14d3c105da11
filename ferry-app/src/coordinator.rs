//! The coordinator: the single facade tying the store, the session
//! registry, and the transport together.
//!
//! One coordinator per node. Outbound transfers are started with
//! [`Coordinator::send_file`]; inbound connections are handed to
//! [`Coordinator::handle_incoming`], either directly or through
//! [`Coordinator::spawn_acceptor`].

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ferry_net::{Connector, TransferListener};
use ferry_protocol::wire::{read_frame, write_frame, OfferReply, TransferOffer, PROTOCOL_VERSION};
use ferry_protocol::{FerryError, PeerId, Result, SessionId, UploadId};
use ferry_session::receiver::run_receiver;
use ferry_session::sender::run_sender;
use ferry_session::{
    Direction, SessionHandle, SessionRegistry, SessionState, TransferConfig, TransferSession,
};
use ferry_store::{ContentStore, FileUpload};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::settings::Settings;

pub struct Coordinator<C: Connector + 'static> {
    store: Arc<ContentStore>,
    registry: Arc<SessionRegistry>,
    connector: Arc<C>,
    settings: Mutex<Settings>,
    config_dir: PathBuf,
    local_peer: PeerId,
    transfer_cfg: TransferConfig,
    inbound_tx: mpsc::UnboundedSender<Arc<SessionHandle>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<SessionHandle>>>,
}

impl<C: Connector + 'static> Coordinator<C> {
    /// Open the content store and assemble the coordinator.
    pub fn new(
        settings: Settings,
        config_dir: PathBuf,
        connector: C,
        transfer_cfg: TransferConfig,
    ) -> Result<Self> {
        let store = Arc::new(ContentStore::open(settings.storage_dir.clone())?);
        let local_peer = PeerId(settings.user_id.clone());

        info!(user_id = %local_peer, username = settings.username, "coordinator started");
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Ok(Self {
            store,
            registry: Arc::new(SessionRegistry::new()),
            connector: Arc::new(connector),
            settings: Mutex::new(settings),
            config_dir,
            local_peer,
            transfer_cfg,
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        })
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    pub fn user_id(&self) -> String {
        self.settings.lock().unwrap().user_id.clone()
    }

    pub fn username(&self) -> String {
        self.settings.lock().unwrap().username.clone()
    }

    /// Update the display name and persist it.
    pub fn set_username(&self, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(FerryError::Config("username must not be empty".into()));
        }
        let mut settings = self.settings.lock().unwrap();
        settings.username = name.to_string();
        settings
            .save_to_dir(self.config_dir.clone())
            .map_err(|e| FerryError::Config(format!("failed to persist settings: {e:#}")))?;
        Ok(())
    }

    /// Store a local file, subject to the configured upload policy.
    pub fn upload_file(&self, filename: &str, bytes: &[u8]) -> Result<FileUpload> {
        let (user_id, verdict) = {
            let settings = self.settings.lock().unwrap();
            (
                settings.user_id.clone(),
                settings.check_upload(filename, bytes.len() as u64),
            )
        };
        if let Err(reason) = verdict {
            return Err(FerryError::Storage(format!(
                "upload {filename:?} refused: {reason}"
            )));
        }
        self.store.store(filename, &user_id, bytes)
    }

    pub fn upload_metadata(&self, id: &UploadId) -> Result<FileUpload> {
        self.store.metadata(id)
    }

    pub fn list_uploads(&self) -> Result<Vec<FileUpload>> {
        self.store.list(&self.user_id())
    }

    /// Delete a local upload. Only the uploader may delete it; other
    /// users' uploads are reported as not found. Idempotent for uploads
    /// this user already deleted.
    pub fn delete_upload(&self, id: &UploadId) -> Result<()> {
        if let Ok(record) = self.store.metadata(id) {
            if record.user_id != self.user_id() {
                return Err(FerryError::NotFound(format!("upload {id}")));
            }
        }
        self.store.delete(id)
    }

    /// Delete uploads older than `age`. Returns how many were removed.
    pub fn cleanup_old_uploads(&self, age: Duration) -> Result<usize> {
        self.store.cleanup_older_than(age)
    }

    /// Start sending a stored upload to a peer.
    ///
    /// Registers the session (at most one live session per upload and peer)
    /// and spawns its drive task. Returns immediately with the session ID;
    /// use [`Coordinator::transfer_status`] or [`Coordinator::wait_for`] to
    /// observe the outcome.
    pub fn send_file(&self, upload_id: &UploadId, peer: &PeerId) -> Result<SessionId> {
        let record = self.store.metadata(upload_id)?;
        let session = TransferSession::new(
            upload_id.clone(),
            peer.clone(),
            Direction::Outbound,
            record.size,
        );
        let handle = self.registry.register(session)?;
        let id = handle.id();

        info!(session_id = %id, upload_id = %upload_id, peer_id = %peer, "outbound transfer started");
        tokio::spawn(run_sender(
            handle,
            Arc::clone(&self.store),
            Arc::clone(&self.connector),
            self.local_peer.clone(),
            self.transfer_cfg.clone(),
        ));
        Ok(id)
    }

    /// Admit one inbound connection: read and vet the offer, register the
    /// session, and spawn its drive task.
    pub async fn handle_incoming<S, R>(&self, mut send: S, mut recv: R) -> Result<Arc<SessionHandle>>
    where
        S: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let offer: TransferOffer =
            match tokio::time::timeout(self.transfer_cfg.io_timeout, read_frame(&mut recv)).await {
                Ok(res) => res?,
                Err(_) => {
                    return Err(FerryError::Connection(
                        "timed out waiting for transfer offer".into(),
                    ))
                }
            };

        if offer.version != PROTOCOL_VERSION {
            let reason = format!("unsupported protocol version {}", offer.version);
            let _ = write_frame(&mut send, &OfferReply::Reject { reason: reason.clone() }).await;
            return Err(FerryError::Protocol(reason));
        }

        let verdict = self
            .settings
            .lock()
            .unwrap()
            .check_upload(&offer.file_name, offer.file_size);
        if let Err(reason) = verdict {
            warn!(
                upload_id = %offer.upload_id,
                sender = %offer.sender,
                reason,
                "inbound offer refused by policy"
            );
            let _ = write_frame(&mut send, &OfferReply::Reject { reason: reason.clone() }).await;
            return Err(FerryError::Storage(format!(
                "inbound upload {:?} refused: {reason}",
                offer.file_name
            )));
        }

        let session = TransferSession::new(
            offer.upload_id.clone(),
            offer.sender.clone(),
            Direction::Inbound,
            offer.file_size,
        );
        let handle = match self.registry.register(session) {
            Ok(handle) => handle,
            Err(e) => {
                // A stale session for this upload clears shortly after a
                // connection drop; the sender should redial, not fail.
                let reply = match &e {
                    FerryError::DuplicateSession { .. } => OfferReply::Busy {
                        reason: e.to_string(),
                    },
                    _ => OfferReply::Reject {
                        reason: e.to_string(),
                    },
                };
                let _ = write_frame(&mut send, &reply).await;
                return Err(e);
            }
        };

        info!(
            session_id = %handle.id(),
            upload_id = %offer.upload_id,
            sender = %offer.sender,
            file_size = offer.file_size,
            "inbound transfer admitted"
        );
        tokio::spawn(run_receiver(
            Arc::clone(&handle),
            Arc::clone(&self.store),
            offer,
            send,
            recv,
            self.user_id(),
            self.transfer_cfg.clone(),
        ));
        let _ = self.inbound_tx.send(Arc::clone(&handle));
        Ok(handle)
    }

    /// Block until the next inbound transfer is admitted and return its
    /// handle.
    ///
    /// Handles queue up, so a transfer admitted before anyone was waiting
    /// is still delivered. Pair with [`SessionHandle::wait_terminal`] to
    /// wait for the received file itself.
    pub async fn receive_file(&self) -> Result<Arc<SessionHandle>> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| FerryError::Connection("coordinator shut down".into()))
    }

    /// Snapshot of one session, live or recently finished.
    pub fn transfer_status(&self, id: &SessionId) -> Result<TransferSession> {
        self.registry
            .lookup(id)
            .map(|h| h.snapshot())
            .ok_or_else(|| FerryError::NotFound(format!("session {id}")))
    }

    pub fn list_transfers(&self) -> Vec<TransferSession> {
        self.registry.list(|_| true)
    }

    /// Request cancellation of a session. Idempotent; a no-op when the
    /// session already finished.
    pub fn cancel_transfer(&self, id: &SessionId) -> Result<()> {
        let handle = self
            .registry
            .lookup(id)
            .ok_or_else(|| FerryError::NotFound(format!("session {id}")))?;
        handle.cancel()
    }

    /// Ask an inbound session to stop acknowledging chunks until resumed.
    pub fn pause_transfer(&self, id: &SessionId) -> Result<()> {
        let handle = self
            .registry
            .lookup(id)
            .ok_or_else(|| FerryError::NotFound(format!("session {id}")))?;
        handle.request_pause();
        Ok(())
    }

    /// Lift a pause requested earlier.
    pub fn resume_transfer(&self, id: &SessionId) -> Result<()> {
        let handle = self
            .registry
            .lookup(id)
            .ok_or_else(|| FerryError::NotFound(format!("session {id}")))?;
        handle.request_resume();
        Ok(())
    }

    /// Block until the session reaches a terminal state and return it.
    pub async fn wait_for(&self, id: &SessionId) -> Result<SessionState> {
        let handle = self
            .registry
            .lookup(id)
            .ok_or_else(|| FerryError::NotFound(format!("session {id}")))?;
        Ok(handle.wait_terminal().await)
    }

    /// Drop finished sessions past the configured retention window.
    pub fn reap_finished(&self) -> usize {
        self.registry.reap(self.transfer_cfg.retention)
    }

    /// Periodically reap finished sessions in the background.
    pub fn spawn_reaper(coordinator: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                coordinator.reap_finished();
            }
        })
    }

    /// Accept inbound connections from a TCP listener until it closes.
    pub fn spawn_acceptor(
        coordinator: Arc<Self>,
        mut listener: TransferListener,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(stream) = listener.accept().await {
                let remote_addr = stream.remote_addr;
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move {
                    if let Err(e) = coordinator.handle_incoming(stream.send, stream.recv).await {
                        warn!(remote = %remote_addr, error = %e, "inbound connection dropped");
                    }
                });
            }
        })
    }
}
