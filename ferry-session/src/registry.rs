//! Shared session handles and the process-wide registry.
//!
//! A [`SessionHandle`] owns the mutable [`TransferSession`] behind a mutex
//! that is only ever held for field updates, never across I/O. Watch
//! channels fan state changes and control signals out to the drive loops
//! and to anyone awaiting a terminal state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ferry_protocol::{FerryError, PeerId, Result, SessionId, UploadId};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::state::{SessionState, TransferSession};

pub struct SessionHandle {
    session: Mutex<TransferSession>,
    state_tx: watch::Sender<SessionState>,
    cancel_tx: watch::Sender<bool>,
    pause_tx: watch::Sender<bool>,
}

impl SessionHandle {
    pub fn new(session: TransferSession) -> Arc<Self> {
        let (state_tx, _) = watch::channel(session.state);
        let (cancel_tx, _) = watch::channel(false);
        let (pause_tx, _) = watch::channel(false);
        Arc::new(Self {
            session: Mutex::new(session),
            state_tx,
            cancel_tx,
            pause_tx,
        })
    }

    pub fn id(&self) -> SessionId {
        self.session.lock().unwrap().session_id.clone()
    }

    pub fn snapshot(&self) -> TransferSession {
        self.session.lock().unwrap().clone()
    }

    /// Applies a state transition and broadcasts the new state.
    pub fn transition(&self, next: SessionState) -> Result<()> {
        let mut session = self.session.lock().unwrap();
        let from = session.state;
        session.transition(next)?;
        debug!(
            session_id = %session.session_id,
            from = from.name(),
            to = next.name(),
            "session transition"
        );
        self.state_tx.send_replace(next);
        Ok(())
    }

    pub fn record_progress(&self, delta: u64) -> Result<()> {
        self.session.lock().unwrap().record_progress(delta)
    }

    /// Raises progress to an absolute byte position without ever moving it
    /// backwards.
    pub fn advance_to(&self, position: u64) -> Result<()> {
        self.session.lock().unwrap().advance_to(position)
    }

    /// Bumps the retry counter, returning the new count.
    pub fn add_retry(&self) -> u32 {
        let mut session = self.session.lock().unwrap();
        session.retry_count += 1;
        session.retry_count
    }

    /// Marks the session failed with the error message, unless it already
    /// reached a terminal state.
    pub fn fail(&self, err: &FerryError) {
        let mut session = self.session.lock().unwrap();
        if session.state.is_terminal() {
            return;
        }
        if session.transition(SessionState::Failed).is_ok() {
            session.error = Some(err.to_string());
            warn!(
                session_id = %session.session_id,
                error = %err,
                "session failed"
            );
            self.state_tx.send_replace(SessionState::Failed);
        }
    }

    /// Requests cancellation. Idempotent; a no-op once terminal.
    pub fn cancel(&self) -> Result<()> {
        {
            let mut session = self.session.lock().unwrap();
            if session.state.is_terminal() {
                return Ok(());
            }
            session.transition(SessionState::Cancelled)?;
            info!(session_id = %session.session_id, "session cancelled");
            self.state_tx.send_replace(SessionState::Cancelled);
        }
        self.cancel_tx.send_replace(true);
        Ok(())
    }

    /// Resolves once cancellation has been requested, including when it was
    /// requested before this call.
    pub async fn wait_cancelled(&self) {
        let mut rx = self.cancel_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn paused(&self) -> watch::Receiver<bool> {
        self.pause_tx.subscribe()
    }

    pub fn request_pause(&self) {
        self.pause_tx.send_replace(true);
    }

    pub fn request_resume(&self) {
        self.pause_tx.send_replace(false);
    }

    /// Waits until the session reaches a terminal state and returns it.
    pub async fn wait_terminal(&self) -> SessionState {
        let mut rx = self.state_tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state.is_terminal() {
                return state;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }
}

/// All live and recently finished sessions, keyed by session id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a new session, enforcing at most one live session per
    /// (upload, peer) pair. The check and the insert happen under one lock
    /// so two racing callers cannot both get in.
    pub fn register(&self, session: TransferSession) -> Result<Arc<SessionHandle>> {
        let mut sessions = self.sessions.lock().unwrap();
        for existing in sessions.values() {
            let snap = existing.snapshot();
            if snap.upload_id == session.upload_id
                && snap.peer_id == session.peer_id
                && !snap.state.is_terminal()
            {
                return Err(FerryError::DuplicateSession {
                    upload_id: session.upload_id,
                    peer_id: session.peer_id,
                });
            }
        }
        let handle = SessionHandle::new(session);
        let id = handle.id();
        debug!(session_id = %id, "session registered");
        sessions.insert(id, Arc::clone(&handle));
        Ok(handle)
    }

    pub fn lookup(&self, id: &SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.lock().unwrap().get(id).cloned()
    }

    /// Snapshots of all sessions matching `filter`.
    pub fn list(&self, filter: impl Fn(&TransferSession) -> bool) -> Vec<TransferSession> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .map(|h| h.snapshot())
            .filter(|s| filter(s))
            .collect()
    }

    /// Sessions addressed to `upload` from `peer`, live or finished.
    pub fn for_upload(&self, upload: &UploadId, peer: &PeerId) -> Vec<TransferSession> {
        self.list(|s| &s.upload_id == upload && &s.peer_id == peer)
    }

    /// Drops terminal sessions older than `retention`. Returns how many
    /// were removed.
    pub fn reap(&self, retention: Duration) -> usize {
        let mut sessions = self.sessions.lock().unwrap();
        let before = sessions.len();
        sessions.retain(|_, handle| {
            let snap = handle.snapshot();
            match snap.finished_at {
                Some(at) if snap.state.is_terminal() => at.elapsed() < retention,
                _ => true,
            }
        });
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(removed, "reaped finished sessions");
        }
        removed
    }
}
