//! Server-wide registry of live sessions.
//!
//! [`SessionRegistry`] maps each [`SessionId`] to the [`SessionHandle`] that
//! keeps the session open. The registry holds the only owning handle:
//! removing an entry drops its close signal and ends the session task.

use std::collections::HashMap;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{RwLock, oneshot};

use super::SessionId;
use crate::error::ReplError;

/// Read-only description of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Session identifier (immutable after creation).
    pub id: SessionId,
    /// Remote address of the connection.
    pub peer_addr: SocketAddr,
    /// When the connection was accepted.
    pub connected_at: DateTime<Utc>,
}

impl SessionInfo {
    /// Describes a connection accepted now.
    #[must_use]
    pub fn new(peer_addr: SocketAddr) -> Self {
        Self {
            id: SessionId::new(),
            peer_addr,
            connected_at: Utc::now(),
        }
    }
}

/// Registry entry owning a session's close signal.
#[derive(Debug)]
pub struct SessionHandle {
    info: SessionInfo,
    close: oneshot::Sender<()>,
}

impl SessionHandle {
    /// Creates a handle plus the receiver the session task watches.
    #[must_use]
    pub fn new(info: SessionInfo) -> (Self, oneshot::Receiver<()>) {
        let (close, closed) = oneshot::channel();
        (Self { info, close }, closed)
    }

    /// Session description.
    #[must_use]
    pub const fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Asks the session task to stop. Dropping the handle has the same
    /// effect.
    pub fn close(self) {
        let _ = self.close.send(());
    }
}

/// Concurrent map of live sessions.
///
/// All mutations take the write lock, so accept-time inserts and
/// disconnect-time removals are serialized and never lost.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new session.
    ///
    /// # Errors
    ///
    /// Returns [`ReplError::Connection`] if a session with the same id is
    /// already registered (should never happen with UUID v4).
    pub async fn insert(&self, handle: SessionHandle) -> Result<SessionId, ReplError> {
        let id = handle.info.id;
        let mut map = self.sessions.write().await;
        if map.contains_key(&id) {
            return Err(ReplError::Connection(format!(
                "session {id} already registered"
            )));
        }
        map.insert(id, handle);
        Ok(id)
    }

    /// Looks a session up by id.
    pub async fn get(&self, id: SessionId) -> Option<SessionInfo> {
        self.sessions
            .read()
            .await
            .get(&id)
            .map(|handle| handle.info.clone())
    }

    /// Looks a session up by the remote address of its connection.
    pub async fn find_by_peer(&self, peer_addr: SocketAddr) -> Option<SessionInfo> {
        self.sessions
            .read()
            .await
            .values()
            .find(|handle| handle.info.peer_addr == peer_addr)
            .map(|handle| handle.info.clone())
    }

    /// Removes a session, returning its handle. Idempotent: removing an
    /// unknown id returns `None`.
    pub async fn remove(&self, id: SessionId) -> Option<SessionHandle> {
        self.sessions.write().await.remove(&id)
    }

    /// Removes every session, returning their handles.
    pub async fn drain(&self) -> Vec<SessionHandle> {
        self.sessions
            .write()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect()
    }

    /// Snapshot of all live sessions, oldest first.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let map = self.sessions.read().await;
        let mut sessions: Vec<SessionInfo> =
            map.values().map(|handle| handle.info.clone()).collect();
        sessions.sort_by_key(|info| info.connected_at);
        sessions
    }

    /// Returns the number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Returns `true` if no session is registered.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
