//! Shared server state reachable from the accept loop and every session.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;

use crate::config::ReplConfig;
use crate::engine::EngineHandle;
use crate::session::{Session, SessionHandle, SessionId, SessionInfo, SessionRegistry};

/// State shared by the controller, its accept loop and (weakly) sessions.
///
/// The controller and the accept loop hold strong references. Sessions
/// only hold a `Weak` so a connected client never keeps the server alive.
#[derive(Debug)]
pub struct ServerState {
    /// Server configuration.
    pub config: ReplConfig,
    /// Live sessions.
    pub registry: SessionRegistry,
    /// Queue in front of the shared engine.
    pub engine: EngineHandle,
}

impl ServerState {
    /// Creates the shared state.
    #[must_use]
    pub fn new(config: ReplConfig, engine: EngineHandle) -> Self {
        Self {
            config,
            registry: SessionRegistry::new(),
            engine,
        }
    }

    /// Registers an accepted connection and spawns its session task.
    pub async fn open_session(self: &Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        let info = SessionInfo::new(peer_addr);
        let (handle, closed) = SessionHandle::new(info.clone());
        if let Err(err) = self.registry.insert(handle).await {
            tracing::error!(error = %err, peer = %peer_addr, "cannot register session");
            return;
        }

        let session = Session::new(
            info,
            stream,
            self.engine.clone(),
            Arc::downgrade(self),
            self.config.banner.clone(),
            self.config.max_line_bytes,
        );
        tokio::spawn(session.run(closed));
    }

    /// Removes a session from the registry, closing it if still open.
    /// Returns `false` if it was already gone.
    pub async fn remove_session(&self, id: SessionId) -> bool {
        match self.registry.remove(id).await {
            Some(handle) => {
                tracing::debug!(session_id = %id, "session removed");
                handle.close();
                true
            }
            None => false,
        }
    }
}
