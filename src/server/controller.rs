//! Server controller: start/stop lifecycle around the listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

use super::ServerStatus;
use crate::app_state::ServerState;
use crate::config::ReplConfig;
use crate::dispatch::{EvalRequest, EvalUnit};
use crate::engine::boa::EngineLimits;
use crate::engine::{BoaEngine, EngineHandle, EvalFailure, EvalOutcome, ScriptEngine};
use crate::error::ReplError;
use crate::session::{SessionId, SessionInfo};

/// Delay before retrying after `accept` fails (e.g. out of descriptors).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct Listening {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    accept_task: JoinHandle<()>,
}

/// REPL server controller.
///
/// Owns the listener lifecycle and the session registry. The engine is
/// created once with the controller and survives any number of
/// start/stop cycles.
///
/// # Lifecycle
///
/// - [`start`](Self::start) binds the listener and spawns the accept loop.
/// - [`stop`](Self::stop) closes the listener, closes every session and
///   empties the registry. Calling it while stopped does nothing.
#[derive(Debug)]
pub struct ReplServer {
    state: Arc<ServerState>,
    running: AtomicBool,
    listening: Mutex<Option<Listening>>,
}

impl ReplServer {
    /// Creates a stopped server over a fresh Boa engine.
    ///
    /// # Errors
    ///
    /// Returns [`ReplError::InvalidConfig`] for an invalid configuration or
    /// [`ReplError::EngineUnavailable`] if the engine thread cannot start.
    pub fn new(config: ReplConfig) -> Result<Self, ReplError> {
        let limits = EngineLimits::from(&config);
        Self::with_engine(config, move || BoaEngine::new(limits))
    }

    /// Creates a stopped server over the engine built by `factory`, which
    /// runs on the engine thread.
    ///
    /// # Errors
    ///
    /// Same as [`ReplServer::new`].
    pub fn with_engine<E, F>(config: ReplConfig, factory: F) -> Result<Self, ReplError>
    where
        E: ScriptEngine + 'static,
        F: FnOnce() -> E + Send + 'static,
    {
        config.validate()?;
        let engine = EngineHandle::spawn(factory, config.eval_timeout)?;
        Ok(Self {
            state: Arc::new(ServerState::new(config, engine)),
            running: AtomicBool::new(false),
            listening: Mutex::new(None),
        })
    }

    /// Server configuration.
    #[must_use]
    pub fn config(&self) -> &ReplConfig {
        &self.state.config
    }

    /// Starts listening on the configured port.
    ///
    /// # Errors
    ///
    /// Same as [`ReplServer::start`].
    pub async fn start_default(&self) -> Result<SocketAddr, ReplError> {
        self.start(self.state.config.port).await
    }

    /// Binds `port` on the configured host and starts accepting
    /// connections. Port `0` picks an ephemeral port; the bound address is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns [`ReplError::AlreadyRunning`] if the server is listening
    /// (the existing listener is left untouched), or [`ReplError::Bind`] if
    /// the port cannot be bound.
    pub async fn start(&self, port: u16) -> Result<SocketAddr, ReplError> {
        let mut listening = self.listening.lock().await;
        if let Some(current) = listening.as_ref() {
            return Err(ReplError::AlreadyRunning {
                port: current.local_addr.port(),
            });
        }

        let addr = SocketAddr::new(self.state.config.host, port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ReplError::Bind { port, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ReplError::Bind { port, source })?;

        let (shutdown, shutdown_rx) = oneshot::channel();
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&self.state), shutdown_rx));
        *listening = Some(Listening {
            local_addr,
            shutdown,
            accept_task,
        });
        self.running.store(true, Ordering::SeqCst);

        tracing::info!(addr = %local_addr, "repl server listening");
        Ok(local_addr)
    }

    /// Stops accepting, closes the listener and every session. Idempotent.
    pub async fn stop(&self) {
        let mut listening = self.listening.lock().await;
        let Some(current) = listening.take() else {
            return;
        };

        let _ = current.shutdown.send(());
        if let Err(err) = current.accept_task.await {
            tracing::warn!(error = %err, "accept loop ended abnormally");
        }

        let sessions = self.state.registry.drain().await;
        let closed = sessions.len();
        for handle in sessions {
            handle.close();
        }
        self.running.store(false, Ordering::SeqCst);

        tracing::info!(addr = %current.local_addr, closed, "repl server stopped");
    }

    /// Returns `true` while the listener is open.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address the listener is bound to, if running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listening
            .lock()
            .await
            .as_ref()
            .map(|current| current.local_addr)
    }

    /// Snapshot of the server state.
    pub async fn status(&self) -> ServerStatus {
        let listen_port = self
            .local_addr()
            .await
            .map_or(self.state.config.port, |addr| addr.port());
        ServerStatus {
            running: self.is_running(),
            listen_port,
            session_count: self.state.registry.len().await,
            pending_units: self.state.engine.pending(),
            completed_units: self.state.engine.completed(),
        }
    }

    /// Finds the session owning the connection from `peer_addr`.
    pub async fn find_session_for_peer(&self, peer_addr: SocketAddr) -> Option<SessionInfo> {
        self.state.registry.find_by_peer(peer_addr).await
    }

    /// Finds a session by id.
    pub async fn find_session(&self, id: SessionId) -> Option<SessionInfo> {
        self.state.registry.get(id).await
    }

    /// Snapshot of all live sessions.
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.state.registry.list().await
    }

    /// Removes a session and closes its connection. Returns `false` if it
    /// was already gone.
    pub async fn remove_session(&self, id: SessionId) -> bool {
        self.state.remove_session(id).await
    }

    /// Evaluates code on the shared engine from the host side, queued
    /// behind any session requests.
    pub async fn eval(&self, request: EvalRequest) -> EvalOutcome {
        let (unit, reply) = EvalUnit::with_reply(request);
        self.state.engine.submit(unit);
        reply
            .await
            .unwrap_or_else(|_| Err(EvalFailure::engine_unavailable()))
    }
}

impl Drop for ReplServer {
    fn drop(&mut self) {
        if let Some(current) = self.listening.get_mut().take() {
            let _ = current.shutdown.send(());
            current.accept_task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    tracing::debug!(peer = %peer_addr, "connection accepted");
                    state.open_session(stream, peer_addr).await;
                }
                Err(err) => {
                    tracing::error!(error = %err, "accept failed");
                    if accept_backoff(&mut shutdown).await {
                        break;
                    }
                }
            },
        }
    }
    drop(listener);
}

/// Pause after a failed `accept`. Returns `true` if shutdown was requested
/// meanwhile.
async fn accept_backoff(shutdown: &mut oneshot::Receiver<()>) -> bool {
    tokio::select! {
        _ = shutdown => true,
        () = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => false,
    }
}
