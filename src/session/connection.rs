//! Per-connection session loop.
//!
//! A [`Session`] owns one accepted connection. Its read loop turns lines
//! into [`EvalUnit`]s and submits them without waiting; a separate writer
//! task drains an outbound queue so responses from the engine thread never
//! block on the socket.
//!
//! Every reply is tagged with the position of the request it answers. The
//! writer parks early replies until all earlier ones are out, so a client
//! always reads replies in the order it sent requests.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Weak;

use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use super::protocol::{self, Inbound, MessageResponse};
use super::{SessionId, SessionInfo};
use crate::app_state::ServerState;
use crate::dispatch::{EvalRequest, EvalUnit};
use crate::engine::{EngineHandle, EvalFailure};
use crate::error::ReplError;

enum Outbound {
    Line(String),
    Close,
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Line(line) => f.debug_tuple("Line").field(line).finish(),
            Self::Close => f.write_str("Close"),
        }
    }
}

/// Cloneable write side of a session, handed to continuations.
#[derive(Debug, Clone)]
pub struct SessionSink {
    id: SessionId,
    tx: mpsc::UnboundedSender<(u64, Outbound)>,
}

impl SessionSink {
    /// Queues the reply at position `seq` of the session's request order.
    ///
    /// # Errors
    ///
    /// Returns [`ReplError::Connection`] once the session's writer is gone.
    pub fn send_line(&self, seq: u64, line: impl Into<String>) -> Result<(), ReplError> {
        self.tx
            .send((seq, Outbound::Line(line.into())))
            .map_err(|_| ReplError::Connection(format!("session {} is closed", self.id)))
    }

    /// Queues a reply, dropping it if the session is already gone.
    fn deliver(&self, seq: u64, line: String) {
        if let Err(err) = self.send_line(seq, line) {
            tracing::debug!(session_id = %self.id, error = %err, "dropping response");
        }
    }

    fn close(&self, seq: u64) {
        let _ = self.tx.send((seq, Outbound::Close));
    }
}

/// Hands out reply positions in request order.
#[derive(Debug, Default)]
struct ReplyOrder {
    next: u64,
}

impl ReplyOrder {
    fn claim(&mut self) -> u64 {
        let seq = self.next;
        self.next += 1;
        seq
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client sent `/quit`.
    Quit,
    /// Client closed the connection.
    Eof,
    /// Read failed.
    ReadError,
    /// Writing a reply failed.
    WriteError,
    /// Server asked the session to close.
    Shutdown,
}

enum LineRead {
    Eof,
    Line(Vec<u8>),
    TooLong,
}

/// One client connection bound to a unique session id.
#[derive(Debug)]
pub struct Session<S = TcpStream> {
    info: SessionInfo,
    stream: S,
    engine: EngineHandle,
    server: Weak<ServerState>,
    banner: String,
    max_line_bytes: usize,
}

impl<S> Session<S> {
    /// Wraps an accepted connection. `server` is a lookup-only reference
    /// used to deregister on close.
    #[must_use]
    pub fn new(
        info: SessionInfo,
        stream: S,
        engine: EngineHandle,
        server: Weak<ServerState>,
        banner: String,
        max_line_bytes: usize,
    ) -> Self {
        Self {
            info,
            stream,
            engine,
            server,
            banner,
            max_line_bytes,
        }
    }

    /// Session identifier.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.info.id
    }

    /// Remote address of the connection.
    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.info.peer_addr
    }
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Runs the session until the client quits or disconnects, a write
    /// fails, or `closed` fires. Deregisters from the server afterwards.
    pub async fn run(self, mut closed: oneshot::Receiver<()>) -> CloseReason {
        let Self {
            info,
            stream,
            engine,
            server,
            banner,
            max_line_bytes,
        } = self;
        let id = info.id;
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = SessionSink { id, tx };
        let mut order = ReplyOrder::default();
        let mut writer = tokio::spawn(write_loop(write_half, rx));

        tracing::info!(session_id = %id, peer = %info.peer_addr, "session opened");
        if !banner.is_empty() {
            sink.deliver(order.claim(), banner);
        }

        let mut reader = BufReader::new(read_half);
        let reason = loop {
            let read = tokio::select! {
                _ = &mut closed => break CloseReason::Shutdown,
                written = &mut writer => {
                    log_writer_end(id, written);
                    break CloseReason::WriteError;
                }
                read = read_line_bounded(&mut reader, max_line_bytes) => read,
            };
            match read {
                Ok(LineRead::Eof) => break CloseReason::Eof,
                Ok(LineRead::TooLong) => {
                    tracing::warn!(session_id = %id, max_line_bytes, "inbound line too long");
                    let failure = EvalFailure::new(
                        "ParseError",
                        format!("line exceeds {max_line_bytes} bytes"),
                    );
                    sink.deliver(order.claim(), protocol::raw_error_line(&failure));
                }
                Ok(LineRead::Line(bytes)) => {
                    let Ok(line) = String::from_utf8(bytes) else {
                        let failure = EvalFailure::new("ParseError", "line is not valid UTF-8");
                        sink.deliver(order.claim(), protocol::raw_error_line(&failure));
                        continue;
                    };
                    if handle_line(&line, &mut order, &sink, &engine) {
                        break CloseReason::Quit;
                    }
                }
                Err(err) => {
                    tracing::debug!(session_id = %id, error = %err, "read failed");
                    break CloseReason::ReadError;
                }
            }
        };

        if reason == CloseReason::Quit {
            // The writer closes once every reply queued before the goodbye
            // is out, which may wait on units still in the engine queue.
            drop(sink);
            tokio::select! {
                _ = &mut closed => writer.abort(),
                written = &mut writer => log_writer_end(id, written),
            }
        } else {
            writer.abort();
        }

        if let Some(server) = server.upgrade() {
            server.remove_session(id).await;
        }
        tracing::info!(session_id = %id, ?reason, "session closed");
        reason
    }
}

fn log_writer_end(id: SessionId, written: Result<Result<(), ReplError>, tokio::task::JoinError>) {
    match written {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(session_id = %id, error = %err, "write failed"),
        Err(err) => tracing::error!(session_id = %id, error = %err, "writer task failed"),
    }
}

/// Handles one decoded line. Returns `true` when the session should close.
fn handle_line(
    line: &str,
    order: &mut ReplyOrder,
    sink: &SessionSink,
    engine: &EngineHandle,
) -> bool {
    match protocol::parse_line(line) {
        Ok(Inbound::Empty) => false,
        Ok(Inbound::Quit) => {
            sink.deliver(order.claim(), protocol::GOODBYE.to_string());
            sink.close(order.claim());
            true
        }
        Ok(Inbound::SessionId) => {
            sink.deliver(order.claim(), protocol::session_id_line(sink.id));
            false
        }
        Ok(Inbound::Eval(request)) => {
            tracing::debug!(session_id = %sink.id, request = request.label(), "submitting unit");
            engine.submit(build_unit(request, order.claim(), sink));
            false
        }
        Err(err) => {
            tracing::warn!(session_id = %sink.id, error = %err, "malformed message");
            let line = MessageResponse::parse_error(sink.id, &err).to_line();
            sink.deliver(order.claim(), line);
            false
        }
    }
}

/// Binds a request to continuations that render into this session only, at
/// reply position `seq`.
fn build_unit(request: EvalRequest, seq: u64, sink: &SessionSink) -> EvalUnit {
    let on_success = sink.clone();
    let on_error = sink.clone();
    match &request {
        EvalRequest::RawCode(_) => EvalUnit::new(
            request,
            move |value| on_success.deliver(seq, protocol::raw_success_line(&value)),
            move |failure| on_error.deliver(seq, protocol::raw_error_line(&failure)),
        ),
        EvalRequest::Message(message) => {
            let ok_id = message.id.clone();
            let err_id = message.id.clone();
            EvalUnit::new(
                request,
                move |value| {
                    let line = MessageResponse::ok(on_success.id, ok_id, &value).to_line();
                    on_success.deliver(seq, line);
                },
                move |failure| {
                    let line = MessageResponse::error(on_error.id, err_id, &failure).to_line();
                    on_error.deliver(seq, line);
                },
            )
        }
    }
}

/// Reads one `\n`-terminated line of at most `max` bytes. Longer lines are
/// consumed up to their terminator and reported as [`LineRead::TooLong`].
async fn read_line_bounded<R>(reader: &mut R, max: usize) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let limit = u64::try_from(max).unwrap_or(u64::MAX).saturating_add(1);
    let mut bytes = Vec::new();
    let n = (&mut *reader).take(limit).read_until(b'\n', &mut bytes).await?;
    if n == 0 {
        return Ok(LineRead::Eof);
    }
    if bytes.last() == Some(&b'\n') {
        bytes.pop();
        return Ok(LineRead::Line(bytes));
    }
    if bytes.len() <= max {
        // Final line without a terminator.
        return Ok(LineRead::Line(bytes));
    }

    let mut rest = Vec::new();
    loop {
        rest.clear();
        let n = (&mut *reader).take(limit).read_until(b'\n', &mut rest).await?;
        if n == 0 || rest.last() == Some(&b'\n') {
            return Ok(LineRead::TooLong);
        }
    }
}

/// Writes replies in sequence order, parking any that arrive early. Stops
/// at [`Outbound::Close`] or when every sink is gone.
async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<(u64, Outbound)>,
) -> Result<(), ReplError>
where
    W: AsyncWrite + Unpin,
{
    let mut next = 0u64;
    let mut parked = BTreeMap::new();
    while let Some((seq, outbound)) = rx.recv().await {
        parked.insert(seq, outbound);
        while let Some(outbound) = parked.remove(&next) {
            next += 1;
            match outbound {
                Outbound::Line(mut line) => {
                    line.push('\n');
                    writer
                        .write_all(line.as_bytes())
                        .await
                        .map_err(|e| ReplError::Connection(e.to_string()))?;
                }
                Outbound::Close => {
                    let _ = writer.shutdown().await;
                    return Ok(());
                }
            }
        }
    }
    let _ = writer.shutdown().await;
    Ok(())
}
