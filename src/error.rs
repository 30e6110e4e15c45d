//! Server error types.
//!
//! [`ReplError`] is the central error type for the crate. Structural
//! failures (bind, double start, bad configuration) surface to the caller of
//! the controller; per-request failures stay inside the session that caused
//! them and are rendered back to that client only.

use crate::engine::EvalFailure;

/// Server-side error enum.
///
/// # Error Kinds
///
/// | Kind                  | Raised by          | Reaches the controller's caller |
/// |-----------------------|--------------------|---------------------------------|
/// | `BindError`           | `start`            | yes                             |
/// | `AlreadyRunningError` | `start`            | yes                             |
/// | `ConfigError`         | config loading     | yes                             |
/// | `EngineUnavailable`   | engine worker      | yes                             |
/// | `ParseError`          | session            | no, sent to the client          |
/// | `EvalError`           | dispatch unit      | no, sent to the client          |
/// | `ConnectionError`     | session writer     | no, logged and dropped          |
/// | `AlreadyInvoked`      | dispatch unit      | no, programming error           |
#[derive(Debug, thiserror::Error)]
pub enum ReplError {
    /// The listening socket could not be opened.
    #[error("cannot bind port {port}: {source}")]
    Bind {
        /// Port that was requested.
        port: u16,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// `start` was called while the server was already listening.
    #[error("server already running on port {port}")]
    AlreadyRunning {
        /// Port the running listener is bound to.
        port: u16,
    },

    /// Inbound payload is neither raw code nor a valid structured message.
    #[error("parse error: {0}")]
    Parse(String),

    /// The engine rejected or failed to run the submitted code.
    #[error("{0}")]
    Eval(EvalFailure),

    /// Write to a closed or broken connection.
    #[error("connection error: {0}")]
    Connection(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The engine worker could not be started or has shut down.
    #[error("engine unavailable: {0}")]
    EngineUnavailable(String),

    /// A dispatch unit was invoked a second time.
    #[error("evaluation unit already invoked")]
    AlreadyInvoked,
}

impl ReplError {
    /// Returns the stable kind string for this variant.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Bind { .. } => "BindError",
            Self::AlreadyRunning { .. } => "AlreadyRunningError",
            Self::Parse(_) => "ParseError",
            Self::Eval(_) => "EvalError",
            Self::Connection(_) => "ConnectionError",
            Self::InvalidConfig(_) => "ConfigError",
            Self::EngineUnavailable(_) => "EngineUnavailable",
            Self::AlreadyInvoked => "AlreadyInvoked",
        }
    }

    /// Returns `true` for errors that are contained to a single session.
    #[must_use]
    pub const fn is_session_local(&self) -> bool {
        matches!(
            self,
            Self::Parse(_) | Self::Eval(_) | Self::Connection(_) | Self::AlreadyInvoked
        )
    }
}

impl From<EvalFailure> for ReplError {
    fn from(failure: EvalFailure) -> Self {
        Self::Eval(failure)
    }
}
