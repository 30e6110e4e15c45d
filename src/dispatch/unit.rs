//! The eval dispatch unit.
//!
//! An [`EvalUnit`] carries one request and its completion from a session
//! to the engine worker. Whatever happens to the unit (invoked, failed
//! before running, dropped unrun, engine panic) exactly one of its two
//! continuations fires, exactly once.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Instant;

use tokio::sync::oneshot;

use super::EvalRequest;
use crate::engine::{EvalFailure, EvalOutcome, EvalValue, ScriptEngine};
use crate::error::ReplError;

/// Continuation fired with the value of a successful evaluation.
pub type OnSuccess = Box<dyn FnOnce(EvalValue) + Send + 'static>;

/// Continuation fired with the description of a failed evaluation.
pub type OnError = Box<dyn FnOnce(EvalFailure) + Send + 'static>;

enum Completion {
    Callbacks {
        on_success: OnSuccess,
        on_error: OnError,
    },
    Reply(oneshot::Sender<EvalOutcome>),
}

impl Completion {
    fn fire(self, outcome: EvalOutcome) {
        match (self, outcome) {
            (Self::Callbacks { on_success, .. }, Ok(value)) => on_success(value),
            (Self::Callbacks { on_error, .. }, Err(failure)) => on_error(failure),
            (Self::Reply(tx), outcome) => {
                // Receiver gone means nobody is waiting any more.
                let _ = tx.send(outcome);
            }
        }
    }
}

/// One pending code-execution request with its continuations.
///
/// Construction executes nothing. [`EvalUnit::invoke`] runs the request on
/// the engine and fires one continuation; a second call returns
/// [`ReplError::AlreadyInvoked`] and fires nothing.
pub struct EvalUnit {
    request: EvalRequest,
    completion: Option<Completion>,
    submitted_at: Instant,
}

impl fmt::Debug for EvalUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvalUnit")
            .field("request", &self.request)
            .field("completed", &self.completion.is_none())
            .field("submitted_at", &self.submitted_at)
            .finish()
    }
}

impl EvalUnit {
    /// Creates a unit that reports through a success/error continuation pair.
    pub fn new<S, E>(request: EvalRequest, on_success: S, on_error: E) -> Self
    where
        S: FnOnce(EvalValue) + Send + 'static,
        E: FnOnce(EvalFailure) + Send + 'static,
    {
        Self {
            request,
            completion: Some(Completion::Callbacks {
                on_success: Box::new(on_success),
                on_error: Box::new(on_error),
            }),
            submitted_at: Instant::now(),
        }
    }

    /// Creates a unit whose outcome is delivered on a oneshot channel.
    #[must_use]
    pub fn with_reply(request: EvalRequest) -> (Self, oneshot::Receiver<EvalOutcome>) {
        let (tx, rx) = oneshot::channel();
        let unit = Self {
            request,
            completion: Some(Completion::Reply(tx)),
            submitted_at: Instant::now(),
        };
        (unit, rx)
    }

    /// The request carried by this unit.
    #[must_use]
    pub const fn request(&self) -> &EvalRequest {
        &self.request
    }

    /// When the unit was handed to the engine queue.
    #[must_use]
    pub const fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    /// Returns `true` once a continuation has fired.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        self.completion.is_none()
    }

    pub(crate) fn mark_submitted(&mut self) {
        self.submitted_at = Instant::now();
    }

    /// Runs the request on `engine` and fires exactly one continuation.
    ///
    /// Must only be called from the engine's execution thread. A panic
    /// inside the engine is reported through the error continuation.
    ///
    /// # Errors
    ///
    /// Returns [`ReplError::AlreadyInvoked`] if the unit has already
    /// completed; no continuation fires in that case.
    pub fn invoke(&mut self, engine: &mut dyn ScriptEngine) -> Result<(), ReplError> {
        self.invoke_then(engine, || {})
    }

    /// Like [`EvalUnit::invoke`], running `before_fire` once the outcome is
    /// known and before the continuation fires.
    pub(crate) fn invoke_then<F>(
        &mut self,
        engine: &mut dyn ScriptEngine,
        before_fire: F,
    ) -> Result<(), ReplError>
    where
        F: FnOnce(),
    {
        let completion = self.completion.take().ok_or(ReplError::AlreadyInvoked)?;
        let outcome = execute_guarded(&self.request, engine);
        before_fire();
        completion.fire(outcome);
        Ok(())
    }

    /// Completes the unit with `failure` without running it.
    ///
    /// # Errors
    ///
    /// Returns [`ReplError::AlreadyInvoked`] if the unit has already
    /// completed.
    pub fn fail(&mut self, failure: EvalFailure) -> Result<(), ReplError> {
        self.fail_then(failure, || {})
    }

    /// Like [`EvalUnit::fail`], running `before_fire` before the
    /// continuation fires.
    pub(crate) fn fail_then<F>(
        &mut self,
        failure: EvalFailure,
        before_fire: F,
    ) -> Result<(), ReplError>
    where
        F: FnOnce(),
    {
        let completion = self.completion.take().ok_or(ReplError::AlreadyInvoked)?;
        before_fire();
        completion.fire(Err(failure));
        Ok(())
    }
}

impl Drop for EvalUnit {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            tracing::debug!(request = self.request.label(), "unit dropped before running");
            completion.fire(Err(EvalFailure::engine_unavailable()));
        }
    }
}

/// Runs `request`, turning an engine panic into an `InternalError`.
fn execute_guarded(request: &EvalRequest, engine: &mut dyn ScriptEngine) -> EvalOutcome {
    let run = AssertUnwindSafe(|| execute(request, engine));
    catch_unwind(run).unwrap_or_else(|_| {
        tracing::error!(request = request.label(), "engine panicked during evaluation");
        Err(EvalFailure::new("InternalError", "engine panicked"))
    })
}

fn execute(request: &EvalRequest, engine: &mut dyn ScriptEngine) -> EvalOutcome {
    match request {
        EvalRequest::RawCode(source) => engine.eval(source),
        EvalRequest::Message(message) => {
            let mut value = EvalValue::undefined();
            if let Some(src) = message.src.as_deref().filter(|s| !s.trim().is_empty()) {
                value = engine.eval(src)?;
            }
            match message.target.as_deref().filter(|t| !t.trim().is_empty()) {
                Some(target) => engine.call(target.trim(), &message.args),
                None if message.src.is_some() => Ok(value),
                None => Err(EvalFailure::new(
                    "TypeError",
                    "message carries neither src nor target",
                )),
            }
        }
    }
}
