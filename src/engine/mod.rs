//! Script engine boundary.
//!
//! The engine is a black box that runs source text or a call into its global
//! scope and yields a value or a thrown error. [`ScriptEngine`] is that seam;
//! [`BoaEngine`] is the JavaScript implementation shipped with the server and
//! [`EngineHandle`] is the single-consumer queue in front of it.

pub mod boa;
pub mod worker;

use std::fmt;

use serde::Serialize;

pub use boa::BoaEngine;
pub use worker::EngineHandle;

/// Result of one engine entry.
pub type EvalOutcome = Result<EvalValue, EvalFailure>;

/// Executes code inside one shared, non-reentrant context.
///
/// Implementations are driven from exactly one thread and never re-entered
/// while a previous call is still running, so they need not be `Send`.
pub trait ScriptEngine {
    /// Evaluates `source` in the shared context.
    fn eval(&mut self, source: &str) -> EvalOutcome;

    /// Calls the callable found at the dotted `target` path in the global
    /// scope with the given JSON arguments.
    fn call(&mut self, target: &str, args: &[serde_json::Value]) -> EvalOutcome;
}

/// Serializable representation of a successful evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalValue {
    /// JSON rendering. `undefined` becomes `null`.
    pub json: serde_json::Value,
    /// REPL rendering, e.g. `2`, `"abc"` or `undefined`.
    pub display: String,
}

impl EvalValue {
    /// Creates a value from its JSON and display renderings.
    #[must_use]
    pub fn new(json: serde_json::Value, display: impl Into<String>) -> Self {
        Self {
            json,
            display: display.into(),
        }
    }

    /// The value of an evaluation that produced nothing.
    #[must_use]
    pub fn undefined() -> Self {
        Self::new(serde_json::Value::Null, "undefined")
    }
}

/// Description of a failed evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvalFailure {
    /// Error class, e.g. `ReferenceError` or `SyntaxError`.
    pub kind: String,
    /// Human-readable message without the kind prefix.
    pub message: String,
    /// 1-based source line, when the engine reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// 1-based source column, when the engine reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

impl EvalFailure {
    /// Creates a failure without position information.
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            line: None,
            column: None,
        }
    }

    /// Attaches a source position.
    #[must_use]
    pub const fn at(mut self, line: u32, column: u32) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }

    /// Failure for a unit that waited in the queue past its deadline.
    #[must_use]
    pub fn timeout(waited: std::time::Duration) -> Self {
        Self::new(
            "TimeoutError",
            format!("evaluation not started after {} ms", waited.as_millis()),
        )
    }

    /// Failure for a unit that could not reach the engine.
    #[must_use]
    pub fn engine_unavailable() -> Self {
        Self::new("EngineUnavailable", "engine worker has shut down")
    }

    /// Splits an engine error rendering such as
    /// `SyntaxError: unexpected token at line 1, col 4` into kind, message
    /// and position.
    #[must_use]
    pub fn from_rendered(rendered: &str) -> Self {
        let (kind, message) = match rendered.split_once(": ") {
            Some((head, rest)) if is_error_class(head) => (head.trim(), rest.trim()),
            _ => ("Error", rendered.trim()),
        };
        if let Some((message, line, column)) = split_trailing_location(message) {
            return Self::new(kind, message.trim_end()).at(line, column);
        }
        let mut failure = Self::new(kind, message);
        if let Some((line, column)) = find_position(message) {
            failure = failure.at(line, column);
        }
        failure
    }
}

impl fmt::Display for EvalFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        match (self.line, self.column) {
            (Some(line), Some(column)) if !self.message.contains("line") => {
                write!(f, " (line {line}, column {column})")
            }
            _ => Ok(()),
        }
    }
}

impl std::error::Error for EvalFailure {}

fn is_error_class(head: &str) -> bool {
    let head = head.trim();
    !head.is_empty()
        && head.ends_with("Error")
        && head.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Splits a trailing `(<file> at :<line>:<column>)` location, as Boa
/// appends to thrown errors, off a message.
fn split_trailing_location(message: &str) -> Option<(&str, u32, u32)> {
    let body = message.strip_suffix(')')?;
    let open = body.rfind(" (")?;
    let (_, position) = body.get(open + 2..)?.rsplit_once(" at ")?;
    let mut parts = position.rsplit(':');
    let column = parts.next()?.parse().ok()?;
    let line = parts.next()?.parse().ok()?;
    Some((body.get(..open)?, line, column))
}

/// Finds `line <n>` followed by `col <m>` or `column <m>` in a message.
fn find_position(message: &str) -> Option<(u32, u32)> {
    let after_line = message.get(message.rfind("line ")? + 5..)?;
    let line = leading_number(after_line)?;
    let after_col = after_line.get(after_line.find("col")?..)?;
    let digits_start = after_col.find(|c: char| c.is_ascii_digit())?;
    let column = leading_number(after_col.get(digits_start..)?)?;
    Some((line, column))
}

fn leading_number(text: &str) -> Option<u32> {
    let end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    text.get(..end)?.parse().ok()
}
