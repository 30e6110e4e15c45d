//! Line protocol spoken on every connection.
//!
//! Each inbound line is one of:
//!
//! | Line                         | Meaning                                  |
//! |------------------------------|------------------------------------------|
//! | `/quit`, `/q`                | say `Bye!` and close                     |
//! | `/session_id`                | reply `/session_id <uuid>`               |
//! | `/message <base64 JSON>`     | structured message, see [`StructuredMessage`] |
//! | empty                        | ignored                                  |
//! | anything else                | raw code                                 |
//!
//! Raw code is answered with the value's REPL rendering or with
//! `Error: <kind>: <message>`. Structured messages are answered with
//! `/message_response <base64 JSON>` carrying a [`MessageResponse`].

use base64::prelude::{BASE64_STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SessionId;
use crate::dispatch::{EvalRequest, StructuredMessage};
use crate::engine::{EvalFailure, EvalValue};
use crate::error::ReplError;

/// Prefix of a structured request line.
pub const MESSAGE_PREFIX: &str = "/message ";
/// Prefix of a structured response line.
pub const MESSAGE_RESPONSE_PREFIX: &str = "/message_response ";
/// Command asking for the session id.
pub const SESSION_ID_COMMAND: &str = "/session_id";
/// Reply written before a session closes on `/quit`.
pub const GOODBYE: &str = "Bye!";

/// One parsed inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Blank line.
    Empty,
    /// Client asked to close the session.
    Quit,
    /// Client asked for its session id.
    SessionId,
    /// Code to run.
    Eval(EvalRequest),
}

/// Parses one inbound line (without its terminator).
///
/// # Errors
///
/// Returns [`ReplError::Parse`] when a `/message` line carries invalid
/// base64, invalid JSON or a message with nothing to do.
pub fn parse_line(line: &str) -> Result<Inbound, ReplError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let trimmed = line.trim();

    if trimmed.is_empty() {
        return Ok(Inbound::Empty);
    }
    if trimmed == "/q" || trimmed == "/quit" {
        return Ok(Inbound::Quit);
    }
    if trimmed.starts_with(SESSION_ID_COMMAND) {
        return Ok(Inbound::SessionId);
    }
    if trimmed == MESSAGE_PREFIX.trim_end() {
        return Err(ReplError::Parse("empty message".to_string()));
    }
    if let Some(encoded) = trimmed.strip_prefix(MESSAGE_PREFIX) {
        return decode_message(encoded).map(|msg| Inbound::Eval(EvalRequest::Message(msg)));
    }
    Ok(Inbound::Eval(EvalRequest::RawCode(line.to_string())))
}

fn decode_message(encoded: &str) -> Result<StructuredMessage, ReplError> {
    let bytes = BASE64_STANDARD
        .decode(encoded.trim())
        .map_err(|e| ReplError::Parse(format!("invalid base64: {e}")))?;
    let text = String::from_utf8(bytes)
        .map_err(|_| ReplError::Parse("message is not valid UTF-8".to_string()))?;
    StructuredMessage::from_json(&text)
}

/// Encodes a structured message as a request line.
///
/// # Errors
///
/// Returns [`ReplError::Parse`] if the message cannot be serialized.
pub fn encode_message(message: &StructuredMessage) -> Result<String, ReplError> {
    let json = serde_json::to_string(message)
        .map_err(|e| ReplError::Parse(format!("cannot encode message: {e}")))?;
    Ok(format!("{MESSAGE_PREFIX}{}", BASE64_STANDARD.encode(json)))
}

/// Outcome discriminator of a structured response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// The evaluation produced a value.
    Ok,
    /// Parsing or evaluation failed.
    Error,
}

/// Body of a `/message_response` line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageResponse {
    /// Session that produced the response.
    #[serde(rename = "session-id")]
    pub session_id: SessionId,
    /// Correlation id copied from the request (`null` if unknown).
    pub id: serde_json::Value,
    /// Always `"eval_response"`.
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Success or failure.
    pub status: ResponseStatus,
    /// The value on success, the serialized failure otherwise.
    pub result: serde_json::Value,
    /// When the response was produced.
    pub timestamp: DateTime<Utc>,
}

impl MessageResponse {
    fn new(
        session_id: SessionId,
        id: serde_json::Value,
        status: ResponseStatus,
        result: serde_json::Value,
    ) -> Self {
        Self {
            session_id,
            id,
            msg_type: "eval_response".to_string(),
            status,
            result,
            timestamp: Utc::now(),
        }
    }

    /// Successful evaluation.
    #[must_use]
    pub fn ok(session_id: SessionId, id: serde_json::Value, value: &EvalValue) -> Self {
        Self::new(session_id, id, ResponseStatus::Ok, value.json.clone())
    }

    /// Failed evaluation.
    #[must_use]
    pub fn error(session_id: SessionId, id: serde_json::Value, failure: &EvalFailure) -> Self {
        let result = serde_json::to_value(failure).unwrap_or_else(|_| {
            serde_json::json!({ "kind": failure.kind, "message": failure.message })
        });
        Self::new(session_id, id, ResponseStatus::Error, result)
    }

    /// Rejected `/message` line. The request id is unknown.
    #[must_use]
    pub fn parse_error(session_id: SessionId, err: &ReplError) -> Self {
        let failure = EvalFailure::new(err.kind(), err.to_string());
        Self::error(session_id, serde_json::Value::Null, &failure)
    }

    /// Renders the response line.
    #[must_use]
    pub fn to_line(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        format!("{MESSAGE_RESPONSE_PREFIX}{}", BASE64_STANDARD.encode(json))
    }

    /// Parses a `/message_response` line.
    ///
    /// # Errors
    ///
    /// Returns [`ReplError::Parse`] if the line lacks the prefix or does
    /// not carry a valid response body.
    pub fn from_line(line: &str) -> Result<Self, ReplError> {
        let encoded = line
            .trim()
            .strip_prefix(MESSAGE_RESPONSE_PREFIX)
            .ok_or_else(|| ReplError::Parse("not a message response".to_string()))?;
        let bytes = BASE64_STANDARD
            .decode(encoded.trim())
            .map_err(|e| ReplError::Parse(format!("invalid base64: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ReplError::Parse(format!("invalid response JSON: {e}")))
    }
}

/// Line answering successful raw code.
#[must_use]
pub fn raw_success_line(value: &EvalValue) -> String {
    value.display.replace('\n', "\\n")
}

/// Line answering failed raw code or a rejected raw line.
#[must_use]
pub fn raw_error_line(failure: &EvalFailure) -> String {
    format!("Error: {failure}").replace('\n', "\\n")
}

/// Line answering `/session_id`.
#[must_use]
pub fn session_id_line(id: SessionId) -> String {
    format!("{SESSION_ID_COMMAND} {id}")
}
