//! Request shapes accepted from a session.

use serde::{Deserialize, Serialize};

use crate::error::ReplError;

/// One inbound evaluation request, decided at parse time.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalRequest {
    /// Source text evaluated as-is.
    RawCode(String),
    /// Structured call, optionally carrying code to run first.
    Message(StructuredMessage),
}

impl EvalRequest {
    /// Short label for logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::RawCode(_) => "raw",
            Self::Message(_) => "message",
        }
    }
}

/// Key/value payload describing a call plus optional code.
///
/// ```json
/// { "id": 7, "src": "function sq(n) { return n * n; }", "target": "sq", "args": [4] }
/// ```
///
/// At least one of `src` and `target` must be present. When both are,
/// `src` runs first so it can define the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredMessage {
    /// Client correlation id, echoed back untouched.
    #[serde(default)]
    pub id: serde_json::Value,

    /// Session id the client believes it has. Informational only.
    #[serde(
        rename = "session-id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub session_id: Option<String>,

    /// Code evaluated in the shared context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,

    /// Dotted path of the callable to invoke, e.g. `"Math.max"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Call arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<serde_json::Value>,
}

impl StructuredMessage {
    /// Creates a message that evaluates `src`.
    #[must_use]
    pub fn eval(id: serde_json::Value, src: impl Into<String>) -> Self {
        Self {
            id,
            session_id: None,
            src: Some(src.into()),
            target: None,
            args: Vec::new(),
        }
    }

    /// Creates a message that calls `target` with `args`.
    #[must_use]
    pub fn call(
        id: serde_json::Value,
        target: impl Into<String>,
        args: Vec<serde_json::Value>,
    ) -> Self {
        Self {
            id,
            session_id: None,
            src: None,
            target: Some(target.into()),
            args,
        }
    }

    /// Parses and validates a message from its JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`ReplError::Parse`] if the text is not a JSON object of the
    /// expected shape or carries neither `src` nor `target`.
    pub fn from_json(text: &str) -> Result<Self, ReplError> {
        let message: Self = serde_json::from_str(text)
            .map_err(|e| ReplError::Parse(format!("invalid message JSON: {e}")))?;
        message.validate()?;
        Ok(message)
    }

    /// Checks that the message names something to do.
    ///
    /// # Errors
    ///
    /// Returns [`ReplError::Parse`] when both `src` and `target` are
    /// missing or blank.
    pub fn validate(&self) -> Result<(), ReplError> {
        let has_src = self.src.as_deref().is_some_and(|s| !s.trim().is_empty());
        let has_target = self.target.as_deref().is_some_and(|t| !t.trim().is_empty());
        if has_src || has_target {
            Ok(())
        } else {
            Err(ReplError::Parse(
                "message carries neither src nor target".to_string(),
            ))
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_src_message() {
        let Ok(msg) = StructuredMessage::from_json(r#"{"id": 3, "src": "1+1"}"#) else {
            panic!("valid message rejected");
        };
        assert_eq!(msg.id, json!(3));
        assert_eq!(msg.src.as_deref(), Some("1+1"));
        assert!(msg.args.is_empty());
    }

    #[test]
    fn parses_call_with_session_id() {
        let text = r#"{"id": "a", "session-id": "s1", "target": "Math.max", "args": [1, 2]}"#;
        let Ok(msg) = StructuredMessage::from_json(text) else {
            panic!("valid message rejected");
        };
        assert_eq!(msg.session_id.as_deref(), Some("s1"));
        assert_eq!(msg.target.as_deref(), Some("Math.max"));
        assert_eq!(msg.args, vec![json!(1), json!(2)]);
    }

    #[test]
    fn rejects_message_without_work() {
        let Err(err) = StructuredMessage::from_json(r#"{"id": 1, "src": "  "}"#) else {
            panic!("empty message accepted");
        };
        assert_eq!(err.kind(), "ParseError");
    }

    #[test]
    fn rejects_non_object() {
        assert!(StructuredMessage::from_json("[1, 2]").is_err());
        assert!(StructuredMessage::from_json("not json").is_err());
    }

    #[test]
    fn missing_id_defaults_to_null() {
        let Ok(msg) = StructuredMessage::from_json(r#"{"target": "f"}"#) else {
            panic!("valid message rejected");
        };
        assert_eq!(msg.id, serde_json::Value::Null);
    }

    #[test]
    fn labels() {
        assert_eq!(EvalRequest::RawCode("1".into()).label(), "raw");
        let msg = StructuredMessage::eval(json!(1), "1");
        assert_eq!(EvalRequest::Message(msg).label(), "message");
    }
}
