//! Boa-backed JavaScript engine.
//!
//! One [`boa_engine::Context`] holds all global state shared by every
//! session. The context is neither `Send` nor re-entrant, so a
//! [`BoaEngine`] is built on the engine worker thread and never leaves it.

use std::fmt;

use boa_engine::{Context, JsError, JsString, JsValue, Source};

use super::{EvalFailure, EvalOutcome, EvalValue, ScriptEngine};
use crate::config::ReplConfig;

/// Execution limits applied to the engine context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineLimits {
    /// Maximum iterations of any single loop.
    pub loop_iteration_limit: u64,
    /// Maximum call depth.
    pub recursion_limit: usize,
}

impl From<&ReplConfig> for EngineLimits {
    fn from(config: &ReplConfig) -> Self {
        Self {
            loop_iteration_limit: config.loop_iteration_limit,
            recursion_limit: config.recursion_limit,
        }
    }
}

/// JavaScript engine over a single shared Boa context.
pub struct BoaEngine {
    context: Context,
    limits: EngineLimits,
}

impl fmt::Debug for BoaEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoaEngine")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl BoaEngine {
    /// Creates a fresh context with the given limits.
    #[must_use]
    pub fn new(limits: EngineLimits) -> Self {
        let mut context = Context::default();
        context
            .runtime_limits_mut()
            .set_loop_iteration_limit(limits.loop_iteration_limit);
        context
            .runtime_limits_mut()
            .set_recursion_limit(limits.recursion_limit);
        Self { context, limits }
    }

    /// Converts a completion into the outcome sent back to the session.
    fn finish(&mut self, result: Result<JsValue, JsError>) -> EvalOutcome {
        // Flush promise reactions queued by the evaluation.
        if let Err(err) = self.context.run_jobs() {
            tracing::warn!(error = %err, "uncaught error in promise job");
        }
        match result {
            Ok(value) => Ok(self.render(&value)),
            Err(err) => Err(self.describe(&err)),
        }
    }

    fn render(&mut self, value: &JsValue) -> EvalValue {
        let display = value.display().to_string();
        EvalValue::new(self.to_json(value), display)
    }

    /// Renders `value` with the context's own `JSON.stringify`, falling
    /// back to the display string for values it refuses (cycles, BigInt).
    fn to_json(&mut self, value: &JsValue) -> serde_json::Value {
        if value.is_undefined() || value.is_null() {
            return serde_json::Value::Null;
        }
        match self.stringify(value) {
            Some(text) => {
                serde_json::from_str(&text).unwrap_or_else(|_| serde_json::Value::String(text))
            }
            None if value.is_callable() => serde_json::Value::Null,
            None => serde_json::Value::String(value.display().to_string()),
        }
    }

    fn stringify(&mut self, value: &JsValue) -> Option<String> {
        let json = self
            .context
            .global_object()
            .get(JsString::from("JSON"), &mut self.context)
            .ok()?;
        let stringify = json
            .as_object()?
            .get(JsString::from("stringify"), &mut self.context)
            .ok()?;
        let function = stringify.as_object()?;
        let rendered = function
            .call(&json, std::slice::from_ref(value), &mut self.context)
            .ok()?;
        rendered
            .as_string()
            .map(|text| text.to_std_string_escaped())
    }

    fn describe(&mut self, err: &JsError) -> EvalFailure {
        let rendered = match err.try_native(&mut self.context) {
            Ok(native) => native.to_string(),
            Err(_) => err.to_string(),
        };
        EvalFailure::from_rendered(&rendered)
    }

    /// Walks a dotted path from the global object, returning the receiver
    /// and the value found at the end of the path.
    fn resolve(&mut self, target: &str) -> Result<(JsValue, JsValue), EvalFailure> {
        let mut receiver = JsValue::undefined();
        let mut current = JsValue::from(self.context.global_object());
        let mut walked = String::new();

        for segment in target.split('.') {
            if segment.trim().is_empty() {
                return Err(EvalFailure::new(
                    "TypeError",
                    format!("invalid call target \"{target}\""),
                ));
            }
            let next = {
                let Some(object) = current.as_object() else {
                    return Err(EvalFailure::new(
                        "TypeError",
                        format!("{walked} is not an object"),
                    ));
                };
                object
                    .get(JsString::from(segment.trim()), &mut self.context)
                    .map_err(|err| self.describe(&err))?
            };
            if !walked.is_empty() {
                walked.push('.');
            }
            walked.push_str(segment.trim());
            receiver = current;
            current = next;
        }

        if current.is_undefined() {
            return Err(EvalFailure::new(
                "ReferenceError",
                format!("{target} is not defined"),
            ));
        }
        Ok((receiver, current))
    }
}

impl ScriptEngine for BoaEngine {
    fn eval(&mut self, source: &str) -> EvalOutcome {
        let result = self.context.eval(Source::from_bytes(source));
        self.finish(result)
    }

    fn call(&mut self, target: &str, args: &[serde_json::Value]) -> EvalOutcome {
        let (receiver, callee) = self.resolve(target)?;
        let Some(function) = callee.as_object().filter(|object| object.is_callable()) else {
            return Err(EvalFailure::new(
                "TypeError",
                format!("{target} is not a function"),
            ));
        };

        let mut js_args = Vec::with_capacity(args.len());
        for arg in args {
            let value =
                JsValue::from_json(arg, &mut self.context).map_err(|err| self.describe(&err))?;
            js_args.push(value);
        }

        let result = function.call(&receiver, &js_args, &mut self.context);
        self.finish(result)
    }
}
