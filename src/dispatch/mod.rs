//! Evaluation dispatch: request shapes and the unit of work that carries a
//! request from a session to the engine and its outcome back.

pub mod request;
pub mod unit;

pub use request::{EvalRequest, StructuredMessage};
pub use unit::{EvalUnit, OnError, OnSuccess};
