//! Session layer: identity, registry, wire protocol and the per-connection
//! loop.
//!
//! Every accepted connection becomes one [`Session`] with a fresh
//! [`SessionId`]. The [`SessionRegistry`] owns the handle that keeps it
//! open; the session only knows its server through a weak reference.

pub mod connection;
pub mod protocol;
pub mod registry;
pub mod session_id;

pub use connection::{CloseReason, Session, SessionSink};
pub use registry::{SessionHandle, SessionInfo, SessionRegistry};
pub use session_id::SessionId;
