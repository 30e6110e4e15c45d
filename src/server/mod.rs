//! Server controller and status reporting.

pub mod controller;
pub mod status;

pub use controller::ReplServer;
pub use status::ServerStatus;
