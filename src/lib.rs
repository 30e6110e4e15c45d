//! # replwire
//!
//! A REPL server over TCP. Clients connect, send one line per request and
//! receive one line per response. Every session shares a single
//! JavaScript engine that runs on its own thread; requests from all
//! sessions are queued in front of it and evaluated one at a time.
//!
//! ## Architecture
//!
//! ```text
//! Clients (TCP, line protocol)
//!     │
//!     ├── ReplServer (server/)       start / stop / status
//!     ├── Session + Registry (session/)
//!     │
//!     ├── EvalUnit (dispatch/)       request + exactly-once callbacks
//!     ├── EngineHandle (engine/)     FIFO queue, dedicated thread
//!     │
//!     └── BoaEngine (engine/boa)     shared global state
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use replwire::config::ReplConfig;
//! use replwire::server::ReplServer;
//!
//! # async fn run() -> Result<(), replwire::error::ReplError> {
//! let server = ReplServer::new(ReplConfig::default())?;
//! let addr = server.start(0).await?;
//! println!("listening on {addr}");
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod app_state;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod server;
pub mod session;
