//! Configurable TCP listener with graceful, signal-driven shutdown.
//!
//! ```no_run
//! use std::time::Duration;
//! use tcp_lifecycle::config::{with_host, with_port, with_request_handler};
//! use tcp_lifecycle::net::handler_fn;
//! use tcp_lifecycle::Server;
//!
//! # async fn run() -> Result<(), tcp_lifecycle::ServerError> {
//! let server = Server::new([
//!     with_host("localhost"),
//!     with_port(0),
//!     with_request_handler(handler_fn(|_conn| async {})),
//! ])?;
//! server.start().await?;
//!
//! let outcome = server.await_stop_signal(Duration::from_secs(30)).await?;
//! println!("stopped on {}", outcome.signal);
//! outcome.result
//! # }
//! ```

pub mod config;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::{ServerConfig, ServerOption};
pub use lifecycle::{LifecycleState, Server, ServerError, StopOutcome, StopSignal};
