//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Engine (engine.rs) configured by the lifecycle
//!     → listener.rs (socket flags, bind, accept loops, connection limit)
//!     → workerpool.rs (round-robin onto shards)
//!     → connection.rs (tracking, hand off to the request handler)
//! ```
//!
//! # Design Decisions
//! - The lifecycle depends on the `Engine` trait only
//! - Every in-flight connection is tracked so shutdown can drain or report it
//! - Accept loops and shards are owned by the serve task; aborting it cancels both

pub mod ballast;
pub mod connection;
pub mod engine;
pub mod listener;
mod workerpool;

pub use connection::{handler_fn, Connection, ConnectionId, RequestHandler};
pub use engine::{Engine, EngineError, TcpEngine};
pub use listener::ListenConfig;
