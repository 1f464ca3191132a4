//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (server.rs):
//!     Options → ServerConfig → address check → configure engine → bind → serve task
//!
//! Signals (signals.rs):
//!     SIGINT/SIGTERM/SIGHUP/SIGQUIT/SIGABRT → single-slot listener
//!
//! Shutdown (shutdown.rs):
//!     First signal → stop accepting → drain (bounded) → Stopped
//! ```
//!
//! # Design Decisions
//! - Bind errors surface from `start`; serving runs in the background
//! - Shutdown has a hard deadline: `Stopped` is reached even if the drain is not
//! - Only the first signal triggers shutdown; later ones are absorbed

pub mod server;
pub mod shutdown;
pub mod signals;

pub use server::{LifecycleState, Server, ServerError};
pub use shutdown::{ShutdownCoordinator, StopOutcome};
pub use signals::{SignalListener, SignalTrigger, StopSignal};
