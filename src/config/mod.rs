//! Configuration subsystem.
//!
//! # Data Flow
//! ```text
//! with_* options (or settings file → schema.rs → options)
//!     → options.rs (per-option validation into a draft)
//!     → builder.rs (ordered fold, first error wins)
//!     → ServerConfig (immutable, defaults on read)
//!     → address.rs (host:port validation gate, before any bind)
//! ```
//!
//! # Design Decisions
//! - Every field starts unset so engine defaults apply only where the caller made no choice
//! - Last write wins; no cross-option conflict detection
//! - Config is immutable once built and shared read-only with the engine

pub mod address;
pub mod builder;
pub mod loader;
pub mod options;
pub mod schema;

pub use address::{resolve_address, AddressError};
pub use builder::{ConfigBuilder, ServerConfig};
pub use options::*;
pub use schema::ServerSettings;
