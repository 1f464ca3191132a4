//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events with structured fields (address, signal, in_flight, ...)
//!     → logging.rs subscriber (env filter + fmt layer) → stdout
//! ```
//!
//! # Design Decisions
//! - Structured fields over interpolated messages
//! - Library code only emits events; the binary installs the subscriber

pub mod logging;
