//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber
//! - Log level from `RUST_LOG`, falling back to the configured directives
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - Initialization is idempotent so tests and embedders can call it freely

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when neither `RUST_LOG` nor the settings file says otherwise.
pub const DEFAULT_DIRECTIVES: &str = "tcp_lifecycle=info";

/// Install the global subscriber. Returns false if one was already set.
pub fn init(default_directives: &str) -> bool {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_directives.into()))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
