//! Shutdown coordination.
//!
//! Bridges a [`SignalListener`] to [`Server::shutdown`]: wait for the first
//! stop signal, then run a bounded graceful shutdown and report both what
//! triggered it and how it went.

use std::time::Duration;

use crate::lifecycle::server::{Server, ServerError};
use crate::lifecycle::signals::{SignalListener, StopSignal};
use crate::net::engine::Engine;

/// What stopped the server and whether the drain finished in time.
#[derive(Debug)]
pub struct StopOutcome {
    pub signal: StopSignal,
    pub result: Result<(), ServerError>,
}

impl StopOutcome {
    /// True when the server drained within the deadline.
    pub fn is_clean(&self) -> bool {
        self.result.is_ok()
    }
}

/// Single-use coordinator; `run` consumes it.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    signals: SignalListener,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(signals: SignalListener, timeout: Duration) -> Self {
        Self { signals, timeout }
    }

    /// Wait for a stop signal, then shut `server` down.
    pub async fn run<E: Engine>(self, server: &Server<E>) -> StopOutcome {
        let signal = self.signals.recv().await;
        tracing::info!(signal = %signal, "Stop signal received, shutting down");

        let result = server.shutdown(self.timeout).await;
        StopOutcome { signal, result }
    }
}
