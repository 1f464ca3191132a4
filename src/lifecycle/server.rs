//! Listener lifecycle.
//!
//! # Responsibilities
//! - Build and validate the configuration, then the listen address
//! - Push explicitly set tuning values onto the engine
//! - Bind, then launch the serve loop on its own task
//! - Bounded, idempotent shutdown
//!
//! # States
//! ```text
//! Unstarted → Listening → Serving → ShuttingDown → Stopped
//! ```
//!
//! # Design Decisions
//! - One async mutex serializes `start` and `shutdown`
//! - A failed bind or ballast reservation leaves the lifecycle `Unstarted`
//!   so the caller may retry
//! - The shutdown deadline is enforced here too, not only by the engine

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::address::{resolve_address, AddressError};
use crate::config::builder::ServerConfig;
use crate::config::options::{ConfigError, ServerOption};
use crate::lifecycle::shutdown::{ShutdownCoordinator, StopOutcome};
use crate::lifecycle::signals::SignalListener;
use crate::net::engine::{Engine, EngineError, TcpEngine};

/// Lifecycle state of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Unstarted,
    Listening,
    Serving,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Unstarted => "unstarted",
            LifecycleState::Listening => "listening",
            LifecycleState::Serving => "serving",
            LifecycleState::ShuttingDown => "shutting down",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by the lifecycle, tagged with the failing stage.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("validating address: {0}")]
    Address(#[from] AddressError),

    #[error("listening on interface {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: EngineError,
    },

    #[error("preparing engine: {0}")]
    Engine(#[source] EngineError),

    #[error("server already started")]
    AlreadyStarted,

    #[error("registering signal handlers: {0}")]
    Signals(#[source] std::io::Error),

    #[error("shutdown deadline of {timeout:?} exceeded")]
    ShutdownTimeout {
        timeout: Duration,
        #[source]
        source: Option<EngineError>,
    },

    #[error("engine fault during shutdown: {0}")]
    Shutdown(#[source] EngineError),
}

enum Slot<E> {
    Idle(E),
    Running {
        engine: Arc<E>,
        serving: JoinHandle<()>,
    },
    Stopped,
}

/// A configured TCP listener and its engine.
pub struct Server<E: Engine = TcpEngine> {
    config: ServerConfig,
    address: SocketAddr,
    local_addr: OnceLock<SocketAddr>,
    state: watch::Sender<LifecycleState>,
    slot: Mutex<Slot<E>>,
}

impl Server<TcpEngine> {
    /// Build a server backed by [`TcpEngine`].
    pub fn new<I>(options: I) -> Result<Self, ServerError>
    where
        I: IntoIterator<Item = ServerOption>,
    {
        Self::with_engine(TcpEngine::new(), options)
    }
}

impl<E: Engine> Server<E> {
    /// Build a server around a caller-supplied engine.
    ///
    /// Fails on the first invalid option or on an invalid address; nothing is
    /// bound until [`start`](Self::start).
    pub fn with_engine<I>(engine: E, options: I) -> Result<Self, ServerError>
    where
        I: IntoIterator<Item = ServerOption>,
    {
        let config = ServerConfig::from_options(options)?;
        let address = resolve_address(config.host(), config.port())?;

        tracing::debug!(address = %address, "Server configured");

        Ok(Self {
            config,
            address,
            local_addr: OnceLock::new(),
            state: watch::Sender::new(LifecycleState::Unstarted),
            slot: Mutex::new(Slot::Idle(engine)),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Validated address requested for binding.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Address actually bound; set once `start` succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    fn transition(&self, next: LifecycleState) {
        let previous = self.state.send_replace(next);
        tracing::debug!(from = %previous, to = %next, "Lifecycle transition");
    }

    /// Bind and start serving in the background.
    ///
    /// Returns once the socket is listening; a bind failure is reported here.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let mut slot = self.slot.lock().await;

        let mut engine = match std::mem::replace(&mut *slot, Slot::Stopped) {
            Slot::Idle(engine) => engine,
            other => {
                *slot = other;
                return Err(ServerError::AlreadyStarted);
            }
        };

        self.configure(&mut engine);

        let local_addr = match engine.listen(self.address) {
            Ok(addr) => addr,
            Err(source) => {
                *slot = Slot::Idle(engine);
                return Err(match source {
                    EngineError::Ballast { .. } => ServerError::Engine(source),
                    source => ServerError::Bind {
                        address: self.address,
                        source,
                    },
                });
            }
        };
        let _ = self.local_addr.set(local_addr);
        self.transition(LifecycleState::Listening);

        let engine = Arc::new(engine);
        let serving = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move {
                if let Err(e) = engine.serve().await {
                    tracing::error!(error = %e, "Engine stopped serving with an error");
                }
            }
        });
        *slot = Slot::Running { engine, serving };
        self.transition(LifecycleState::Serving);

        tracing::info!(address = %local_addr, "Server started");
        Ok(local_addr)
    }

    /// Apply explicitly set values; unset ones keep the engine defaults.
    fn configure(&self, engine: &mut E) {
        let explicit = &self.config.explicit;

        engine.set_listen_config(self.config.listen_config());
        if let Some(loops) = explicit.loops {
            engine.set_loops(loops);
        }
        if let Some(shards) = explicit.workerpool_shards {
            engine.set_workerpool_shards(shards);
        }
        if let Some(allow) = explicit.allow_thread_locking {
            engine.set_allow_thread_locking(allow);
        }
        if let Some(size) = explicit.ballast_mib {
            engine.set_ballast(size);
        }
        if let Some(max) = explicit.max_accept_connections {
            engine.set_max_accept_connections(max);
        }
        match &explicit.handler {
            Some(handler) => engine.set_request_handler(handler.clone()),
            None => tracing::warn!("No request handler configured; connections will be closed"),
        }
    }

    /// Stop accepting, drain for up to `timeout`, and reach `Stopped`.
    ///
    /// A no-op before `start` and after a previous shutdown. The lifecycle is
    /// `Stopped` when this returns, even if an error is reported.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ServerError> {
        let mut slot = self.slot.lock().await;

        let (engine, mut serving) = match std::mem::replace(&mut *slot, Slot::Stopped) {
            Slot::Running { engine, serving } => (engine, serving),
            other => {
                *slot = other;
                return Ok(());
            }
        };

        self.transition(LifecycleState::ShuttingDown);
        tracing::info!(timeout_ms = timeout.as_millis() as u64, "Server shutting down");

        let deadline = tokio::time::Instant::now() + timeout;
        let mut result = match tokio::time::timeout_at(deadline, engine.shutdown(timeout)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e @ EngineError::DrainTimeout { .. })) => Err(ServerError::ShutdownTimeout {
                timeout,
                source: Some(e),
            }),
            Ok(Err(e)) => Err(ServerError::Shutdown(e)),
            Err(_) => Err(ServerError::ShutdownTimeout {
                timeout,
                source: None,
            }),
        };

        if result.is_ok() {
            if tokio::time::timeout_at(deadline, &mut serving).await.is_err() {
                result = Err(ServerError::ShutdownTimeout {
                    timeout,
                    source: None,
                });
            }
        }
        if !serving.is_finished() {
            serving.abort();
        }

        self.transition(LifecycleState::Stopped);
        match &result {
            Ok(()) => tracing::info!("Server stopped"),
            Err(e) => tracing::warn!(error = %e, "Server stopped without a clean drain"),
        }
        result
    }

    /// Block until a termination signal arrives, then shut down within
    /// `stop_timeout`.
    pub async fn await_stop_signal(&self, stop_timeout: Duration) -> Result<StopOutcome, ServerError> {
        let signals = SignalListener::os().map_err(ServerError::Signals)?;
        Ok(ShutdownCoordinator::new(signals, stop_timeout).run(self).await)
    }
}

impl<E: Engine> fmt::Debug for Server<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.address)
            .field("local_addr", &self.local_addr())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::options::*;
    use crate::net::connection::{handler_fn, RequestHandler};
    use crate::net::listener::ListenConfig;
    use std::future::Future;
    use std::io;
    use std::num::NonZeroUsize;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Default)]
    struct Calls {
        loops: Option<usize>,
        shards: Option<usize>,
        thread_locking: Option<bool>,
        ballast: Option<usize>,
        max_connections: Option<usize>,
        listen_config: Option<ListenConfig>,
        handler: bool,
        listened: usize,
        shutdowns: usize,
    }

    /// Engine double that records calls and drains on demand.
    struct RecordingEngine {
        calls: Arc<StdMutex<Calls>>,
        fail_bind: bool,
        drains: bool,
        stop: watch::Sender<bool>,
    }

    impl RecordingEngine {
        fn new(drains: bool) -> (Self, Arc<StdMutex<Calls>>) {
            let calls = Arc::new(StdMutex::new(Calls::default()));
            (
                Self {
                    calls: Arc::clone(&calls),
                    fail_bind: false,
                    drains,
                    stop: watch::Sender::new(false),
                },
                calls,
            )
        }
    }

    impl Engine for RecordingEngine {
        fn set_loops(&mut self, loops: NonZeroUsize) {
            self.calls.lock().unwrap().loops = Some(loops.get());
        }

        fn set_workerpool_shards(&mut self, shards: NonZeroUsize) {
            self.calls.lock().unwrap().shards = Some(shards.get());
        }

        fn set_allow_thread_locking(&mut self, allow: bool) {
            self.calls.lock().unwrap().thread_locking = Some(allow);
        }

        fn set_ballast(&mut self, size_mib: NonZeroUsize) {
            self.calls.lock().unwrap().ballast = Some(size_mib.get());
        }

        fn set_max_accept_connections(&mut self, max: NonZeroUsize) {
            self.calls.lock().unwrap().max_connections = Some(max.get());
        }

        fn set_listen_config(&mut self, config: ListenConfig) {
            self.calls.lock().unwrap().listen_config = Some(config);
        }

        fn set_request_handler(&mut self, _handler: RequestHandler) {
            self.calls.lock().unwrap().handler = true;
        }

        fn listen(&mut self, addr: SocketAddr) -> Result<SocketAddr, EngineError> {
            self.calls.lock().unwrap().listened += 1;
            if self.fail_bind {
                return Err(EngineError::Bind(io::Error::from(io::ErrorKind::AddrInUse)));
            }
            Ok(SocketAddr::new(addr.ip(), 4242))
        }

        fn serve(self: Arc<Self>) -> impl Future<Output = Result<(), EngineError>> + Send {
            async move {
                let mut stop = self.stop.subscribe();
                let _ = stop.wait_for(|s| *s).await;
                Ok(())
            }
        }

        fn shutdown(&self, _timeout: Duration) -> impl Future<Output = Result<(), EngineError>> + Send {
            async move {
                self.calls.lock().unwrap().shutdowns += 1;
                if self.drains {
                    self.stop.send_replace(true);
                    Ok(())
                } else {
                    std::future::pending().await
                }
            }
        }
    }

    #[tokio::test]
    async fn only_explicit_settings_reach_the_engine() {
        let (engine, calls) = RecordingEngine::new(true);
        let server = Server::with_engine(engine, [with_loops(8), with_ballast(32)]).unwrap();
        server.start().await.unwrap();

        {
            let calls = calls.lock().unwrap();
            assert_eq!(calls.loops, Some(8));
            assert_eq!(calls.ballast, Some(32));
            assert_eq!(calls.shards, None);
            assert_eq!(calls.thread_locking, None);
            assert_eq!(calls.max_connections, None);
            assert!(!calls.handler);
            assert_eq!(calls.listen_config, Some(ListenConfig::default()));
        }

        server.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn walks_through_every_state() {
        let (engine, calls) = RecordingEngine::new(true);
        let server = Server::with_engine(
            engine,
            [with_request_handler(handler_fn(|_conn| async {}))],
        )
        .unwrap();
        assert_eq!(server.state(), LifecycleState::Unstarted);
        assert_eq!(server.local_addr(), None);

        let mut states = server.watch_state();
        let addr = server.start().await.unwrap();
        assert_eq!(addr.port(), 4242);
        assert_eq!(server.local_addr(), Some(addr));
        assert_eq!(server.state(), LifecycleState::Serving);
        assert!(states.has_changed().unwrap());
        assert!(calls.lock().unwrap().handler);

        server.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(server.state(), LifecycleState::Stopped);
        assert_eq!(*states.borrow_and_update(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let (engine, calls) = RecordingEngine::new(true);
        let server = Server::with_engine(engine, []).unwrap();
        server.start().await.unwrap();
        assert!(matches!(server.start().await, Err(ServerError::AlreadyStarted)));
        assert_eq!(calls.lock().unwrap().listened, 1);

        server.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(server.start().await, Err(ServerError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn shutdown_before_start_is_a_noop() {
        let (engine, calls) = RecordingEngine::new(false);
        let server = Server::with_engine(engine, []).unwrap();

        tokio::time::timeout(Duration::from_millis(100), server.shutdown(Duration::from_secs(60)))
            .await
            .expect("shutdown before start must not block")
            .unwrap();
        assert_eq!(server.state(), LifecycleState::Unstarted);
        assert_eq!(calls.lock().unwrap().shutdowns, 0);
    }

    #[tokio::test]
    async fn second_shutdown_is_a_noop() {
        let (engine, calls) = RecordingEngine::new(true);
        let server = Server::with_engine(engine, []).unwrap();
        server.start().await.unwrap();

        server.shutdown(Duration::from_secs(1)).await.unwrap();
        server.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(calls.lock().unwrap().shutdowns, 1);
    }

    #[tokio::test]
    async fn stuck_engine_still_reaches_stopped() {
        let (engine, _calls) = RecordingEngine::new(false);
        let server = Server::with_engine(engine, []).unwrap();
        server.start().await.unwrap();

        let started = tokio::time::Instant::now();
        let err = server.shutdown(Duration::from_millis(50)).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(err, ServerError::ShutdownTimeout { source: None, .. }));
        assert_eq!(server.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn bind_failure_leaves_server_unstarted() {
        let (mut engine, calls) = RecordingEngine::new(true);
        engine.fail_bind = true;
        let server = Server::with_engine(engine, [with_port(8080)]).unwrap();

        let err = server.start().await.unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
        assert!(err.to_string().starts_with("listening on interface 127.0.0.1:8080"));
        assert_eq!(server.state(), LifecycleState::Unstarted);
        assert_eq!(server.local_addr(), None);

        // engine was handed back, so a retry reaches it again
        assert!(server.start().await.is_err());
        assert_eq!(calls.lock().unwrap().listened, 2);
    }

    #[test]
    fn invalid_options_fail_construction() {
        let err = Server::new([with_host("localhost"), with_port(-1)]).unwrap_err();
        assert!(matches!(err, ServerError::Config(ConfigError::NegativePort(-1))));
        assert!(err.to_string().starts_with("invalid configuration"));
    }

    #[test]
    fn out_of_range_port_fails_address_validation() {
        let err = Server::new([with_port(70_000)]).unwrap_err();
        assert!(matches!(err, ServerError::Address(_)));
        assert!(err.to_string().starts_with("validating address"));
    }
}
