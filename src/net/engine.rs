//! Connection-processing engine.
//!
//! The lifecycle only ever talks to the [`Engine`] trait: a handful of coarse
//! tuning knobs, bind, serve and a bounded stop. [`TcpEngine`] is the tokio
//! implementation shipped with the crate.
//!
//! # Data Flow
//! ```text
//! listen()   → ballast reserved → listener.rs bind (socket flags)
//!            → std listener kept in engine
//! serve()    → listener handed to the accept loops
//!            → workerpool.rs shards spawned
//!            → N accept loops (tasks, or pinned threads) → dispatch round-robin
//! shutdown() → stop flag → accept loops exit, closing the socket
//!            → shard queues close → in-flight handlers drain → drained flag
//! ```

use std::collections::TryReserveError;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::net::ballast::Ballast;
use crate::net::connection::{ConnectionTracker, RequestHandler};
use crate::net::listener::{self, AcceptLoop, ListenConfig};
use crate::net::workerpool::WorkerPool;

/// Accept loops used when none are configured.
pub const DEFAULT_LOOPS: NonZeroUsize = match NonZeroUsize::new(4) {
    Some(loops) => loops,
    None => panic!("default loop count must be non-zero"),
};

/// Worker shards used when none are configured: twice the available parallelism.
pub fn default_workerpool_shards() -> NonZeroUsize {
    let parallelism = std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1);
    NonZeroUsize::new(parallelism.saturating_mul(2)).unwrap_or(NonZeroUsize::MIN)
}

/// Errors reported by an engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("bind failed: {0}")]
    Bind(#[source] io::Error),

    #[error("engine is already listening")]
    AlreadyListening,

    #[error("engine is not listening")]
    NotListening,

    #[error("cloning listening socket: {0}")]
    CloneListener(#[source] io::Error),

    #[error("spawning accept loop thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("reserving {size_mib} MiB ballast: {source}")]
    Ballast {
        size_mib: usize,
        #[source]
        source: TryReserveError,
    },

    #[error("drain deadline exceeded with {in_flight} connections in flight")]
    DrainTimeout { in_flight: u64 },
}

/// The external collaborator driven by the listener lifecycle.
///
/// Setters are called before `listen`, only for values the caller set
/// explicitly. `serve` runs on its own task until the engine is stopped;
/// `shutdown` must return within roughly `timeout`.
pub trait Engine: Send + Sync + 'static {
    fn set_loops(&mut self, loops: NonZeroUsize);

    fn set_workerpool_shards(&mut self, shards: NonZeroUsize);

    fn set_allow_thread_locking(&mut self, allow: bool);

    fn set_ballast(&mut self, size_mib: NonZeroUsize);

    fn set_max_accept_connections(&mut self, max: NonZeroUsize);

    fn set_listen_config(&mut self, config: ListenConfig);

    fn set_request_handler(&mut self, handler: RequestHandler);

    /// Bind and listen. Returns the bound address.
    fn listen(&mut self, addr: SocketAddr) -> Result<SocketAddr, EngineError>;

    /// Accept and serve connections until stopped.
    fn serve(self: Arc<Self>) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Stop accepting and wait up to `timeout` for in-flight work to drain.
    fn shutdown(&self, timeout: Duration) -> impl Future<Output = Result<(), EngineError>> + Send;
}

/// Resolves once `flag` is (or becomes) true, or its sender is gone.
pub(crate) async fn stopped(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|set| *set).await;
}

/// Tokio-based engine: shared listening socket, accept loops, sharded workers.
pub struct TcpEngine {
    loops: NonZeroUsize,
    shards: NonZeroUsize,
    allow_thread_locking: bool,
    ballast_mib: Option<NonZeroUsize>,
    ballast: Option<Ballast>,
    connection_limit: Option<Arc<Semaphore>>,
    listen_config: ListenConfig,
    handler: Option<RequestHandler>,
    /// Taken by `serve`; the accept loops own the socket from then on.
    listener: Mutex<Option<std::net::TcpListener>>,
    stop: watch::Sender<bool>,
    drained: watch::Sender<bool>,
    tracker: ConnectionTracker,
}

impl TcpEngine {
    pub fn new() -> Self {
        Self {
            loops: DEFAULT_LOOPS,
            shards: default_workerpool_shards(),
            allow_thread_locking: false,
            ballast_mib: None,
            ballast: None,
            connection_limit: None,
            listen_config: ListenConfig::default(),
            handler: None,
            listener: Mutex::new(None),
            stop: watch::Sender::new(false),
            drained: watch::Sender::new(false),
            tracker: ConnectionTracker::new(),
        }
    }

    /// Connections currently inside a handler.
    pub fn in_flight(&self) -> u64 {
        self.tracker.active_count()
    }

    /// Bytes held by the ballast, zero when none was reserved.
    pub fn ballast_bytes(&self) -> usize {
        self.ballast.as_ref().map_or(0, Ballast::capacity)
    }

    async fn run(&self) -> Result<(), EngineError> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(EngineError::NotListening)?;

        // The original goes to the last loop so no descriptor outlives them.
        let mut sockets = (1..self.loops.get())
            .map(|_| listener.try_clone())
            .collect::<Result<Vec<_>, _>>()
            .map_err(EngineError::CloneListener)?;
        sockets.push(listener);

        let (pool, dispatcher) =
            WorkerPool::start(self.shards.get(), self.handler.clone(), self.tracker.clone());

        let mut loops = JoinSet::new();
        let mut pinned = Vec::new();
        let mut spawn_error = None;

        for (id, socket) in sockets.into_iter().enumerate() {
            let accept_loop = AcceptLoop {
                id,
                listener: socket,
                dispatcher: dispatcher.offset(id),
                stop: self.stop.subscribe(),
                connection_limit: self.connection_limit.clone(),
            };
            if self.allow_thread_locking {
                match accept_loop.spawn_pinned() {
                    Ok(done) => pinned.push(done),
                    Err(e) => {
                        spawn_error = Some(e);
                        self.stop.send_replace(true);
                        break;
                    }
                }
            } else {
                loops.spawn(accept_loop.run());
            }
        }
        drop(dispatcher);

        if spawn_error.is_none() {
            tracing::info!(
                loops = self.loops.get(),
                shards = self.shards.get(),
                thread_locking = self.allow_thread_locking,
                ballast_mib = self.ballast_mib.map(NonZeroUsize::get),
                "Engine serving"
            );
        }

        while let Some(result) = loops.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Accept loop failed");
            }
        }
        for done in pinned {
            let _ = done.await;
        }
        pool.drain().await;

        match spawn_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for TcpEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for TcpEngine {
    fn set_loops(&mut self, loops: NonZeroUsize) {
        self.loops = loops;
    }

    fn set_workerpool_shards(&mut self, shards: NonZeroUsize) {
        self.shards = shards;
    }

    fn set_allow_thread_locking(&mut self, allow: bool) {
        self.allow_thread_locking = allow;
    }

    fn set_ballast(&mut self, size_mib: NonZeroUsize) {
        self.ballast_mib = Some(size_mib);
    }

    fn set_max_accept_connections(&mut self, max: NonZeroUsize) {
        self.connection_limit = Some(Arc::new(Semaphore::new(max.get())));
    }

    fn set_listen_config(&mut self, config: ListenConfig) {
        self.listen_config = config;
    }

    fn set_request_handler(&mut self, handler: RequestHandler) {
        self.handler = Some(handler);
    }

    fn listen(&mut self, addr: SocketAddr) -> Result<SocketAddr, EngineError> {
        let slot = self.listener.get_mut().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(EngineError::AlreadyListening);
        }

        if let (Some(size), None) = (self.ballast_mib, &self.ballast) {
            let ballast = Ballast::allocate(size.get()).map_err(|source| EngineError::Ballast {
                size_mib: size.get(),
                source,
            })?;
            tracing::debug!(size_mib = size.get(), "Ballast reserved");
            self.ballast = Some(ballast);
        }

        let listener = listener::bind(addr, &self.listen_config).map_err(EngineError::Bind)?;
        let local_addr = listener.local_addr().map_err(EngineError::Bind)?;

        tracing::info!(
            address = %local_addr,
            reuse_port = self.listen_config.reuse_port,
            fast_open = self.listen_config.fast_open,
            defer_accept = self.listen_config.defer_accept,
            "Listener bound"
        );

        *slot = Some(listener);
        Ok(local_addr)
    }

    fn serve(self: Arc<Self>) -> impl Future<Output = Result<(), EngineError>> + Send {
        async move {
            let result = self.run().await;
            self.drained.send_replace(true);
            tracing::info!("Engine drained");
            result
        }
    }

    fn shutdown(&self, timeout: Duration) -> impl Future<Output = Result<(), EngineError>> + Send {
        async move {
            tracing::info!(
                in_flight = self.tracker.active_count(),
                timeout_ms = timeout.as_millis() as u64,
                "Engine stopping"
            );
            self.stop.send_replace(true);

            let mut drained = self.drained.subscribe();
            if tokio::time::timeout(timeout, stopped(&mut drained)).await.is_err() {
                return Err(EngineError::DrainTimeout {
                    in_flight: self.tracker.active_count(),
                });
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::handler_fn;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn echo() -> RequestHandler {
        handler_fn(|mut conn| async move {
            let mut buf = [0u8; 64];
            while let Ok(n) = conn.stream().read(&mut buf).await {
                if n == 0 || conn.stream().write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        })
    }

    async fn round_trip(addr: SocketAddr) {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn defaults_are_positive() {
        assert_eq!(DEFAULT_LOOPS.get(), 4);
        assert!(default_workerpool_shards().get() >= 2);
    }

    #[tokio::test]
    async fn listen_twice_is_rejected() {
        let mut engine = TcpEngine::new();
        engine.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(matches!(
            engine.listen("127.0.0.1:0".parse().unwrap()),
            Err(EngineError::AlreadyListening)
        ));
    }

    #[tokio::test]
    async fn serve_without_listen_fails() {
        let engine = Arc::new(TcpEngine::new());
        assert!(matches!(
            Arc::clone(&engine).serve().await,
            Err(EngineError::NotListening)
        ));
        // drained is still signalled so shutdown does not wait
        engine.shutdown(Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    async fn serves_and_drains() {
        let mut engine = TcpEngine::new();
        engine.set_loops(NonZeroUsize::new(2).unwrap());
        engine.set_workerpool_shards(NonZeroUsize::new(2).unwrap());
        engine.set_request_handler(echo());
        let addr = engine.listen("127.0.0.1:0".parse().unwrap()).unwrap();

        let engine = Arc::new(engine);
        let serving = tokio::spawn(Arc::clone(&engine).serve());

        round_trip(addr).await;

        engine.shutdown(Duration::from_secs(2)).await.unwrap();
        serving.await.unwrap().unwrap();
        assert_eq!(engine.in_flight(), 0);
    }

    #[tokio::test]
    async fn pinned_accept_loops_serve() {
        let mut engine = TcpEngine::new();
        engine.set_loops(NonZeroUsize::new(2).unwrap());
        engine.set_allow_thread_locking(true);
        engine.set_ballast(NonZeroUsize::new(1).unwrap());
        engine.set_request_handler(echo());
        let addr = engine.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(engine.ballast_bytes() >= 1 << 20);

        let engine = Arc::new(engine);
        let serving = tokio::spawn(Arc::clone(&engine).serve());

        round_trip(addr).await;

        engine.shutdown(Duration::from_secs(2)).await.unwrap();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn ballast_failure_is_reported_by_listen() {
        let mut engine = TcpEngine::new();
        engine.set_ballast(NonZeroUsize::MAX);

        let err = engine.listen("127.0.0.1:0".parse().unwrap()).unwrap_err();
        assert!(matches!(err, EngineError::Ballast { .. }));
        assert_eq!(engine.ballast_bytes(), 0);
        assert!(engine.listener.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn listening_socket_closes_while_draining() {
        let mut engine = TcpEngine::new();
        engine.set_loops(NonZeroUsize::new(2).unwrap());
        engine.set_request_handler(handler_fn(|_conn| std::future::pending::<()>()));
        let addr = engine.listen("127.0.0.1:0".parse().unwrap()).unwrap();

        let engine = Arc::new(engine);
        let serving = tokio::spawn(Arc::clone(&engine).serve());

        let _held = TcpStream::connect(addr).await.unwrap();
        while engine.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let stopping = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.shutdown(Duration::from_secs(2)).await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!stopping.is_finished());
        assert!(TcpStream::connect(addr).await.is_err());

        serving.abort();
        stopping.abort();
    }

    #[tokio::test]
    async fn stuck_handler_times_out() {
        let mut engine = TcpEngine::new();
        engine.set_request_handler(handler_fn(|_conn| std::future::pending::<()>()));
        let addr = engine.listen("127.0.0.1:0".parse().unwrap()).unwrap();

        let engine = Arc::new(engine);
        let serving = tokio::spawn(Arc::clone(&engine).serve());

        let _client = TcpStream::connect(addr).await.unwrap();
        while engine.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let err = engine.shutdown(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, EngineError::DrainTimeout { in_flight: 1 }));
        serving.abort();
    }

    #[tokio::test]
    async fn connection_limit_holds_back_accepts() {
        let mut engine = TcpEngine::new();
        engine.set_loops(NonZeroUsize::MIN);
        engine.set_max_accept_connections(NonZeroUsize::MIN);
        engine.set_request_handler(handler_fn(|mut conn| async move {
            let mut buf = [0u8; 1];
            let _ = conn.stream().read(&mut buf).await;
        }));
        let addr = engine.listen("127.0.0.1:0".parse().unwrap()).unwrap();

        let engine = Arc::new(engine);
        let serving = tokio::spawn(Arc::clone(&engine).serve());

        let first = TcpStream::connect(addr).await.unwrap();
        let _second = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.in_flight(), 1);

        drop(first);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.in_flight(), 1);

        serving.abort();
    }
}
