//! Listening socket and accept loops.
//!
//! # Responsibilities
//! - Create the listening socket with listen-time flags
//!   (SO_REUSEPORT, TCP_FASTOPEN, TCP_DEFER_ACCEPT)
//! - Run accept loops that hand connections to the worker pool
//! - Enforce the optional connection limit via semaphore
//! - Graceful handling of accept errors
//!
//! # Design Decisions
//! - Linux-only flags are ignored on other targets with a debug log
//! - Accepted streams cross to the worker pool as std streams so a loop may
//!   run on its own runtime when thread locking is allowed

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch, OwnedSemaphorePermit, Semaphore};

use crate::net::engine::{stopped, EngineError};
use crate::net::workerpool::Dispatcher;

/// Queue length used when fast open is enabled without an explicit value.
pub const DEFAULT_FAST_OPEN_QUEUE_LEN: u32 = 256;

/// Pending-connection backlog passed to `listen(2)`.
pub const DEFAULT_BACKLOG: i32 = 1024;

/// Pause after a failed accept (e.g. EMFILE) before retrying.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Socket flags applied before the socket starts listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenConfig {
    pub reuse_port: bool,
    pub fast_open: bool,
    pub fast_open_queue_len: u32,
    pub defer_accept: bool,
    pub backlog: i32,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            reuse_port: false,
            fast_open: false,
            fast_open_queue_len: DEFAULT_FAST_OPEN_QUEUE_LEN,
            defer_accept: false,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

/// Create, configure, bind and listen.
///
/// The returned listener is non-blocking and ready for `TcpListener::from_std`.
pub fn bind(addr: SocketAddr, config: &ListenConfig) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    #[cfg(unix)]
    socket.set_reuse_address(true)?;

    if config.reuse_port {
        set_reuse_port(&socket)?;
    }
    if config.fast_open {
        set_fast_open(&socket, config.fast_open_queue_len)?;
    }
    if config.defer_accept {
        set_defer_accept(&socket)?;
    }

    socket.bind(&addr.into())?;
    socket.listen(config.backlog)?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

#[cfg(all(
    unix,
    not(any(target_os = "solaris", target_os = "illumos"))
))]
fn set_reuse_port(socket: &Socket) -> io::Result<()> {
    socket.set_reuse_port(true)
}

#[cfg(not(all(
    unix,
    not(any(target_os = "solaris", target_os = "illumos"))
)))]
fn set_reuse_port(_socket: &Socket) -> io::Result<()> {
    tracing::debug!("SO_REUSEPORT not supported on this platform, ignoring");
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_fast_open(socket: &Socket, queue_len: u32) -> io::Result<()> {
    let queue_len = libc::c_int::try_from(queue_len).unwrap_or(libc::c_int::MAX);
    set_tcp_option(socket, libc::TCP_FASTOPEN, queue_len)
}

#[cfg(not(target_os = "linux"))]
fn set_fast_open(_socket: &Socket, _queue_len: u32) -> io::Result<()> {
    tracing::debug!("TCP_FASTOPEN not supported on this platform, ignoring");
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_defer_accept(socket: &Socket) -> io::Result<()> {
    // Seconds to wait for the first data segment.
    set_tcp_option(socket, libc::TCP_DEFER_ACCEPT, 1)
}

#[cfg(not(target_os = "linux"))]
fn set_defer_accept(_socket: &Socket) -> io::Result<()> {
    tracing::debug!("TCP_DEFER_ACCEPT not supported on this platform, ignoring");
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_tcp_option(socket: &Socket, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    // SAFETY: the fd is owned by `socket` for the duration of the call and
    // `value` outlives it; the length matches the pointed-to type.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A connection accepted but not yet handed to a handler.
#[derive(Debug)]
pub(crate) struct Accepted {
    pub stream: std::net::TcpStream,
    pub peer_addr: SocketAddr,
    /// Held for the connection's lifetime when a limit is configured.
    pub permit: Option<OwnedSemaphorePermit>,
}

/// One accept loop over a clone of the listening socket.
pub(crate) struct AcceptLoop {
    pub id: usize,
    pub listener: std::net::TcpListener,
    pub dispatcher: Dispatcher,
    pub stop: watch::Receiver<bool>,
    pub connection_limit: Option<Arc<Semaphore>>,
}

impl AcceptLoop {
    /// Accept until stopped. Must run inside a tokio runtime.
    pub async fn run(self) {
        let AcceptLoop {
            id,
            listener,
            mut dispatcher,
            mut stop,
            connection_limit,
        } = self;

        let listener = match TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(accept_loop = id, error = %e, "Failed to register listener");
                return;
            }
        };

        tracing::debug!(accept_loop = id, "Accept loop started");

        loop {
            // Acquire permit first (backpressure)
            let permit = match &connection_limit {
                Some(limit) => tokio::select! {
                    biased;
                    _ = stopped(&mut stop) => break,
                    permit = Arc::clone(limit).acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                },
                None => None,
            };

            let accepted = tokio::select! {
                biased;
                _ = stopped(&mut stop) => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    tracing::debug!(accept_loop = id, peer_addr = %peer_addr, "Connection accepted");
                    let stream = match stream.into_std() {
                        Ok(stream) => stream,
                        Err(e) => {
                            tracing::warn!(peer_addr = %peer_addr, error = %e, "Failed to detach accepted stream");
                            continue;
                        }
                    };
                    let accepted = Accepted {
                        stream,
                        peer_addr,
                        permit,
                    };
                    // A full shard queue must not hold the loop past stop.
                    tokio::select! {
                        biased;
                        _ = stopped(&mut stop) => {
                            tracing::debug!(accept_loop = id, peer_addr = %peer_addr, "Stopped while dispatching, dropping connection");
                            break;
                        }
                        _ = dispatcher.dispatch(accepted) => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(accept_loop = id, error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        tracing::debug!(accept_loop = id, "Accept loop stopped");
    }

    /// Run this loop on a dedicated OS thread with its own runtime.
    ///
    /// The returned receiver resolves once the thread has finished.
    pub fn spawn_pinned(self) -> Result<oneshot::Receiver<()>, EngineError> {
        let (done_tx, done_rx) = oneshot::channel();
        let id = self.id;

        std::thread::Builder::new()
            .name(format!("accept-loop-{}", id))
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime.block_on(self.run()),
                    Err(e) => {
                        tracing::error!(accept_loop = id, error = %e, "Failed to build accept loop runtime")
                    }
                }
                let _ = done_tx.send(());
            })
            .map_err(EngineError::Spawn)?;

        Ok(done_rx)
    }
}
