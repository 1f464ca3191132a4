//! OS signal handling.
//!
//! # Responsibilities
//! - Register handlers for SIGINT, SIGTERM, SIGHUP, SIGQUIT and SIGABRT
//! - Translate them into a [`StopSignal`]
//! - Deliver exactly one of them to whoever awaits the listener
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - Single-slot channel: a signal arriving while one is pending is absorbed
//! - `recv` consumes the listener, so a stop can only be awaited once
//! - Programmatic stops go through the same channel via [`SignalTrigger`]

use std::fmt;
use std::io;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Termination signals that trigger a graceful stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopSignal {
    Interrupt,
    Terminate,
    Hangup,
    Quit,
    Abort,
}

impl StopSignal {
    pub const ALL: [StopSignal; 5] = [
        StopSignal::Interrupt,
        StopSignal::Terminate,
        StopSignal::Hangup,
        StopSignal::Quit,
        StopSignal::Abort,
    ];

    /// Conventional name, e.g. `SIGTERM`.
    pub fn name(self) -> &'static str {
        match self {
            StopSignal::Interrupt => "SIGINT",
            StopSignal::Terminate => "SIGTERM",
            StopSignal::Hangup => "SIGHUP",
            StopSignal::Quit => "SIGQUIT",
            StopSignal::Abort => "SIGABRT",
        }
    }

    /// Platform signal number.
    #[cfg(unix)]
    pub fn as_raw(self) -> i32 {
        match self {
            StopSignal::Interrupt => libc::SIGINT,
            StopSignal::Terminate => libc::SIGTERM,
            StopSignal::Hangup => libc::SIGHUP,
            StopSignal::Quit => libc::SIGQUIT,
            StopSignal::Abort => libc::SIGABRT,
        }
    }
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Sends stop signals into a [`SignalListener`] without involving the OS.
#[derive(Debug, Clone)]
pub struct SignalTrigger {
    tx: mpsc::Sender<StopSignal>,
}

impl SignalTrigger {
    /// Returns false if a signal is already pending or the listener is gone.
    pub fn trigger(&self, signal: StopSignal) -> bool {
        self.tx.try_send(signal).is_ok()
    }
}

/// Single-slot receiver of stop signals.
#[derive(Debug)]
pub struct SignalListener {
    rx: mpsc::Receiver<StopSignal>,
    tx: mpsc::Sender<StopSignal>,
    forwarder: Option<JoinHandle<()>>,
}

impl SignalListener {
    /// A listener fed only through [`SignalTrigger`]s.
    pub fn manual() -> (Self, SignalTrigger) {
        let (tx, rx) = mpsc::channel(1);
        let trigger = SignalTrigger { tx: tx.clone() };
        (
            Self {
                rx,
                tx,
                forwarder: None,
            },
            trigger,
        )
    }

    /// Register the OS handlers and forward their deliveries.
    ///
    /// Handlers are installed before this returns, so a signal raised right
    /// after is not lost. Must be called inside a tokio runtime.
    #[cfg(unix)]
    pub fn os() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut hangup = signal(SignalKind::hangup())?;
        let mut quit = signal(SignalKind::quit())?;
        let mut abort = signal(SignalKind::from_raw(libc::SIGABRT))?;

        let (mut listener, trigger) = Self::manual();
        listener.forwarder = Some(tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    Some(()) = interrupt.recv() => StopSignal::Interrupt,
                    Some(()) = terminate.recv() => StopSignal::Terminate,
                    Some(()) = hangup.recv() => StopSignal::Hangup,
                    Some(()) = quit.recv() => StopSignal::Quit,
                    Some(()) = abort.recv() => StopSignal::Abort,
                    else => break,
                };
                if trigger.trigger(received) {
                    tracing::debug!(signal = %received, "Stop signal received");
                } else {
                    tracing::warn!(signal = %received, "Stop already in progress, ignoring signal");
                }
            }
        }));

        tracing::debug!("Signal handlers registered");
        Ok(listener)
    }

    /// Ctrl-C is the only termination notification available here.
    #[cfg(not(unix))]
    pub fn os() -> io::Result<Self> {
        let (mut listener, trigger) = Self::manual();
        listener.forwarder = Some(tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if !trigger.trigger(StopSignal::Interrupt) {
                    tracing::warn!("Stop already in progress, ignoring signal");
                }
            }
        }));
        Ok(listener)
    }

    /// Another handle feeding this listener.
    pub fn trigger(&self) -> SignalTrigger {
        SignalTrigger {
            tx: self.tx.clone(),
        }
    }

    /// Wait for the first stop signal.
    pub async fn recv(mut self) -> StopSignal {
        match self.rx.recv().await {
            Some(signal) => signal,
            // we hold a sender, so the channel never closes
            None => std::future::pending().await,
        }
    }
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}
