//! TCP echo listener (v1)
//!
//! Runs the lifecycle end to end: options from an optional TOML file, then
//! command-line overrides, an echo handler, and a graceful stop on
//! SIGINT/SIGTERM/SIGHUP/SIGQUIT/SIGABRT.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use tcp_lifecycle::config::loader::load_settings;
use tcp_lifecycle::config::{self, ServerSettings};
use tcp_lifecycle::net::{handler_fn, Connection};
use tcp_lifecycle::observability::logging;
use tcp_lifecycle::Server;

#[derive(Parser)]
#[command(name = "tcp-lifecycle")]
#[command(about = "TCP echo listener with graceful shutdown", long_about = None)]
struct Cli {
    /// TOML settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen host (IP literal or "localhost")
    #[arg(long)]
    host: Option<String>,

    /// Listen port; 0 picks any free port
    #[arg(short, long, allow_negative_numbers = true)]
    port: Option<i64>,

    /// Number of accept loops
    #[arg(long)]
    loops: Option<i64>,

    /// Number of worker pool shards
    #[arg(long)]
    shards: Option<i64>,

    /// Pin accept loops to dedicated threads
    #[arg(long)]
    thread_locking: bool,

    /// Memory ballast in MiB
    #[arg(long)]
    ballast: Option<i64>,

    /// Enable SO_REUSEPORT
    #[arg(long)]
    reuse_port: bool,

    /// Maximum concurrently served connections
    #[arg(long)]
    max_connections: Option<i64>,

    /// Drain deadline in seconds (overrides the settings file)
    #[arg(long)]
    shutdown_timeout: Option<u64>,
}

impl Cli {
    /// Overrides applied after the settings file, so they win.
    fn overrides(&self) -> Vec<config::ServerOption> {
        let mut opts = Vec::new();
        if let Some(host) = &self.host {
            opts.push(config::with_host(host.clone()));
        }
        if let Some(port) = self.port {
            opts.push(config::with_port(port));
        }
        if let Some(loops) = self.loops {
            opts.push(config::with_loops(loops));
        }
        if let Some(shards) = self.shards {
            opts.push(config::with_workerpool_shards(shards));
        }
        if self.thread_locking {
            opts.push(config::with_allow_thread_locking(true));
        }
        if let Some(size) = self.ballast {
            opts.push(config::with_ballast(size));
        }
        if self.reuse_port {
            opts.push(config::with_socket_reuse_port(true));
        }
        if let Some(max) = self.max_connections {
            opts.push(config::with_max_accept_connections(max));
        }
        opts
    }
}

async fn echo(mut conn: Connection) {
    let peer = conn.peer_addr();
    let id = conn.id();
    let mut buf = vec![0u8; 4096];

    loop {
        match conn.stream().read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = conn.stream().write_all(&buf[..n]).await {
                    tracing::debug!(connection_id = %id, peer_addr = %peer, error = %e, "Write failed");
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(connection_id = %id, peer_addr = %peer, error = %e, "Read failed");
                break;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => load_settings(path)?,
        None => ServerSettings::default(),
    };

    logging::init(&settings.observability.log_level);
    tracing::info!("tcp-lifecycle v{} starting", env!("CARGO_PKG_VERSION"));

    let stop_timeout = cli
        .shutdown_timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| settings.shutdown.timeout());

    let mut options = settings.to_options();
    options.extend(cli.overrides());
    options.push(config::with_request_handler(handler_fn(echo)));

    let server = Server::new(options)?;
    let local_addr = server.start().await?;

    tracing::info!(
        address = %local_addr,
        loops = server.config().loops().get(),
        shards = server.config().workerpool_shards().get(),
        stop_timeout_secs = stop_timeout.as_secs(),
        "Listening for connections"
    );

    let outcome = server.await_stop_signal(stop_timeout).await?;
    match outcome.result {
        Ok(()) => {
            tracing::info!(signal = %outcome.signal, "Shutdown complete");
            Ok(())
        }
        Err(e) => {
            tracing::error!(signal = %outcome.signal, error = %e, "Shutdown did not complete cleanly");
            Err(e.into())
        }
    }
}
