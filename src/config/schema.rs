//! Settings file schema.
//!
//! Mirrors every server option so a deployment can be described in TOML.
//! Fields left out of the file stay unset and fall back to engine defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::options::{self, ServerOption};
use crate::observability::logging;

/// Root of the settings file.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerSettings {
    /// Where to listen.
    pub listener: ListenerSettings,

    /// Listen-time socket flags.
    pub socket: SocketSettings,

    /// Engine tuning.
    pub engine: EngineSettings,

    /// Graceful shutdown.
    pub shutdown: ShutdownSettings,

    /// Log output.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ListenerSettings {
    /// IP literal, `""` or `"localhost"`.
    pub host: Option<String>,

    /// TCP port; 0 picks any free port.
    pub port: Option<i64>,

    /// Maximum concurrently served connections.
    pub max_accept_connections: Option<i64>,
}

/// Socket flags applied before listening.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct SocketSettings {
    pub reuse_port: Option<bool>,
    pub fast_open: Option<bool>,
    pub fast_open_queue_len: Option<i64>,
    pub defer_accept: Option<bool>,
}

/// Connection-processing engine tuning.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct EngineSettings {
    /// Number of accept loops.
    pub loops: Option<i64>,

    /// Number of worker pool shards.
    pub workerpool_shards: Option<i64>,

    /// Pin accept loops to dedicated threads.
    pub allow_thread_locking: Option<bool>,

    /// Memory ballast in MiB.
    pub ballast_mib: Option<i64>,
}

/// Shutdown configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownSettings {
    /// Drain deadline in seconds.
    pub timeout_secs: u64,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

impl ShutdownSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log filter used when `RUST_LOG` is not set.
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: logging::DEFAULT_DIRECTIVES.to_string(),
        }
    }
}

impl ServerSettings {
    /// Translate the file into server options, in declaration order.
    pub fn to_options(&self) -> Vec<ServerOption> {
        let mut opts = Vec::new();

        if let Some(host) = &self.listener.host {
            opts.push(options::with_host(host.clone()));
        }
        if let Some(port) = self.listener.port {
            opts.push(options::with_port(port));
        }
        if let Some(max) = self.listener.max_accept_connections {
            opts.push(options::with_max_accept_connections(max));
        }

        if let Some(v) = self.socket.reuse_port {
            opts.push(options::with_socket_reuse_port(v));
        }
        if let Some(v) = self.socket.fast_open {
            opts.push(options::with_socket_fast_open(v));
        }
        if let Some(len) = self.socket.fast_open_queue_len {
            opts.push(options::with_socket_fast_open_queue_len(len));
        }
        if let Some(v) = self.socket.defer_accept {
            opts.push(options::with_socket_defer_accept(v));
        }

        if let Some(loops) = self.engine.loops {
            opts.push(options::with_loops(loops));
        }
        if let Some(shards) = self.engine.workerpool_shards {
            opts.push(options::with_workerpool_shards(shards));
        }
        if let Some(v) = self.engine.allow_thread_locking {
            opts.push(options::with_allow_thread_locking(v));
        }
        if let Some(size) = self.engine.ballast_mib {
            opts.push(options::with_ballast(size));
        }

        opts
    }
}
