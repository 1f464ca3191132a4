//! Configuration builder.
//!
//! Folds an ordered sequence of [`ServerOption`]s into one immutable
//! [`ServerConfig`]. The first failing option aborts the build.

use std::net::IpAddr;
use std::num::NonZeroUsize;

use crate::config::options::{default_host, ConfigError, Draft, ServerOption};
use crate::net::connection::RequestHandler;
use crate::net::engine::{default_workerpool_shards, DEFAULT_LOOPS};
use crate::net::listener::{ListenConfig, DEFAULT_FAST_OPEN_QUEUE_LEN};

/// Accumulates options into a draft configuration.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    draft: Draft,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a single option. Later options win over earlier ones.
    pub fn apply(mut self, option: ServerOption) -> Result<Self, ConfigError> {
        option.apply(&mut self.draft)?;
        Ok(self)
    }

    /// Apply options in order, stopping at the first error.
    pub fn apply_all<I>(mut self, options: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = ServerOption>,
    {
        for option in options {
            tracing::trace!(?option, "Applying server option");
            option.apply(&mut self.draft)?;
        }
        Ok(self)
    }

    /// Freeze the draft.
    pub fn build(self) -> ServerConfig {
        ServerConfig { explicit: self.draft }
    }
}

/// Immutable server configuration.
///
/// Getters return the effective value, falling back to the engine default
/// when the caller made no choice. Which fields were set explicitly is kept
/// so only those are pushed onto the engine.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub(crate) explicit: Draft,
}

impl ServerConfig {
    /// Build a configuration straight from a list of options.
    pub fn from_options<I>(options: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = ServerOption>,
    {
        Ok(ConfigBuilder::new().apply_all(options)?.build())
    }

    pub fn host(&self) -> IpAddr {
        self.explicit.host.unwrap_or_else(default_host)
    }

    pub fn port(&self) -> u64 {
        self.explicit.port.unwrap_or(0)
    }

    pub fn socket_reuse_port(&self) -> bool {
        self.explicit.socket_reuse_port.unwrap_or(false)
    }

    pub fn socket_fast_open(&self) -> bool {
        self.explicit.socket_fast_open.unwrap_or(false)
    }

    pub fn socket_fast_open_queue_len(&self) -> u32 {
        self.explicit
            .socket_fast_open_queue_len
            .unwrap_or(DEFAULT_FAST_OPEN_QUEUE_LEN)
    }

    pub fn socket_defer_accept(&self) -> bool {
        self.explicit.socket_defer_accept.unwrap_or(false)
    }

    pub fn loops(&self) -> NonZeroUsize {
        self.explicit.loops.unwrap_or(DEFAULT_LOOPS)
    }

    pub fn workerpool_shards(&self) -> NonZeroUsize {
        self.explicit
            .workerpool_shards
            .unwrap_or_else(default_workerpool_shards)
    }

    pub fn allow_thread_locking(&self) -> bool {
        self.explicit.allow_thread_locking.unwrap_or(false)
    }

    /// Ballast size in MiB; `None` means no ballast.
    pub fn ballast_mib(&self) -> Option<NonZeroUsize> {
        self.explicit.ballast_mib
    }

    /// Connection cap; `None` means unbounded.
    pub fn max_accept_connections(&self) -> Option<NonZeroUsize> {
        self.explicit.max_accept_connections
    }

    pub fn handler(&self) -> Option<&RequestHandler> {
        self.explicit.handler.as_ref()
    }

    /// Listen-time socket flags with defaults applied.
    pub fn listen_config(&self) -> ListenConfig {
        ListenConfig {
            reuse_port: self.socket_reuse_port(),
            fast_open: self.socket_fast_open(),
            fast_open_queue_len: self.socket_fast_open_queue_len(),
            defer_accept: self.socket_defer_accept(),
            ..ListenConfig::default()
        }
    }
}
