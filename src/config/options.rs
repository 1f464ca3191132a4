//! Named server options.
//!
//! # Responsibilities
//! - One variant per tunable knob of the listener
//! - Eager validation of each value, independent of other options
//! - Store validated values in a draft, later frozen by the builder
//!
//! # Design Decisions
//! - Integer inputs are signed so negative values can be rejected explicitly
//! - A later option overwrites an earlier one for the same field
//! - `""` and `"localhost"` are sugar for the default loopback host

use std::net::{AddrParseError, IpAddr, Ipv4Addr};
use std::num::NonZeroUsize;

use thiserror::Error;

use crate::net::connection::RequestHandler;

/// Host used when none is configured.
pub const fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

/// Errors raised while applying an option.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Host text is not an IP literal.
    #[error("invalid host {host:?}: {source}")]
    InvalidHost {
        host: String,
        #[source]
        source: AddrParseError,
    },

    #[error("port cannot be less than zero (got {0})")]
    NegativePort(i64),

    #[error("queue length cannot be less than zero (got {0})")]
    NegativeQueueLen(i64),

    #[error("ballast cannot be less than or equal to zero (got {0})")]
    NonPositiveBallast(i64),

    /// A count that must be strictly positive (loops, shards, connection limit).
    #[error("{field} must be greater than zero (got {value})")]
    NonPositive { field: &'static str, value: i64 },

    /// Value does not fit the platform integer type backing the field.
    #[error("{field} value {value} is out of range")]
    OutOfRange { field: &'static str, value: i64 },
}

/// A single configuration mutation.
///
/// Build these with the `with_*` constructors and hand them, in order, to
/// [`ConfigBuilder`](super::builder::ConfigBuilder) or
/// [`Server::new`](crate::lifecycle::server::Server::new).
#[derive(Debug, Clone)]
pub enum ServerOption {
    Host(String),
    Port(i64),
    SocketReusePort(bool),
    SocketFastOpen(bool),
    SocketFastOpenQueueLen(i64),
    SocketDeferAccept(bool),
    Loops(i64),
    WorkerpoolShards(i64),
    AllowThreadLocking(bool),
    Ballast(i64),
    MaxAcceptConnections(i64),
    RequestHandler(RequestHandler),
}

/// Listen host. Defaults to 127.0.0.1.
pub fn with_host(host: impl Into<String>) -> ServerOption {
    ServerOption::Host(host.into())
}

/// Listen port. `0` picks any available port.
pub fn with_port(port: i64) -> ServerOption {
    ServerOption::Port(port)
}

/// Enable/disable SO_REUSEPORT.
pub fn with_socket_reuse_port(enable: bool) -> ServerOption {
    ServerOption::SocketReusePort(enable)
}

/// Enable/disable TCP_FASTOPEN (Linux only; ignored elsewhere).
pub fn with_socket_fast_open(enable: bool) -> ServerOption {
    ServerOption::SocketFastOpen(enable)
}

/// Queue length for TCP_FASTOPEN (default 256).
pub fn with_socket_fast_open_queue_len(len: i64) -> ServerOption {
    ServerOption::SocketFastOpenQueueLen(len)
}

/// Enable/disable TCP_DEFER_ACCEPT (Linux only; ignored elsewhere).
pub fn with_socket_defer_accept(enable: bool) -> ServerOption {
    ServerOption::SocketDeferAccept(enable)
}

/// Number of accept loops. Defaults to 4, which covers most workloads.
pub fn with_loops(loops: i64) -> ServerOption {
    ServerOption::Loops(loops)
}

/// Number of worker pool shards. Defaults to twice the available parallelism.
pub fn with_workerpool_shards(shards: i64) -> ServerOption {
    ServerOption::WorkerpoolShards(shards)
}

/// Whether accept loops may be pinned to dedicated OS threads.
pub fn with_allow_thread_locking(enable: bool) -> ServerOption {
    ServerOption::AllowThreadLocking(enable)
}

/// Size in MiB of a memory block reserved for the lifetime of the engine.
pub fn with_ballast(size_mib: i64) -> ServerOption {
    ServerOption::Ballast(size_mib)
}

/// Upper bound on concurrently served connections.
pub fn with_max_accept_connections(max: i64) -> ServerOption {
    ServerOption::MaxAcceptConnections(max)
}

/// Callback invoked once per accepted connection.
pub fn with_request_handler(handler: RequestHandler) -> ServerOption {
    ServerOption::RequestHandler(handler)
}

/// Partially built configuration. Every field starts unset.
#[derive(Debug, Clone, Default)]
pub struct Draft {
    pub(crate) host: Option<IpAddr>,
    pub(crate) port: Option<u64>,
    pub(crate) socket_reuse_port: Option<bool>,
    pub(crate) socket_fast_open: Option<bool>,
    pub(crate) socket_fast_open_queue_len: Option<u32>,
    pub(crate) socket_defer_accept: Option<bool>,
    pub(crate) loops: Option<NonZeroUsize>,
    pub(crate) workerpool_shards: Option<NonZeroUsize>,
    pub(crate) allow_thread_locking: Option<bool>,
    pub(crate) ballast_mib: Option<NonZeroUsize>,
    pub(crate) max_accept_connections: Option<NonZeroUsize>,
    pub(crate) handler: Option<RequestHandler>,
}

impl ServerOption {
    /// Validate this option and write it into the draft.
    ///
    /// On error the draft is left untouched.
    pub fn apply(self, draft: &mut Draft) -> Result<(), ConfigError> {
        match self {
            ServerOption::Host(host) => draft.host = Some(parse_host(&host)?),
            ServerOption::Port(port) => {
                if port < 0 {
                    return Err(ConfigError::NegativePort(port));
                }
                draft.port = Some(port as u64);
            }
            ServerOption::SocketReusePort(v) => draft.socket_reuse_port = Some(v),
            ServerOption::SocketFastOpen(v) => draft.socket_fast_open = Some(v),
            ServerOption::SocketFastOpenQueueLen(len) => {
                if len < 0 {
                    return Err(ConfigError::NegativeQueueLen(len));
                }
                let len = u32::try_from(len).map_err(|_| ConfigError::OutOfRange {
                    field: "socket fast open queue length",
                    value: len,
                })?;
                draft.socket_fast_open_queue_len = Some(len);
            }
            ServerOption::SocketDeferAccept(v) => draft.socket_defer_accept = Some(v),
            ServerOption::Loops(v) => draft.loops = Some(positive("loops", v)?),
            ServerOption::WorkerpoolShards(v) => {
                draft.workerpool_shards = Some(positive("workerpool shards", v)?)
            }
            ServerOption::AllowThreadLocking(v) => draft.allow_thread_locking = Some(v),
            ServerOption::Ballast(size) => {
                if size <= 0 {
                    return Err(ConfigError::NonPositiveBallast(size));
                }
                draft.ballast_mib = Some(count("ballast", size)?);
            }
            ServerOption::MaxAcceptConnections(v) => {
                draft.max_accept_connections = Some(positive("max accept connections", v)?)
            }
            ServerOption::RequestHandler(handler) => draft.handler = Some(handler),
        }
        Ok(())
    }
}

fn parse_host(host: &str) -> Result<IpAddr, ConfigError> {
    if host.is_empty() || host == "localhost" {
        return Ok(default_host());
    }
    host.parse().map_err(|source| ConfigError::InvalidHost {
        host: host.to_string(),
        source,
    })
}

fn positive(field: &'static str, value: i64) -> Result<NonZeroUsize, ConfigError> {
    if value <= 0 {
        return Err(ConfigError::NonPositive { field, value });
    }
    count(field, value)
}

/// Convert an already sign-checked value.
fn count(field: &'static str, value: i64) -> Result<NonZeroUsize, ConfigError> {
    usize::try_from(value)
        .ok()
        .and_then(NonZeroUsize::new)
        .ok_or(ConfigError::OutOfRange { field, value })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(option: ServerOption) -> Result<Draft, ConfigError> {
        let mut draft = Draft::default();
        option.apply(&mut draft)?;
        Ok(draft)
    }

    #[test]
    fn localhost_and_empty_host_map_to_loopback() {
        for host in ["", "localhost"] {
            let draft = apply(with_host(host)).unwrap();
            assert_eq!(draft.host, Some(default_host()));
        }
    }

    #[test]
    fn ip_literals_are_accepted() {
        let draft = apply(with_host("0.0.0.0")).unwrap();
        assert_eq!(draft.host, Some("0.0.0.0".parse().unwrap()));

        let draft = apply(with_host("::1")).unwrap();
        assert_eq!(draft.host, Some("::1".parse().unwrap()));
    }

    #[test]
    fn hostnames_are_rejected() {
        let err = apply(with_host("example.com")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidHost { ref host, .. } if host == "example.com"));
    }

    #[test]
    fn negative_port_is_rejected() {
        assert!(matches!(apply(with_port(-1)), Err(ConfigError::NegativePort(-1))));
        assert_eq!(apply(with_port(0)).unwrap().port, Some(0));
    }

    #[test]
    fn negative_queue_len_is_rejected() {
        assert!(matches!(
            apply(with_socket_fast_open_queue_len(-5)),
            Err(ConfigError::NegativeQueueLen(-5))
        ));
        assert_eq!(
            apply(with_socket_fast_open_queue_len(0)).unwrap().socket_fast_open_queue_len,
            Some(0)
        );
    }

    #[test]
    fn ballast_must_be_positive() {
        for size in [0, -1, i64::MIN] {
            assert!(matches!(
                apply(with_ballast(size)),
                Err(ConfigError::NonPositiveBallast(_))
            ));
        }
        assert_eq!(apply(with_ballast(64)).unwrap().ballast_mib.map(NonZeroUsize::get), Some(64));
    }

    #[test]
    fn counts_must_be_positive() {
        assert!(matches!(
            apply(with_loops(0)),
            Err(ConfigError::NonPositive { field: "loops", .. })
        ));
        assert!(matches!(
            apply(with_workerpool_shards(-2)),
            Err(ConfigError::NonPositive { .. })
        ));
        assert!(matches!(
            apply(with_max_accept_connections(0)),
            Err(ConfigError::NonPositive { .. })
        ));
    }

    #[test]
    fn failed_option_leaves_draft_untouched() {
        let mut draft = Draft::default();
        with_port(8080).apply(&mut draft).unwrap();
        assert!(with_port(-1).apply(&mut draft).is_err());
        assert_eq!(draft.port, Some(8080));
    }
}
