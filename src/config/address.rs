//! Listen address resolution.
//!
//! Synthesizes `host:port` from the configuration and checks that it parses
//! as a TCP socket address. No socket is touched here.

use std::net::{AddrParseError, IpAddr, SocketAddr};

use thiserror::Error;

/// The synthesized address did not parse.
#[derive(Debug, Error)]
#[error("invalid tcp address {address:?}: {source}")]
pub struct AddressError {
    pub address: String,
    #[source]
    pub source: AddrParseError,
}

/// Format `host:port`, bracketing IPv6 hosts.
pub fn format_address(host: IpAddr, port: u64) -> String {
    match host {
        IpAddr::V4(v4) => format!("{}:{}", v4, port),
        IpAddr::V6(v6) => format!("[{}]:{}", v6, port),
    }
}

/// Validate the listen address before anything is bound.
pub fn resolve_address(host: IpAddr, port: u64) -> Result<SocketAddr, AddressError> {
    let address = format_address(host, port);
    address
        .parse()
        .map_err(|source| AddressError { address, source })
}
