//! Unix socket transport for CSI messages.
//!
//! This module provides [`CsiClient`] and [`CsiServer`] that exchange
//! JSON-encoded [`CsiMessage`](crate::message::CsiMessage) values, one request
//! and one response per connection.  The client half-closes its write side to
//! mark the end of a request.

use std::path::PathBuf;

use crate::error::CcmError;

pub mod client;
pub mod server;

pub use client::CsiClient;
pub use server::CsiServer;

/// Upper bound on a single encoded message.
pub const MAX_MESSAGE_SIZE: u64 = 16 * 1024 * 1024;

const UNIX_SCHEME: &str = "unix://";

/// Extract the socket path from a `unix://` endpoint.
pub fn parse_endpoint(endpoint: &str) -> Result<PathBuf, CcmError> {
    let Some(path) = endpoint.strip_prefix(UNIX_SCHEME) else {
        return Err(CcmError::InvalidArgument(format!(
            "unsupported endpoint {endpoint:?}: only {UNIX_SCHEME} is supported"
        )));
    };
    if path.is_empty() {
        return Err(CcmError::InvalidArgument(format!(
            "endpoint {endpoint:?} has no socket path"
        )));
    }
    Ok(PathBuf::from(path))
}
