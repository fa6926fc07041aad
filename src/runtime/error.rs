//! Error types for the relay runtime.

use crate::runtime::Handle;
use std::collections::TryReserveError;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors returned by registry, broadcast and drain operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The handle does not belong to a live connection. Nothing was mutated.
    #[error("connection {0} is not registered")]
    NotFound(Handle),

    /// No room for another connection.
    #[error("connection limit of {limit} reached")]
    ConnectionLimit { limit: usize },

    /// A message copy or queue slot could not be allocated.
    #[error("failed to allocate {bytes} bytes for connection {handle}")]
    Allocation {
        handle: Handle,
        bytes: usize,
        #[source]
        source: TryReserveError,
    },
}

/// Fatal errors while setting up the listening side of the relay.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to create readiness poller: {0}")]
    Poll(#[source] io::Error),

    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Why the relay stopped abnormally.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error("relay loop failed: {0}")]
    Poll(#[source] io::Error),
}
