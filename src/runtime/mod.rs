//! Relay runtime: a single-threaded connection multiplexer.
//!
//! Building blocks, leaves first:
//! - `OutboundQueue`: per-connection queue of `PendingMessage`s
//! - `ConnectionRegistry`: live connections plus read/write interest sets
//! - broadcast: uppercase fan-out into every other connection's queue
//! - drain: flush a queue into its stream, resuming after short writes
//! - `Multiplexer`: the mio loop that drives all of the above
//!
//! Everything runs on the caller's thread. The only blocking point is the
//! readiness wait inside `Multiplexer::run`.

mod broadcast;
mod connection;
mod drain;
mod error;
mod mio_impl;
mod queue;
mod shutdown;

pub use connection::{ConnectionRegistry, Handle};
pub use drain::DrainOutcome;
pub use error::{RegistryError, RunError, SetupError};
pub use mio_impl::Multiplexer;
pub use shutdown::Shutdown;

use crate::config::Config;

/// Bind the relay and run it until `shutdown` fires.
///
/// Setup failures are returned before any peer is accepted; errors from the
/// running loop are fatal I/O errors of the readiness wait itself.
pub fn run(config: &Config, shutdown: Shutdown) -> Result<(), RunError> {
    let relay = Multiplexer::bind(config, shutdown)?;
    relay.run().map_err(RunError::Poll)
}

