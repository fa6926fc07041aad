//! Interrupt handling.
//!
//! The relay loop is plain mio and never touches tokio. A small named thread
//! runs a current-thread tokio runtime just to await ctrl-c and fire the
//! shutdown token, which also wakes the loop out of its readiness wait.

use crate::runtime::Shutdown;
use std::future::Future;
use std::io;
use std::thread;
use tracing::{error, info};

/// Spawn the interrupt watcher for `shutdown`.
pub fn spawn_watcher(shutdown: Shutdown) -> io::Result<thread::JoinHandle<()>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    thread::Builder::new()
        .name("signal".to_string())
        .spawn(move || runtime.block_on(forward(tokio::signal::ctrl_c(), shutdown)))
}

/// Wait for `signal`, then trigger `shutdown`.
///
/// If the signal cannot be awaited the token is left alone; the relay keeps
/// running and has to be stopped some other way.
pub async fn forward<F>(signal: F, shutdown: Shutdown)
where
    F: Future<Output = io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("Interrupt received, shutting down");
            shutdown.trigger();
        }
        Err(e) => error!(error = %e, "Failed to listen for interrupt signal"),
    }
}
