//! shout-relay: a TCP broadcast relay.
//!
//! Every chunk of bytes a peer sends is uppercased (ASCII letters only) and
//! delivered to every other connected peer. One thread, one mio poll, no
//! framing.
//!
//! Usage: `shout-relay <PORT> [--config FILE] [--log-level LEVEL]`
//!
//! Exit status is 0 after an interrupt-driven shutdown and 1 on usage or
//! setup errors.

mod config;
mod runtime;
mod signal;

use config::{Config, ConfigError};
use runtime::Shutdown;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(ConfigError::Usage(e)) if !e.use_stderr() => {
            // --help and --version
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(ConfigError::Usage(e)) => {
            let _ = e.print();
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        max_connections = config.max_connections,
        buffer_size = config.buffer_size,
        write_error_policy = ?config.write_error_policy,
        "Starting shout-relay"
    );

    let shutdown = Shutdown::new();
    if let Err(e) = signal::spawn_watcher(shutdown.clone()) {
        error!(error = %e, "Failed to install interrupt handler");
        return ExitCode::FAILURE;
    }

    match runtime::run(&config, shutdown) {
        Ok(()) => {
            info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Relay failed");
            ExitCode::FAILURE
        }
    }
}
