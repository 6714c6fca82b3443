// src/logging.rs

//! Logging setup for `pipedag` using `tracing` + `tracing-subscriber`.
//!
//! The log level is taken from the `PIPEDAG_LOG` environment variable
//! (e.g. "info", "debug", or any `EnvFilter` directive), defaulting to
//! `info`. Logs go to STDERR so that stdout stays free for tool output.

use tracing_subscriber::{EnvFilter, fmt};

/// Initialise the global logging subscriber.
///
/// Safe to call once at startup; embedding applications that install their
/// own subscriber should skip this.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env("PIPEDAG_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .init();
}
