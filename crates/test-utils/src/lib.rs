//! Shared helpers for pipedag's unit and integration tests: tracing setup,
//! node and pipeline builders, and a recording worker pool.

pub mod builders;
pub mod fake_pool;

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use tracing_subscriber::{fmt, EnvFilter};

static TRACING: Once = Once::new();

/// Install a per-test tracing subscriber, once per process.
///
/// Output goes through `with_test_writer()`, so the harness only shows it
/// for failing tests (or under `-- --nocapture`). Levels come from
/// `PIPEDAG_LOG`, defaulting to `info`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter =
            EnvFilter::try_from_env("PIPEDAG_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

/// Bound an async test body so a hung pipeline fails instead of stalling.
pub async fn with_timeout<F, T>(future: F) -> T
where
    F: Future<Output = T>,
{
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("test timed out after 5 seconds")
}
