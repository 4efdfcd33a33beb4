//! `tracing`-based logging setup for binaries built on packtree.

use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{PackTreeError, Result};

/// Installs a `tracing` subscriber filtered by `level` (e.g. `"info"`,
/// `"packtree=debug"`). Safe to call once per process; a second call
/// returns an error rather than panicking.
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|_| PackTreeError::Invalid("invalid log filter directive"))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| PackTreeError::Invalid("logging already initialized"))
}
