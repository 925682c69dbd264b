//! Tracing setup for embedding processes.
//!
//! Diagnostics go to stderr; `CU_STDERR_FILE` adds a secondary file sink so a
//! supervising tool server can keep a persistent log. The level comes from
//! `CU_LOG_LEVEL` (`debug|info|warn|error`, default `info`); `RUST_LOG` takes
//! precedence when set.

use std::fs::OpenOptions;
use std::sync::Arc;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Secondary log sink path.
pub const STDERR_FILE_ENV: &str = "CU_STDERR_FILE";
/// Log level selector.
pub const LOG_LEVEL_ENV: &str = "CU_LOG_LEVEL";

fn level_filter() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = match std::env::var(LOG_LEVEL_ENV).as_deref() {
        Ok("debug") | Ok("DEBUG") => "debug",
        Ok("warn") | Ok("WARN") | Ok("warning") | Ok("WARNING") => "warn",
        Ok("error") | Ok("ERROR") => "error",
        _ => "info",
    };
    EnvFilter::new(level)
}

/// Initialize the global subscriber. Safe to call more than once; later calls
/// are no-ops.
pub fn init() -> std::io::Result<()> {
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).compact();

    let file_layer = match std::env::var(STDERR_FILE_ENV) {
        Ok(path) if !path.is_empty() => {
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            Some(fmt::layer().with_writer(Arc::new(file)).with_ansi(false))
        }
        _ => None,
    };

    let _ = tracing_subscriber::registry()
        .with(level_filter())
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    Ok(())
}
