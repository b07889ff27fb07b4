//! Logging setup.

use crate::runtime::constants::filenames;
use crate::runtime::layout::FilesystemLayout;
use flotilla_shared::errors::{FlotillaError, FlotillaResult};
use std::sync::OnceLock;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Keeps the background log writer alive for the life of the process.
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize tracing with file logging.
///
/// Logs go to `{home}/logs/flotilla.log`. With `console` set, the same
/// events are also written to stderr. `RUST_LOG` overrides the default
/// `info` filter. Only the first call in a process installs a subscriber.
pub fn init_logging_for(layout: &FilesystemLayout, console: bool) -> FlotillaResult<()> {
    if LOG_GUARD.get().is_some() {
        return Ok(());
    }

    let logs_dir = layout.logs_dir();
    std::fs::create_dir_all(&logs_dir).map_err(|e| {
        FlotillaError::Storage(format!(
            "failed to create logs directory {}: {}",
            logs_dir.display(),
            e
        ))
    })?;

    let file_appender = tracing_appender::rolling::never(&logs_dir, filenames::LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    register_to_tracing(non_blocking, env_filter(), console);
    let _ = LOG_GUARD.set(guard);

    Ok(())
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

pub fn register_to_tracing(non_blocking: NonBlocking, env_filter: EnvFilter, console: bool) {
    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(false);

    let console_layer = console.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
    });

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_creates_log_dir_and_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let layout = FilesystemLayout::new(temp.path().to_path_buf());

        init_logging_for(&layout, false).unwrap();
        init_logging_for(&layout, false).unwrap();

        assert!(layout.logs_dir().is_dir());
    }
}
