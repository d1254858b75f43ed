use std::env;
use std::path::Path;

use anyhow::Context;
use file_rotate::{compression::Compression, suffix::AppendCount, ContentLimit, FileRotate};
use once_cell::sync::OnceCell;
use tracing::Dispatch;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const LOG_FILE_NAME: &str = "groombook.log";
const DEFAULT_FILTER: &str = "groombook=info,sqlx=warn";
const LOG_MAX_BYTES: usize = 5_000_000;
const LOG_MAX_FILES: usize = 5;

static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

#[cfg(unix)]
fn rotating_file(path: &Path) -> FileRotate<AppendCount> {
    FileRotate::new(
        path,
        AppendCount::new(LOG_MAX_FILES),
        ContentLimit::BytesSurpassed(LOG_MAX_BYTES),
        Compression::None,
        None,
    )
}

#[cfg(not(unix))]
fn rotating_file(path: &Path) -> FileRotate<AppendCount> {
    FileRotate::new(
        path,
        AppendCount::new(LOG_MAX_FILES),
        ContentLimit::BytesSurpassed(LOG_MAX_BYTES),
        Compression::None,
    )
}

/// Install the process-wide subscriber: JSON lines on stderr and, when a logs
/// directory is provided, a size-rotated JSON file sink.
///
/// Safe to call more than once; later calls leave the first subscriber in place.
pub fn init_logging(logs_dir: Option<&Path>) -> anyhow::Result<()> {
    let _ = tracing_log::LogTracer::init();

    let filter = EnvFilter::new(
        env::var("GROOMBOOK_LOG").unwrap_or_else(|_| DEFAULT_FILTER.to_string()),
    );

    let stderr_layer = fmt::layer()
        .json()
        .flatten_event(true)
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(std::io::stderr);

    let file_layer = match logs_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create logs directory {}", dir.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(rotating_file(&dir.join(LOG_FILE_NAME)));
            let _ = FILE_GUARD.set(guard);
            Some(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_ansi(false)
                    .with_target(true)
                    .with_timer(UtcTime::rfc_3339())
                    .with_writer(writer),
            )
        }
        None => None,
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    Ok(())
}

/// Observability handle handed to components that run on their own thread.
///
/// Captures the dispatcher active where it was created so work on another
/// thread reports to the same subscriber instead of whatever is global.
#[derive(Clone)]
pub struct Telemetry {
    dispatch: Dispatch,
}

impl Telemetry {
    /// Capture the dispatcher that is current on the calling thread.
    pub fn current() -> Self {
        Self {
            dispatch: tracing::dispatcher::get_default(Dispatch::clone),
        }
    }

    pub fn from_dispatch(dispatch: Dispatch) -> Self {
        Self { dispatch }
    }

    /// Run `f` with this handle's dispatcher installed as the thread default.
    pub fn in_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::current()
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct BufferWriter(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for BufferWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn telemetry_routes_events_from_another_thread() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let writer = buffer.clone();
        let subscriber = fmt()
            .with_env_filter(EnvFilter::new("groombook=debug"))
            .with_writer(move || BufferWriter(writer.clone()))
            .json()
            .finish();
        let telemetry = Telemetry::from_dispatch(Dispatch::new(subscriber));

        let worker = telemetry.clone();
        std::thread::spawn(move || {
            worker.in_scope(|| {
                tracing::info!(target: "groombook", event = "from_worker");
            });
        })
        .join()
        .unwrap();

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("from_worker"), "missing event in {logs}");
    }
}
