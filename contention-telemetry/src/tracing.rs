//! Tracing subscriber initialization.
//!
//! Binaries call [`init_tracing`] once at startup and keep the returned [`LogFlusher`] alive
//! until exit. Tests call [`init_test_tracing`], which only installs a subscriber when the
//! `ENABLE_TRACING` environment variable is set.

use std::io;
use std::sync::Once;

use contention_config::Environment;
use thiserror::Error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt};

/// Environment variable that turns on log output in tests.
const ENABLE_TRACING_ENV_NAME: &str = "ENABLE_TRACING";

/// Filter used when `RUST_LOG` is not set.
const DEFAULT_LOG_FILTER: &str = "info";

/// Filter used in tests when `RUST_LOG` is not set.
const DEFAULT_TEST_LOG_FILTER: &str = "debug";

static INIT_TEST_TRACING: Once = Once::new();

/// Guard flushing buffered log lines when dropped.
///
/// Must be held until the process exits, otherwise trailing log lines are lost.
pub type LogFlusher = WorkerGuard;

/// Errors raised while installing the global subscriber.
#[derive(Debug, Error)]
pub enum TracingError {
    /// The runtime environment could not be determined.
    #[error("failed to determine the runtime environment: {0}")]
    Environment(#[from] io::Error),

    /// A global subscriber is already installed.
    #[error("failed to install the tracing subscriber: {0}")]
    Init(#[from] TryInitError),
}

/// Installs the global tracing subscriber for a binary.
///
/// Output goes to stdout through a non-blocking writer. In [`Environment::Dev`] lines are
/// rendered human readable, in [`Environment::Prod`] as JSON objects. The filter is read
/// from `RUST_LOG` and defaults to `info`.
pub fn init_tracing(app_name: &str) -> Result<LogFlusher, TracingError> {
    let environment = Environment::load()?;
    let (writer, flusher) = tracing_appender::non_blocking(io::stdout());

    let registry = tracing_subscriber::registry().with(env_filter(DEFAULT_LOG_FILTER));
    match environment {
        Environment::Dev => registry
            .with(fmt::layer().with_target(false).with_writer(writer))
            .try_init()?,
        Environment::Prod => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_writer(writer),
            )
            .try_init()?,
    }

    info!(app = app_name, environment = %environment, "tracing initialized");

    Ok(flusher)
}

/// Installs a test subscriber once per process when `ENABLE_TRACING` is set.
pub fn init_test_tracing() {
    if std::env::var_os(ENABLE_TRACING_ENV_NAME).is_none() {
        return;
    }

    INIT_TEST_TRACING.call_once(|| {
        // Another test harness may already own the global subscriber.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter(DEFAULT_TEST_LOG_FILTER))
            .with_test_writer()
            .try_init();
    });
}

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}
