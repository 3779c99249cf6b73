//! Logging and tracing infrastructure for machokit.
//!
//! The library itself only emits `tracing` events; binaries and tests call
//! one of the `init_*` functions to install a subscriber. `RUST_LOG` takes
//! precedence over the level passed in.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Once;
use tracing::debug;
use tracing_subscriber::{
    fmt::{self as tfmt, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

static INIT: Once = Once::new();

/// Default verbosity when `RUST_LOG` is unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

fn env_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()))
}

/// Initialize the global tracing subscriber at `info`.
///
/// Subsequent calls are ignored.
pub fn init_tracing() {
    init_tracing_with_level(LogLevel::Info);
}

/// Initialize the global tracing subscriber with a default level.
pub fn init_tracing_with_level(level: LogLevel) {
    INIT.call_once(|| {
        let fmt_layer = tfmt::layer()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);

        // try_init: a test harness or host application may own the global subscriber.
        let _ = tracing_subscriber::registry()
            .with(env_filter(level))
            .with(fmt_layer)
            .try_init();

        debug!(%level, "machokit tracing initialized");
    });
}

/// Initialize tracing with JSON output for structured logging.
pub fn init_tracing_json(level: LogLevel) {
    INIT.call_once(|| {
        let fmt_layer = tfmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_current_span(true);

        let _ = tracing_subscriber::registry()
            .with(env_filter(level))
            .with(fmt_layer)
            .try_init();

        debug!(%level, "machokit tracing initialized (JSON mode)");
    });
}

/// Macro for creating spans around a unit of work
#[macro_export]
macro_rules! span_trace {
    ($name:expr) => {
        tracing::debug_span!($name)
    };
    ($name:expr, $($field:tt)*) => {
        tracing::debug_span!($name, $($field)*)
    };
}

/// Macro for logging and returning errors
#[macro_export]
macro_rules! log_error {
    ($err:expr) => {{
        let e = $err;
        tracing::error!(error = %e, "Operation failed");
        e
    }};
    ($err:expr, $msg:expr) => {{
        let e = $err;
        tracing::error!(error = %e, message = $msg, "Operation failed");
        e
    }};
}
