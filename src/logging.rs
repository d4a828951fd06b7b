//! Component-scoped diagnostics.
//!
//! Each component logs under its own source tag. Sources can be toggled at
//! runtime, and an optional sink receives `(source, message)` pairs instead
//! of the [`log`] facade when registered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use serde::Serialize;

/// The components that emit diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    /// The shared timer service
    Timer,
    /// The generic worker pool
    Pool,
    /// The URL dispatcher and its endpoint states
    Dispatcher,
}

impl LogSource {
    /// The stable source tag, also used as suffix of the `log` target
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            LogSource::Timer => "timer",
            LogSource::Pool => "pool",
            LogSource::Dispatcher => "dispatcher",
        }
    }

    const fn index(self) -> usize {
        match self {
            LogSource::Timer => 0,
            LogSource::Pool => 1,
            LogSource::Dispatcher => 2,
        }
    }

    const fn target(self) -> &'static str {
        match self {
            LogSource::Timer => "urlgate::timer",
            LogSource::Pool => "urlgate::pool",
            LogSource::Dispatcher => "urlgate::dispatcher",
        }
    }
}

static ENABLED: [AtomicBool; 3] = [
    AtomicBool::new(true),
    AtomicBool::new(true),
    AtomicBool::new(true),
];

/// A registered log sink receiving `(source, message)` pairs
pub type LogSink = dyn Fn(LogSource, &str) + Send + Sync;

static SINK: RwLock<Option<Box<LogSink>>> = RwLock::new(None);

/// Enable or disable diagnostics for one source at runtime
pub fn set_source_enabled(source: LogSource, enabled: bool) {
    ENABLED[source.index()].store(enabled, Ordering::Relaxed);
}

/// Whether diagnostics for the given source are currently enabled
#[must_use]
pub fn source_enabled(source: LogSource) -> bool {
    ENABLED[source.index()].load(Ordering::Relaxed)
}

/// Register a sink receiving all enabled diagnostics, replacing any
/// previously registered sink. Pass `None` to fall back to the [`log`]
/// facade.
pub fn register_sink(sink: Option<Box<LogSink>>) {
    *SINK.write().expect("log sink lock poisoned") = sink;
}

pub(crate) fn emit(source: LogSource, message: std::fmt::Arguments<'_>) {
    if !source_enabled(source) {
        return;
    }
    let guard = SINK.read().expect("log sink lock poisoned");
    match guard.as_ref() {
        Some(sink) => sink(source, &message.to_string()),
        None => log::debug!(target: source.target(), "{message}"),
    }
}

/// Log a diagnostic message under the given [`LogSource`](crate::LogSource),
/// honoring the runtime toggle and any registered sink
macro_rules! trace_src {
    ($source:expr, $($arg:tt)+) => {
        $crate::logging::emit($source, format_args!($($arg)+))
    };
}

pub(crate) use trace_src;
