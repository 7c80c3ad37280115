//! Logging
//!
//! The runtime reports through `tracing`; nothing is printed unless a
//! subscriber is installed. [`init`] installs a `tracing-subscriber` fmt
//! subscriber filtered by `EFFEX_LOG` (an `EnvFilter` directive string,
//! default `info`).
//!
//! # Environment Variables
//!
//! - `EFFEX_LOG=<directives>` - e.g. `debug`, `effex_runtime=trace,info`
//! - `EFFEX_LOG_ANSI=0` - disable colored output
//!
//! # Targets
//!
//! - `effex::log` - messages from `Effect::log` / `Effect::log_at`
//! - `effex_runtime::*` - interpreter events (fiber lifecycle at `trace`,
//!   retry decisions and layer builds at `debug`, finalizer failures at `warn`)

use std::fmt::Write as _;
use std::sync::{Arc, Once};
use std::time::Instant;

use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::env::{env_get_bool, env_get_str};
use crate::id::FiberId;

static INIT_LOGGING: Once = Once::new();

/// Install the global subscriber from `EFFEX_LOG`
///
/// Safe to call multiple times; the first call wins. If another subscriber
/// is already installed this is a no-op.
pub fn init() {
    INIT_LOGGING.call_once(|| {
        let directives = env_get_str("EFFEX_LOG", "info");
        let filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(env_get_bool("EFFEX_LOG_ANSI", true))
            .with_thread_names(true)
            .try_init();
    });
}

/// Install a subscriber that writes through the test harness capture
pub fn init_test() {
    INIT_LOGGING.call_once(|| {
        let directives = env_get_str("EFFEX_LOG", "debug");
        let filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_ansi(false)
            .try_init();
    });
}

/// An open log span: a label and the instant it was entered
#[derive(Debug, Clone)]
pub struct LogSpan {
    label: Arc<str>,
    started: Instant,
}

impl LogSpan {
    /// Enter a span now
    pub fn enter(label: Arc<str>) -> Self {
        Self {
            label,
            started: Instant::now(),
        }
    }

    /// Span label
    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Render spans innermost-last as `outer=12ms inner=3ms`
pub fn render_spans(spans: &[LogSpan], now: Instant) -> String {
    let mut out = String::new();
    for (i, span) in spans.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let elapsed = now.saturating_duration_since(span.started);
        let _ = write!(out, "{}={}ms", span.label, elapsed.as_millis());
    }
    out
}

/// Emit a user log message for a fiber
pub fn emit(level: Level, fiber: FiberId, spans: &[LogSpan], message: &str) {
    let spans = render_spans(spans, Instant::now());
    let fiber = fiber.as_u64();
    match level {
        Level::ERROR => tracing::error!(target: "effex::log", fiber, spans = %spans, "{}", message),
        Level::WARN => tracing::warn!(target: "effex::log", fiber, spans = %spans, "{}", message),
        Level::INFO => tracing::info!(target: "effex::log", fiber, spans = %spans, "{}", message),
        Level::DEBUG => tracing::debug!(target: "effex::log", fiber, spans = %spans, "{}", message),
        Level::TRACE => tracing::trace!(target: "effex::log", fiber, spans = %spans, "{}", message),
    }
}
