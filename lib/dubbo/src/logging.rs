//! Thin wrapper around slog so the rest of the crate can say
//! `logging::debug!(log, ...)` and components can accept an optional parent
//! logger, defaulting to the discard sink.

pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;
use sloggers::{Config, LoggerConfig};

/// A logger that drops everything; the default when a component is built
/// without a parent logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

/// A debug-level terminal logger writing to stderr.
pub fn terminal() -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(Severity::Debug);
    builder.destination(Destination::Stderr);
    builder.build().expect("terminal logger construction failed")
}

/// Builds a logger from a `sloggers::LoggerConfig` TOML document, e.g.
///
/// ```toml
/// type = "terminal"
/// level = "debug"
/// destination = "stderr"
/// ```
pub fn from_toml_str(toml: &str) -> Result<Logger, String> {
    let config: LoggerConfig = serdeconv::from_toml_str(toml).map_err(|e| e.to_string())?;
    config.build_logger().map_err(|e| e.to_string())
}

/// Resolves an optional parent logger into a child or the discard sink.
pub(crate) fn child<'a, L: Into<Option<&'a Logger>>>(log: L) -> Logger {
    match log.into() {
        Some(log) => log.new(o!()),
        None => discard(),
    }
}
