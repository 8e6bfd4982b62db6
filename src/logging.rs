//! Structured logging facade. Everything in the crate logs through `slog`;
//! endpoints accept an optional `Logger` and fall back to discarding.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};
pub use sloggers::types::Severity;

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::Build;

/// Builds a terminal logger writing to stderr at the given severity, for
/// applications that do not bring their own drain. Falls back to a discarding
/// logger if the terminal drain cannot be constructed.
pub fn term_logger(level: Severity) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(level);
    builder.destination(Destination::Stderr);

    builder
        .build()
        .unwrap_or_else(|_| Logger::root(Discard, o!()))
}
