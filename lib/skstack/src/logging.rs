//! Thin wrapper around `slog` so the rest of the workspace can say
//! `logging::debug!(...)` without caring about drain construction.

pub use slog::{crit, debug, error, info, o, trace, warn};
pub use slog::{Discard, Drain, Level, Logger};

use sloggers::{Build, Config, LoggerConfig};

/// Logger that swallows everything. Default for components constructed
/// without an explicit parent logger.
#[inline]
pub fn null() -> Logger {
    Logger::root(Discard, o!())
}

/// Terminal logger writing to stderr at the supplied severity.
pub fn terminal(level: sloggers::types::Severity) -> Result<Logger, sloggers::Error> {
    use sloggers::terminal::{Destination, TerminalLoggerBuilder};

    let mut builder = TerminalLoggerBuilder::new();
    builder.level(level);
    builder.destination(Destination::Stderr);
    builder.build()
}

/// Build a logger from a TOML logger-config document.
pub fn from_toml(document: &str) -> Result<Logger, Box<dyn std::error::Error>> {
    let config: LoggerConfig = serdeconv::from_toml_str(document)?;
    let logger = config.build_logger()?;
    Ok(logger)
}

/// Resolve the optional-parent-logger constructor argument: a child of the
/// supplied logger tagged with the layer name, or a discarding root.
#[inline]
pub fn layer<'a, L: Into<Option<&'a Logger>>>(log: L, name: &'static str) -> Logger {
    match log.into() {
        Some(log) => log.new(o!("layer" => name)),
        None => null(),
    }
}
