//! Colored terminal backend for the `log` facade.
//!
//! `OxideX` crates log through the `log` macros; this crate is the backend a
//! binary or test installs to see them. Output goes to stderr as
//! `[LEVEL] target: message`, colored by level, filtered by a level that can
//! be changed at any time.
//!
//! # Example
//!
//! ```
//! use log::{LevelFilter, debug, info};
//!
//! let _ = oxidex_log::init_with_level(LevelFilter::Debug);
//!
//! info!("runtime started");
//! debug!("realized {} classes", 3);
//!
//! oxidex_log::set_level(LevelFilter::Warn);
//! assert_eq!(oxidex_log::level(), LevelFilter::Warn);
//! ```

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};

pub use log::{ParseLevelError, SetLoggerError};

/// Environment variable read by [`init_from_env`].
pub const LOG_ENV_VAR: &str = "OXIDEC_LOG";

/// Level used when nothing else is configured.
pub const DEFAULT_LEVEL: LevelFilter = LevelFilter::Info;

/// Returns the ANSI color code for a log level.
const fn color_code(level: Level) -> &'static str {
    match level {
        Level::Error => "\x1b[31m", // Red
        Level::Warn => "\x1b[33m",  // Yellow
        Level::Info => "\x1b[32m",  // Green
        Level::Debug => "\x1b[36m", // Cyan
        Level::Trace => "\x1b[35m", // Magenta
    }
}

const RESET: &str = "\x1b[0m";

/// The terminal logger.
///
/// The level lives in an atomic so it can be adjusted without reinstalling
/// the logger; it is mirrored into `log::set_max_level` so disabled macros
/// cost a single comparison at the call site.
pub struct TerminalLogger {
    level: AtomicUsize,
}

impl TerminalLogger {
    const fn new(level: LevelFilter) -> Self {
        TerminalLogger {
            level: AtomicUsize::new(level as usize),
        }
    }

    /// Returns the current level filter.
    pub fn level(&self) -> LevelFilter {
        match self.level.load(Ordering::Relaxed) {
            0 => LevelFilter::Off,
            1 => LevelFilter::Error,
            2 => LevelFilter::Warn,
            3 => LevelFilter::Info,
            4 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    /// Sets the level filter for this logger only.
    pub fn set_level(&self, level: LevelFilter) {
        self.level.store(level as usize, Ordering::Relaxed);
    }

    fn format(record: &Record<'_>) -> String {
        let level = record.level();
        format!(
            "{}[{}]{RESET} {}: {}",
            color_code(level),
            level.as_str(),
            record.target(),
            record.args()
        )
    }
}

impl Log for TerminalLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // A failed write to stderr has nowhere better to be reported.
        let _ = writeln!(std::io::stderr().lock(), "{}", Self::format(record));
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

static LOGGER: TerminalLogger = TerminalLogger::new(DEFAULT_LEVEL);

/// Installs the terminal logger at [`DEFAULT_LEVEL`].
///
/// # Errors
///
/// Returns [`SetLoggerError`] if a logger (this one or any other) is already
/// installed for the process.
pub fn init() -> Result<(), SetLoggerError> {
    init_with_level(DEFAULT_LEVEL)
}

/// Installs the terminal logger at `level`.
///
/// # Errors
///
/// Returns [`SetLoggerError`] if a logger is already installed.
pub fn init_with_level(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    set_level(level);
    Ok(())
}

/// Installs the terminal logger at the level named by `OXIDEC_LOG`, falling
/// back to [`DEFAULT_LEVEL`] when the variable is unset or unparsable.
///
/// # Errors
///
/// Returns [`SetLoggerError`] if a logger is already installed.
pub fn init_from_env() -> Result<(), SetLoggerError> {
    let level = std::env::var(LOG_ENV_VAR)
        .ok()
        .and_then(|value| parse_level(&value).ok())
        .unwrap_or(DEFAULT_LEVEL);
    init_with_level(level)
}

/// Parses a level name (`off`, `error`, `warn`, `info`, `debug`, `trace`),
/// case-insensitively.
///
/// # Errors
///
/// Returns [`ParseLevelError`] for any other string.
pub fn parse_level(s: &str) -> Result<LevelFilter, ParseLevelError> {
    s.trim().parse()
}

/// Sets the level of the terminal logger and the facade's max level.
pub fn set_level(level: LevelFilter) {
    LOGGER.set_level(level);
    log::set_max_level(level);
}

/// Sets the level from a string.
///
/// # Errors
///
/// Returns [`ParseLevelError`] if `s` does not name a level; the current
/// level is left unchanged.
pub fn set_level_from_str(s: &str) -> Result<(), ParseLevelError> {
    set_level(parse_level(s)?);
    Ok(())
}

/// Returns the terminal logger's current level.
pub fn level() -> LevelFilter {
    LOGGER.level()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("error"), Ok(LevelFilter::Error));
        assert_eq!(parse_level("WARN"), Ok(LevelFilter::Warn));
        assert_eq!(parse_level(" Info "), Ok(LevelFilter::Info));
        assert_eq!(parse_level("DEBUG"), Ok(LevelFilter::Debug));
        assert_eq!(parse_level("trace"), Ok(LevelFilter::Trace));
        assert_eq!(parse_level("off"), Ok(LevelFilter::Off));
        assert!(parse_level("verbose").is_err());
    }

    #[test]
    fn test_logger_level_filtering() {
        let logger = TerminalLogger::new(LevelFilter::Info);
        let at = |level| Metadata::builder().level(level).target("t").build();

        assert!(logger.enabled(&at(Level::Error)));
        assert!(logger.enabled(&at(Level::Warn)));
        assert!(logger.enabled(&at(Level::Info)));
        assert!(!logger.enabled(&at(Level::Debug)));

        logger.set_level(LevelFilter::Trace);
        assert!(logger.enabled(&at(Level::Trace)));

        logger.set_level(LevelFilter::Off);
        assert!(!logger.enabled(&at(Level::Error)));
    }

    #[test]
    fn test_format_includes_level_and_target() {
        let args = format_args!("realized {}", "Root");
        let record = Record::builder()
            .level(Level::Debug)
            .target("oxidec::runtime::store")
            .args(args)
            .build();

        let line = TerminalLogger::format(&record);
        assert!(line.contains("[DEBUG]"));
        assert!(line.contains("oxidec::runtime::store: realized Root"));
        assert!(line.starts_with(color_code(Level::Debug)));
    }

    #[test]
    fn test_global_install_and_level() {
        // Only the first install in the process succeeds.
        let first = init_with_level(LevelFilter::Debug);
        let second = init();
        assert!(first.is_ok() || second.is_err());
        assert!(second.is_err());

        set_level(LevelFilter::Warn);
        assert_eq!(level(), LevelFilter::Warn);
        assert_eq!(log::max_level(), LevelFilter::Warn);

        set_level_from_str("trace").unwrap();
        assert_eq!(level(), LevelFilter::Trace);

        assert!(set_level_from_str("loud").is_err());
        assert_eq!(level(), LevelFilter::Trace);

        log::info!("logging from the test harness");
    }
}
