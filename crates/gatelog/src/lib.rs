//! Leveled logging backend for the `log` facade.
//!
//! Each record is one line, `[LEVEL] target: message`, written under a lock
//! so lines from concurrent threads never interleave.

use std::fmt;
use std::io::{self, IsTerminal, Write};

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::{Mutex, Once};

/// Environment variable consulted by [`level_from_env`].
pub const LOG_ENV: &str = "GATESCHED_LOG";

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => " INFO",
            Level::Warn => " WARN",
            Level::Error => "ERROR",
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            Level::Trace => "\x1b[90m", // Gray
            Level::Debug => "\x1b[36m", // Cyan
            Level::Info => "\x1b[32m",  // Green
            Level::Warn => "\x1b[33m",  // Yellow
            Level::Error => "\x1b[31m", // Red
        }
    }
}

impl From<log::Level> for Level {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Trace => Level::Trace,
            log::Level::Debug => Level::Debug,
            log::Level::Info => Level::Info,
            log::Level::Warn => Level::Warn,
            log::Level::Error => Level::Error,
        }
    }
}

type Sink = Box<dyn Write + Send>;

struct GateLogger {
    max: LevelFilter,
    color: bool,
}

static LOGGER: Once<GateLogger> = Once::new();
static SINK: Mutex<Option<Sink>> = Mutex::new(None);

/// Format one record the way the logger writes it.
pub fn format_line(level: Level, target: &str, args: &fmt::Arguments<'_>, color: bool) -> String {
    if color {
        format!("{}[{}]\x1b[0m {}: {}\n", level.color(), level.as_str(), target, args)
    } else {
        format!("[{}] {}: {}\n", level.as_str(), target, args)
    }
}

impl Log for GateLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.max
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_line(record.level().into(), record.target(), record.args(), self.color);
        let mut sink = SINK.lock();
        // Nowhere to report a failing log write.
        let _ = match sink.as_mut() {
            Some(writer) => writer.write_all(line.as_bytes()),
            None => io::stderr().write_all(line.as_bytes()),
        };
    }

    fn flush(&self) {
        let mut sink = SINK.lock();
        let _ = match sink.as_mut() {
            Some(writer) => writer.flush(),
            None => io::stderr().flush(),
        };
    }
}

fn install(max: LevelFilter, color: bool) -> Result<(), SetLoggerError> {
    let logger = LOGGER.call_once(|| GateLogger { max, color });
    log::set_logger(logger)?;
    log::set_max_level(logger.max);
    Ok(())
}

/// Initialize the logger, writing to stderr.
pub fn init(max: LevelFilter) -> Result<(), SetLoggerError> {
    install(max, io::stderr().is_terminal())
}

/// Initialize the logger with a custom sink. Lines are uncolored.
pub fn init_with_writer(max: LevelFilter, writer: Box<dyn Write + Send>) -> Result<(), SetLoggerError> {
    *SINK.lock() = Some(writer);
    install(max, false)
}

/// Level from [`LOG_ENV`] (`error`, `warn`, `info`, `debug`, `trace`,
/// `off`), or `default` when unset or unparsable.
pub fn level_from_env(default: LevelFilter) -> LevelFilter {
    std::env::var(LOG_ENV)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Level for `-v` repeated `count` times on top of `base`.
pub fn level_from_verbosity(base: LevelFilter, count: u8) -> LevelFilter {
    let mut level = base;
    for _ in 0..count {
        level = match level {
            LevelFilter::Off => LevelFilter::Error,
            LevelFilter::Error => LevelFilter::Warn,
            LevelFilter::Warn => LevelFilter::Info,
            LevelFilter::Info => LevelFilter::Debug,
            LevelFilter::Debug | LevelFilter::Trace => LevelFilter::Trace,
        };
    }
    level
}
