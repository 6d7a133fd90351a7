//! Diagnostic logging for nus-logger
//!
//! Diagnostics go to stderr through `env_logger` so that decoded device lines
//! on stdout stay clean for piping. `RUST_LOG`, when set, takes precedence over
//! the level chosen from the command line.

use std::io::Write;

use chrono::Local;
use env_logger::{Builder, Env};
use log::{Level, LevelFilter};

/// Timestamp format for log entries
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Level used when `RUST_LOG` is not set
pub fn default_level(verbose: bool) -> LevelFilter {
    if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

fn level_label(level: Level, color: bool) -> &'static str {
    match (level, color) {
        (Level::Error, true) => "\x1B[31mERROR\x1B[0m", // Red
        (Level::Warn, true) => "\x1B[33mWARN \x1B[0m",  // Yellow
        (Level::Info, true) => "\x1B[32mINFO \x1B[0m",  // Green
        (Level::Debug, true) => "\x1B[36mDEBUG\x1B[0m", // Cyan
        (Level::Trace, true) => "\x1B[90mTRACE\x1B[0m", // Gray
        (Level::Error, false) => "ERROR",
        (Level::Warn, false) => "WARN ",
        (Level::Info, false) => "INFO ",
        (Level::Debug, false) => "DEBUG",
        (Level::Trace, false) => "TRACE",
    }
}

/// Build the logger without installing it
pub fn builder(verbose: bool, color: bool) -> Builder {
    let mut builder = Builder::from_env(Env::default().default_filter_or(default_level(verbose).to_string()));
    builder.format(move |buf, record| {
        writeln!(
            buf,
            "[{}] {} [{}] {}",
            Local::now().format(TIMESTAMP_FORMAT),
            level_label(record.level(), color),
            record.module_path().unwrap_or("<unknown>"),
            record.args()
        )
    });
    builder
}

/// Install the global logger. Repeated calls are ignored.
pub fn init_logger(verbose: bool) {
    let color = std::io::IsTerminal::is_terminal(&std::io::stderr());
    let _ = builder(verbose, color).try_init();
}
