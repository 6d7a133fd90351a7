//! Line rendering and the persistent log file

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::NusError;
use crate::framing::LogLine;

/// Timestamp format for UTC prefixes
const UTC_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Timestamp format for local prefixes, offset as `+HH:MM`
const LOCAL_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%:z";

/// How rendered lines are prefixed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampMode {
    /// No prefix
    #[default]
    None,
    /// ISO-8601 in UTC with a `Z` suffix
    Utc,
    /// ISO-8601 in the local zone with its offset
    Local,
}

impl TimestampMode {
    /// Whether lines need a receive timestamp
    pub fn is_enabled(self) -> bool {
        self != Self::None
    }
}

impl std::str::FromStr for TimestampMode {
    type Err = NusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" | "off" => Ok(Self::None),
            "utc" => Ok(Self::Utc),
            "local" => Ok(Self::Local),
            other => Err(NusError::Config(format!("unknown timestamp mode '{}'", other))),
        }
    }
}

/// Renders a [`LogLine`] as `[<timestamp> ]<text>[ | <hex>]`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineFormatter {
    timestamps: TimestampMode,
    raw: bool,
}

impl LineFormatter {
    /// Create a formatter
    pub fn new(timestamps: TimestampMode, raw: bool) -> Self {
        Self { timestamps, raw }
    }

    /// Render one line. Lines without a receive time are stamped now.
    pub fn render(&self, line: &LogLine) -> String {
        let mut out = String::with_capacity(line.text.len() + 32);
        if self.timestamps.is_enabled() {
            let at = line.timestamp.unwrap_or_else(Utc::now);
            out.push_str(&self.format_timestamp(at));
            out.push(' ');
        }
        out.push_str(&line.text);
        if self.raw {
            out.push_str(" | ");
            if let Some(raw) = &line.raw {
                out.push_str(&hex(raw));
            } else {
                out.push_str(&hex(line.text.as_bytes()));
            }
        }
        out
    }

    /// Format `at` per the timestamp mode; empty for [`TimestampMode::None`]
    pub fn format_timestamp(&self, at: DateTime<Utc>) -> String {
        match self.timestamps {
            TimestampMode::None => String::new(),
            TimestampMode::Utc => at.format(UTC_FORMAT).to_string(),
            TimestampMode::Local => at.with_timezone(&Local).format(LOCAL_FORMAT).to_string(),
        }
    }
}

/// Lowercase hex without separators
pub fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Append-only log file, one rendered line per record
pub struct LogFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl LogFile {
    /// Open `path` for appending, creating the file but never its parent
    /// directories
    pub fn open(path: impl AsRef<Path>) -> Result<Self, NusError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!("Opened log file {}", path.display());
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// Path of the file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line and flush it
    pub fn append(&mut self, line: &str) -> Result<(), NusError> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Flush buffered data
    pub fn flush(&mut self) -> Result<(), NusError> {
        self.writer.flush()?;
        Ok(())
    }
}
