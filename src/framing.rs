//! Newline framing of the notification byte stream
//!
//! The peripheral pushes UTF-8 text in arbitrarily sized notification chunks.
//! [`LineFramer`] reassembles them into [`LogLine`]s, keeping the unterminated
//! tail buffered between chunks.

use chrono::{DateTime, Utc};
use log::debug;

/// Line terminator emitted by the peripheral
const LINE_TERMINATOR: u8 = b'\n';

/// A single decoded log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// When the line was framed, if timestamps were requested
    pub timestamp: Option<DateTime<Utc>>,
    /// Exact bytes consumed for this line (terminator excluded), if raw capture was requested
    pub raw: Option<Vec<u8>>,
    /// Decoded text with the terminator and any trailing carriage return stripped
    pub text: String,
    /// Whether invalid UTF-8 was replaced with placeholder characters
    pub degraded: bool,
}

impl LogLine {
    /// Create a plain text line without timestamp or raw bytes
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            timestamp: None,
            raw: None,
            text: text.into(),
            degraded: false,
        }
    }
}

/// Options controlling what each framed line carries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramerOptions {
    /// Keep the exact byte span of every line
    pub capture_raw: bool,
    /// Stamp every line with the time it was framed
    pub timestamps: bool,
}

impl FramerOptions {
    /// Set whether raw bytes are captured
    pub fn with_raw(mut self, capture_raw: bool) -> Self {
        self.capture_raw = capture_raw;
        self
    }

    /// Set whether lines are timestamped
    pub fn with_timestamps(mut self, timestamps: bool) -> Self {
        self.timestamps = timestamps;
        self
    }
}

/// Incremental newline decoder
#[derive(Debug, Default)]
pub struct LineFramer {
    /// Unterminated bytes carried over between chunks
    buffer: Vec<u8>,
    /// Bytes at the front of `buffer` already known to hold no terminator
    scanned: usize,
    options: FramerOptions,
}

impl LineFramer {
    /// Create a framer with the given options
    pub fn new(options: FramerOptions) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            options,
        }
    }

    /// Append a chunk and lazily yield every line it completes.
    ///
    /// Lines not pulled from the returned iterator stay buffered and are
    /// yielded first on the next call, so ordering is never affected.
    pub fn feed(&mut self, chunk: &[u8]) -> FramedLines<'_> {
        self.buffer.extend_from_slice(chunk);
        FramedLines { framer: self }
    }

    /// Take the unterminated tail at end of stream, if any
    pub fn flush(&mut self) -> Option<LogLine> {
        if self.buffer.is_empty() {
            return None;
        }
        let tail = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        Some(self.decode(tail))
    }

    /// Number of bytes waiting for a terminator
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn next_line(&mut self) -> Option<LogLine> {
        let offset = self.buffer[self.scanned..]
            .iter()
            .position(|&b| b == LINE_TERMINATOR);
        let Some(offset) = offset else {
            self.scanned = self.buffer.len();
            return None;
        };
        let end = self.scanned + offset;
        let mut line: Vec<u8> = self.buffer.drain(..=end).collect();
        line.pop();
        self.scanned = 0;
        Some(self.decode(line))
    }

    fn decode(&self, bytes: Vec<u8>) -> LogLine {
        let body = match bytes.last() {
            Some(b'\r') => &bytes[..bytes.len() - 1],
            _ => &bytes[..],
        };
        let decoded = String::from_utf8_lossy(body);
        let degraded = matches!(decoded, std::borrow::Cow::Owned(_));
        if degraded {
            debug!("Line contained invalid UTF-8 ({} bytes), rendered with placeholders", body.len());
        }
        let text = decoded.into_owned();

        LogLine {
            timestamp: self.options.timestamps.then(Utc::now),
            raw: self.options.capture_raw.then_some(bytes),
            text,
            degraded,
        }
    }
}

/// Lazy sequence of lines completed by one [`LineFramer::feed`] call
#[derive(Debug)]
pub struct FramedLines<'a> {
    framer: &'a mut LineFramer,
}

impl Iterator for FramedLines<'_> {
    type Item = LogLine;

    fn next(&mut self) -> Option<LogLine> {
        self.framer.next_line()
    }
}
