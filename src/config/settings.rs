use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::bluetooth::{FilterCriteria, ScanConfig, SelectionPolicy, SessionOptions, NUS_SERVICE_UUID};
use crate::error::NusError;
use crate::framing::FramerOptions;
use crate::output::{LineFormatter, TimestampMode};
use crate::reconnect::ReconnectPolicy;

/// Runtime settings of the logger.
///
/// Durations are stored as seconds so the JSON file stays hand-editable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerSettings {
    /// Device name substring, empty for any device
    pub name: String,

    /// Preferred device address substring
    pub filter_addr: Option<String>,

    /// Require the NUS service UUID in advertisement data
    pub require_service: bool,

    /// Scan window in seconds
    pub timeout: f64,

    /// Connect deadline in seconds
    pub connect_timeout: f64,

    /// Timestamp prefix
    pub timestamps: TimestampMode,

    /// Append the raw bytes as hex
    pub raw: bool,

    /// Append rendered lines to this file
    pub logfile: Option<PathBuf>,

    /// Adapter index or name substring
    pub adapter: Option<String>,

    /// Initial reconnect backoff in seconds
    pub backoff: f64,

    /// Backoff ceiling in seconds
    pub backoff_max: f64,

    /// Seconds a connection must last before backoff is forgiven
    pub stability_window: f64,

    /// Failed reconnect attempts allowed in a row, unbounded when absent
    pub max_retries: Option<u32>,

    /// Reconnect after link loss
    pub reconnect: bool,

    /// Dump services and characteristics after connecting
    pub verbose: bool,

    /// How to choose among several matching devices
    pub selection: SelectionPolicy,

    /// Text written to the RX characteristic after each connect
    pub send: Option<String>,
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            filter_addr: None,
            require_service: true,
            timeout: 5.0,
            connect_timeout: 10.0,
            timestamps: TimestampMode::None,
            raw: false,
            logfile: None,
            adapter: None,
            backoff: 0.5,
            backoff_max: 15.0,
            stability_window: 60.0,
            max_retries: None,
            reconnect: true,
            verbose: false,
            selection: SelectionPolicy::StrongestSignal,
            send: None,
        }
    }
}

/// Get the default settings path
pub fn default_settings_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|config_dir| config_dir.join("nus-logger").join("settings.json"))
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl LoggerSettings {
    /// Load settings from a JSON file; missing keys take their defaults
    pub fn load(path: &Path) -> Result<Self, NusError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| NusError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let settings: Self = serde_json::from_str(&text)
            .map_err(|e| NusError::Config(format!("invalid settings in {}: {}", path.display(), e)))?;
        debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Load `explicit` if given, else the default settings file when it
    /// exists, else the built-in defaults
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self, NusError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match default_settings_path() {
            Some(path) if path.is_file() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Save settings as pretty JSON, creating the settings directory
    pub fn save(&self, path: &Path) -> Result<(), NusError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| NusError::Config(format!("cannot serialize settings: {}", e)))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Reject settings the logger cannot run with
    pub fn validate(&self) -> Result<(), NusError> {
        let positive = [
            ("timeout", self.timeout),
            ("connect_timeout", self.connect_timeout),
            ("backoff", self.backoff),
            ("backoff_max", self.backoff_max),
        ];
        for (field, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(NusError::Config(format!("{} must be a positive number of seconds", field)));
            }
        }
        if !self.stability_window.is_finite() || self.stability_window < 0.0 {
            return Err(NusError::Config("stability_window must not be negative".into()));
        }
        if self.backoff_max < self.backoff {
            return Err(NusError::Config(format!(
                "backoff_max ({}) is below backoff ({})",
                self.backoff_max, self.backoff
            )));
        }
        Ok(())
    }

    /// Scan window
    pub fn scan_timeout(&self) -> Duration {
        secs(self.timeout)
    }

    /// Advertisement criteria for the first scan.
    ///
    /// `filter_addr` only ranks candidates: a name match is still used when
    /// no device carries the preferred address.
    pub fn filter_criteria(&self) -> FilterCriteria {
        let preferred = self
            .filter_addr
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string);
        FilterCriteria::new(self.name.trim())
            .with_required_service(self.require_service.then_some(NUS_SERVICE_UUID))
            .with_early_match(preferred)
    }

    /// Reconnect timing and budget
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::default()
            .with_backoff(secs(self.backoff), secs(self.backoff_max))
            .with_stability_window(secs(self.stability_window))
            .with_max_retries(self.max_retries)
            .with_scan(
                ScanConfig::new()
                    .with_timeout(self.scan_timeout())
                    .with_selection(self.selection),
            )
            .with_connect_timeout(secs(self.connect_timeout))
            .with_reconnect(self.reconnect)
    }

    /// Options for every session
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            framer: FramerOptions::default()
                .with_raw(self.raw)
                .with_timestamps(self.timestamps.is_enabled()),
            ..SessionOptions::default()
        }
    }

    /// Renderer for decoded lines
    pub fn formatter(&self) -> LineFormatter {
        LineFormatter::new(self.timestamps, self.raw)
    }
}
