use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How to pick one device when several match the criteria
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicy {
    /// Strongest RSSI wins, first discovered breaks ties
    #[default]
    StrongestSignal,
    /// First device discovered during the scan wins
    FirstDiscovered,
}

/// Configuration for the Bluetooth scanner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    /// Scan window
    pub timeout: Duration,
    /// Disambiguation rule for multiple candidates
    pub selection: SelectionPolicy,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            selection: SelectionPolicy::StrongestSignal,
        }
    }
}

impl ScanConfig {
    /// Create a new scan configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scan window
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the selection policy
    pub fn with_selection(mut self, selection: SelectionPolicy) -> Self {
        self.selection = selection;
        self
    }
}
