//! Error types for nus-logger

use std::time::Duration;

use thiserror::Error;

/// Errors raised by discovery, sessions and the reconnect loop
#[derive(Debug, Error)]
pub enum NusError {
    /// No device matched the criteria before the scan deadline
    #[error("No matching device found within {timeout:?}")]
    ScanTimeout {
        /// The scan window that elapsed
        timeout: Duration,
    },

    /// Connecting or subscribing to the device failed
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Writing to the RX characteristic failed
    #[error("Write failed: {0}")]
    Write(String),

    /// The retry budget is exhausted
    #[error("Max retries reached after {attempts} failed reconnect attempts")]
    MaxRetriesExceeded {
        /// Number of failed attempts that were allowed
        attempts: u32,
    },

    /// No Bluetooth adapter is available
    #[error("No Bluetooth adapter found")]
    NoAdapter,

    /// The platform refused access to the Bluetooth stack
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The device does not expose the expected service or characteristics
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// Operation requires a live connection
    #[error("Not connected")]
    NotConnected,

    /// Any other failure reported by the Bluetooth stack
    #[error("Bluetooth error: {0}")]
    Transport(String),

    /// Invalid argument supplied by the caller
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A stop was requested while the operation was in flight
    #[error("Operation cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, NusError>;

impl NusError {
    /// Whether the reconnect loop should back off and try again
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ScanTimeout { .. }
                | Self::Connection(_)
                | Self::ServiceNotFound(_)
                | Self::NotConnected
                | Self::Transport(_)
        )
    }

    /// A short remediation hint for common platform failures
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::NoAdapter => Some("Ensure the Bluetooth adapter is powered and not blocked (rfkill)."),
            Self::PermissionDenied(_) if cfg!(target_os = "linux") => Some(
                "Missing permissions. Consider adding your user to the 'bluetooth' group.",
            ),
            Self::PermissionDenied(_) => {
                Some("Grant this terminal access to Bluetooth in the system privacy settings.")
            }
            Self::Transport(msg) => {
                let msg = msg.to_lowercase();
                if msg.contains("not available") || msg.contains("management command") {
                    Some("Ensure the Bluetooth adapter is powered and not blocked (rfkill).")
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

impl From<btleplug::Error> for NusError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::PermissionDenied => Self::PermissionDenied(err.to_string()),
            btleplug::Error::DeviceNotFound
            | btleplug::Error::NotConnected
            | btleplug::Error::TimedOut(_) => Self::Connection(err.to_string()),
            other => Self::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NusError::ScanTimeout { timeout: Duration::from_secs(5) };
        assert_eq!(err.to_string(), "No matching device found within 5s");

        let err = NusError::MaxRetriesExceeded { attempts: 3 };
        assert_eq!(
            err.to_string(),
            "Max retries reached after 3 failed reconnect attempts"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(NusError::ScanTimeout { timeout: Duration::from_secs(1) }.is_transient());
        assert!(NusError::Connection("lost".into()).is_transient());
        assert!(NusError::Transport("backend".into()).is_transient());
        assert!(!NusError::MaxRetriesExceeded { attempts: 1 }.is_transient());
        assert!(!NusError::PermissionDenied("denied".into()).is_transient());
        assert!(!NusError::NoAdapter.is_transient());
        assert!(!NusError::Cancelled.is_transient());
        assert!(!NusError::Write("busy".into()).is_transient());
    }

    #[test]
    fn test_btleplug_error_conversion() {
        let err: NusError = btleplug::Error::PermissionDenied.into();
        assert!(matches!(err, NusError::PermissionDenied(_)));

        let err: NusError = btleplug::Error::NotConnected.into();
        assert!(matches!(err, NusError::Connection(_)));

        let err: NusError = btleplug::Error::Other("boom".into()).into();
        assert!(matches!(err, NusError::Transport(_)));
    }

    #[test]
    fn test_hints() {
        assert!(NusError::NoAdapter.hint().is_some());
        assert!(NusError::PermissionDenied("x".into()).hint().is_some());
        assert!(NusError::Transport("Adapter not available".into()).hint().is_some());
        assert!(NusError::Connection("x".into()).hint().is_none());
    }
}
