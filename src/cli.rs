//! Command line surface

use std::path::PathBuf;

use clap::Parser;

use crate::config::LoggerSettings;
use crate::output::TimestampMode;

/// Read Nordic UART Service logs over BLE.
///
/// Environment variables fill in flags that are not given on the command line.
#[derive(Debug, Default, Parser)]
#[command(name = "nus-logger", version, about = "Read Nordic UART Service logs over BLE")]
pub struct Cli {
    /// Substring of the device name to match
    #[arg(long, env = "NUS_NAME")]
    pub name: Option<String>,

    /// Preferred address substring when several devices match
    #[arg(long, env = "NUS_ADDR", value_name = "ADDR")]
    pub filter_addr: Option<String>,

    /// Match devices that do not advertise the NUS service UUID
    #[arg(long)]
    pub no_require_service: bool,

    /// Scan timeout in seconds [default: 5.0]
    #[arg(long, env = "NUS_TIMEOUT", value_name = "SECS")]
    pub timeout: Option<f64>,

    /// Connect timeout in seconds [default: 10.0]
    #[arg(long, value_name = "SECS")]
    pub connect_timeout: Option<f64>,

    /// Prefix lines with a UTC timestamp
    #[arg(long, conflicts_with = "ts_local")]
    pub ts: bool,

    /// Prefix lines with a local timestamp
    #[arg(long)]
    pub ts_local: bool,

    /// Append the raw bytes of each line as hex
    #[arg(long)]
    pub raw: bool,

    /// Append decoded lines to this file
    #[arg(long, env = "NUS_LOGFILE", value_name = "PATH")]
    pub logfile: Option<PathBuf>,

    /// Adapter index or name substring (Linux: hciX)
    #[arg(long, env = "NUS_ADAPTER")]
    pub adapter: Option<String>,

    /// Initial reconnect backoff in seconds [default: 0.5]
    #[arg(long, env = "NUS_BACKOFF", value_name = "SECS")]
    pub backoff: Option<f64>,

    /// Reconnect backoff ceiling in seconds [default: 15.0]
    #[arg(long, value_name = "SECS")]
    pub backoff_max: Option<f64>,

    /// Give up after this many failed reconnect attempts [default: unbounded]
    #[arg(long, env = "NUS_MAX_RETRIES", value_name = "N")]
    pub max_retries: Option<u32>,

    /// Exit when the first connection ends
    #[arg(long)]
    pub no_reconnect: bool,

    /// Debug diagnostics and a service dump after each connect
    #[arg(short, long)]
    pub verbose: bool,

    /// List visible devices and exit
    #[arg(long)]
    pub list: bool,

    /// List Bluetooth adapters and exit
    #[arg(long)]
    pub list_adapters: bool,

    /// Interactive device and option selection (default when no arguments)
    #[arg(long)]
    pub wizard: bool,

    /// Settings file [default: <config dir>/nus-logger/settings.json]
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Write this text, newline terminated, to the device after connecting
    #[arg(long, value_name = "TEXT")]
    pub send: Option<String>,
}

impl Cli {
    /// Whether a device name is needed to proceed
    pub fn needs_name(&self) -> bool {
        !(self.list || self.list_adapters || self.wizard)
    }

    /// Layer the given flags over `settings`
    pub fn apply(&self, settings: &mut LoggerSettings) {
        if let Some(name) = &self.name {
            settings.name = name.clone();
        }
        if let Some(addr) = &self.filter_addr {
            settings.filter_addr = Some(addr.clone());
        }
        if self.no_require_service {
            settings.require_service = false;
        }
        if let Some(timeout) = self.timeout {
            settings.timeout = timeout;
        }
        if let Some(timeout) = self.connect_timeout {
            settings.connect_timeout = timeout;
        }
        if self.ts {
            settings.timestamps = TimestampMode::Utc;
        } else if self.ts_local {
            settings.timestamps = TimestampMode::Local;
        }
        if self.raw {
            settings.raw = true;
        }
        if let Some(path) = &self.logfile {
            settings.logfile = Some(path.clone());
        }
        if let Some(adapter) = &self.adapter {
            settings.adapter = Some(adapter.clone());
        }
        if let Some(backoff) = self.backoff {
            settings.backoff = backoff;
        }
        if let Some(max) = self.backoff_max {
            settings.backoff_max = max;
        }
        if let Some(retries) = self.max_retries {
            settings.max_retries = Some(retries);
        }
        if self.no_reconnect {
            settings.reconnect = false;
        }
        if self.verbose {
            settings.verbose = true;
        }
        if let Some(text) = &self.send {
            settings.send = Some(text.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_ts_flags_conflict() {
        let result = Cli::try_parse_from(["nus-logger", "--name", "x", "--ts", "--ts-local"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_flags_override_settings() {
        let cli = Cli::try_parse_from([
            "nus-logger",
            "--name",
            "nrf",
            "--ts-local",
            "--raw",
            "--max-retries",
            "3",
            "--no-reconnect",
            "--no-require-service",
            "--backoff",
            "1.5",
        ])
        .unwrap();

        let mut settings = LoggerSettings {
            name: "from-file".into(),
            timeout: 8.0,
            ..LoggerSettings::default()
        };
        cli.apply(&mut settings);

        assert_eq!(settings.name, "nrf");
        assert_eq!(settings.timestamps, TimestampMode::Local);
        assert!(settings.raw);
        assert_eq!(settings.max_retries, Some(3));
        assert!(!settings.reconnect);
        assert!(!settings.require_service);
        assert_eq!(settings.backoff, 1.5);
        // Not given on the command line
        assert_eq!(settings.timeout, 8.0);
    }

    #[test]
    fn test_needs_name() {
        let cli = Cli::try_parse_from(["nus-logger", "--list"]).unwrap();
        assert!(!cli.needs_name());
        let cli = Cli::try_parse_from(["nus-logger", "--raw"]).unwrap();
        assert!(cli.needs_name());
    }
}
