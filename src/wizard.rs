//! Interactive device and option selection

use std::io::{BufRead, Write};
use std::path::PathBuf;

use log::debug;

use crate::bluetooth::{sort_by_signal, DiscoveredDevice, FilterCriteria, Scanner, NUS_SERVICE_UUID};
use crate::config::LoggerSettings;
use crate::error::NusError;
use crate::output::TimestampMode;

/// Answer to the device menu
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MenuChoice {
    /// Use the device at this index
    Select(usize),
    /// Scan again
    Rescan,
    /// Leave the wizard
    Quit,
    /// Unusable answer, with the message to show
    Invalid(String),
}

/// Interpret an answer to the device menu listing `count` devices
pub fn parse_menu_choice(answer: &str, count: usize) -> MenuChoice {
    let answer = answer.trim().to_lowercase();
    match answer.as_str() {
        "q" => MenuChoice::Quit,
        "" | "r" => MenuChoice::Rescan,
        _ => match answer.parse::<usize>() {
            Ok(index) if index < count => MenuChoice::Select(index),
            Ok(_) => MenuChoice::Invalid("Invalid index.".into()),
            Err(_) => MenuChoice::Invalid("Enter a numeric index, 'r', or 'q'.".into()),
        },
    }
}

/// Interpret an answer to the timestamp question
pub fn parse_timestamp_choice(answer: &str) -> Option<TimestampMode> {
    match answer.trim().to_lowercase().as_str() {
        "" | "n" => Some(TimestampMode::None),
        "u" => Some(TimestampMode::Utc),
        "l" => Some(TimestampMode::Local),
        _ => None,
    }
}

/// Device selection and display options read from a terminal
pub struct Wizard<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> Wizard<R, W> {
    /// Create a wizard over an input and an output
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn ask(&mut self, prompt: &str) -> Result<Option<String>, NusError> {
        write!(self.output, "{}", prompt)?;
        self.output.flush()?;
        let mut answer = String::new();
        if self.input.read_line(&mut answer)? == 0 {
            // End of input
            return Ok(None);
        }
        Ok(Some(answer.trim().to_string()))
    }

    /// Let the user pick one of `devices`; `None` asks for a rescan, an error
    /// of kind [`NusError::Cancelled`] means the user quit
    pub fn choose_device(&mut self, devices: &[DiscoveredDevice]) -> Result<Option<DiscoveredDevice>, NusError> {
        if devices.is_empty() {
            writeln!(self.output, "No devices found.")?;
            return match self.ask("(R)escan or (Q)uit? [R/q]: ")? {
                Some(a) if a.eq_ignore_ascii_case("q") => Err(NusError::Cancelled),
                None => Err(NusError::Cancelled),
                Some(_) => Ok(None),
            };
        }

        writeln!(self.output, "\nDiscovered devices:")?;
        for (idx, d) in devices.iter().enumerate() {
            let rssi = d.rssi.map(|r| r.to_string()).unwrap_or_else(|| "?".into());
            writeln!(self.output, "  [{}] {} | {} | RSSI {} dBm", idx, d.display_name(), d.address, rssi)?;
        }
        loop {
            let answer = self
                .ask("Select device index, or 'r' to rescan, 'q' to quit: ")?
                .ok_or(NusError::Cancelled)?;
            match parse_menu_choice(&answer, devices.len()) {
                MenuChoice::Select(index) => return Ok(Some(devices[index].clone())),
                MenuChoice::Rescan => return Ok(None),
                MenuChoice::Quit => return Err(NusError::Cancelled),
                MenuChoice::Invalid(msg) => writeln!(self.output, "{}", msg)?,
            }
        }
    }

    /// Ask for the display options and fold the choice into `base`
    pub fn configure(&mut self, device: &DiscoveredDevice, base: &LoggerSettings) -> Result<LoggerSettings, NusError> {
        let timestamps = loop {
            let answer = self
                .ask("Timestamp? (n)one, (u)tc, (l)ocal [n]: ")?
                .ok_or(NusError::Cancelled)?;
            match parse_timestamp_choice(&answer) {
                Some(mode) => break mode,
                None => writeln!(self.output, "Please enter n, u, or l.")?,
            }
        };
        let raw = self
            .ask("Show raw hex column? (y/N): ")?
            .map(|a| a.eq_ignore_ascii_case("y"))
            .unwrap_or(false);
        let logfile = self
            .ask("Logfile path (leave blank for none): ")?
            .filter(|a| !a.is_empty())
            .map(PathBuf::from);

        let mut settings = base.clone();
        settings.name = device.display_name().to_string();
        // Full address disambiguates duplicate names
        settings.filter_addr = Some(device.address.clone());
        // Some firmware leaves the 128-bit UUID out of its advertisement
        settings.require_service = base.require_service && device.services.contains(&NUS_SERVICE_UUID);
        settings.timestamps = timestamps;
        settings.raw = raw;
        settings.logfile = logfile.or_else(|| base.logfile.clone());
        settings.reconnect = true;
        writeln!(self.output, "Selected {} ({})", device.display_name(), device.address)?;
        Ok(settings)
    }

    /// Scan, pick a device and options. Returns `None` when the user quits.
    pub async fn run(&mut self, scanner: &Scanner, base: &LoggerSettings) -> Result<Option<LoggerSettings>, NusError> {
        writeln!(self.output, "NUS Logger Wizard")?;
        writeln!(self.output, "Scanning for advertising devices (Ctrl-C to quit)...")?;

        let device = loop {
            let mut devices = match scanner.scan(&FilterCriteria::wildcard(), base.scan_timeout()).await {
                Ok(devices) => devices,
                Err(NusError::Cancelled) => return Ok(None),
                Err(e) => {
                    writeln!(self.output, "Scan failed: {}", e)?;
                    match self.ask("Retry scan? [Y/n]: ")? {
                        Some(a) if a.eq_ignore_ascii_case("n") => return Ok(None),
                        None => return Ok(None),
                        Some(_) => continue,
                    }
                }
            };
            sort_by_signal(&mut devices);
            match self.choose_device(&devices) {
                Ok(Some(device)) => break device,
                Ok(None) => debug!("Rescanning"),
                Err(NusError::Cancelled) => return Ok(None),
                Err(e) => return Err(e),
            }
        };

        match self.configure(&device, base) {
            Ok(settings) => Ok(Some(settings)),
            Err(NusError::Cancelled) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::matches;
    use std::io::Cursor;

    fn devices() -> Vec<DiscoveredDevice> {
        vec![
            DiscoveredDevice::new("AA:BB", Some("nrf-log")).with_rssi(Some(-40)),
            DiscoveredDevice::new("CC:DD", Some("nrf-log")).with_rssi(Some(-70)),
        ]
    }

    #[test]
    fn test_parse_menu_choice() {
        assert_eq!(parse_menu_choice("1", 2), MenuChoice::Select(1));
        assert_eq!(parse_menu_choice(" Q ", 2), MenuChoice::Quit);
        assert_eq!(parse_menu_choice("", 2), MenuChoice::Rescan);
        assert!(matches!(parse_menu_choice("5", 2), MenuChoice::Invalid(_)));
        assert!(matches!(parse_menu_choice("abc", 2), MenuChoice::Invalid(_)));
    }

    #[test]
    fn test_parse_timestamp_choice() {
        assert_eq!(parse_timestamp_choice(""), Some(TimestampMode::None));
        assert_eq!(parse_timestamp_choice("U"), Some(TimestampMode::Utc));
        assert_eq!(parse_timestamp_choice("l"), Some(TimestampMode::Local));
        assert_eq!(parse_timestamp_choice("x"), None);
    }

    #[test]
    fn test_choose_device_retries_invalid_answers() {
        let mut out = Vec::new();
        let mut wizard = Wizard::new(Cursor::new("9\n1\n"), &mut out);
        let chosen = wizard.choose_device(&devices()).unwrap().unwrap();
        assert_eq!(chosen.address, "CC:DD");
        drop(wizard);

        let printed = String::from_utf8(out).unwrap();
        assert!(printed.contains("[0] nrf-log | AA:BB | RSSI -40 dBm"));
        assert!(printed.contains("Invalid index."));
    }

    #[test]
    fn test_choose_device_quit_and_eof() {
        let mut wizard = Wizard::new(Cursor::new("q\n"), Vec::new());
        assert!(matches!(wizard.choose_device(&devices()), Err(NusError::Cancelled)));

        let mut wizard = Wizard::new(Cursor::new(""), Vec::new());
        assert!(matches!(wizard.choose_device(&devices()), Err(NusError::Cancelled)));
    }

    #[test]
    fn test_configure_builds_settings() {
        let base = LoggerSettings {
            timeout: 3.0,
            ..LoggerSettings::default()
        };
        let mut wizard = Wizard::new(Cursor::new("bogus\nu\ny\n/tmp/nus.log\n"), Vec::new());
        let settings = wizard.configure(&devices()[0], &base).unwrap();

        assert_eq!(settings.name, "nrf-log");
        assert_eq!(settings.filter_addr.as_deref(), Some("AA:BB"));
        assert_eq!(settings.timestamps, TimestampMode::Utc);
        assert!(settings.raw);
        assert_eq!(settings.logfile, Some(PathBuf::from("/tmp/nus.log")));
        assert_eq!(settings.timeout, 3.0);
    }

    #[test]
    fn test_configured_settings_match_the_chosen_device() {
        let base = LoggerSettings::default();
        let silent = DiscoveredDevice::new("AA:BB", Some("nrf-log"));
        let mut wizard = Wizard::new(Cursor::new("\n\n\n"), Vec::new());
        let settings = wizard.configure(&silent, &base).unwrap();

        assert!(!settings.require_service);
        assert!(matches(&silent, &settings.filter_criteria()));

        let advertised = silent.clone().with_service(NUS_SERVICE_UUID);
        let mut wizard = Wizard::new(Cursor::new("\n\n\n"), Vec::new());
        let settings = wizard.configure(&advertised, &base).unwrap();

        assert!(settings.require_service);
        assert!(matches(&advertised, &settings.filter_criteria()));
    }
}
