use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use crate::bluetooth::filter::{DeviceFilter, FilterCriteria};
use crate::bluetooth::scanner_config::{ScanConfig, SelectionPolicy};
use crate::bluetooth::transport::Transport;
use crate::error::NusError;
use crate::lifecycle::ShutdownSignal;

/// RSSI used for ordering when a report carries none
const RSSI_FLOOR: i16 = -200;

/// A device seen during one scan pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Platform-stable address
    pub address: String,
    /// Advertised local name, if any
    pub name: Option<String>,
    /// Services listed in advertisement or scan-response data
    pub services: BTreeSet<Uuid>,
    /// RSSI (signal strength) value
    pub rssi: Option<i16>,
}

impl DiscoveredDevice {
    /// Create a device record with no services or signal strength
    pub fn new(address: impl Into<String>, name: Option<&str>) -> Self {
        Self {
            address: address.into(),
            name: name.map(str::to_string),
            ..Self::default()
        }
    }

    /// Add an advertised service
    pub fn with_service(mut self, service: Uuid) -> Self {
        self.services.insert(service);
        self
    }

    /// Set the signal strength
    pub fn with_rssi(mut self, rssi: Option<i16>) -> Self {
        self.rssi = rssi;
        self
    }

    /// Name for display, empty when none was advertised
    pub fn display_name(&self) -> &str {
        self.name.as_deref().map(str::trim).unwrap_or("")
    }

    fn signal(&self) -> i16 {
        self.rssi.unwrap_or(RSSI_FLOOR)
    }
}

impl fmt::Display for DiscoveredDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} | {} | ", self.display_name(), self.address)?;
        match self.rssi {
            Some(rssi) => write!(f, "{}", rssi),
            None => write!(f, "?"),
        }
    }
}

/// When a scan may stop before its window elapses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EarlyStop {
    /// Always wait out the full window
    Never,
    /// Stop on a device matching the early-match address
    EarlyMatch,
    /// Stop on the first device matching the criteria
    FirstMatch,
}

impl EarlyStop {
    fn hit(self, criteria: &FilterCriteria, device: &DiscoveredDevice) -> bool {
        match self {
            Self::Never => false,
            Self::EarlyMatch => criteria.is_early_match(device),
            Self::FirstMatch => criteria.matches(device),
        }
    }
}

/// Unique devices of one scan, in first-seen order
#[derive(Debug, Default)]
struct SeenDevices {
    devices: Vec<DiscoveredDevice>,
    index: HashMap<String, usize>,
}

impl SeenDevices {
    fn record(&mut self, device: DiscoveredDevice) {
        match self.index.get(&device.address) {
            Some(&i) => self.devices[i] = device,
            None => {
                self.index.insert(device.address.clone(), self.devices.len());
                self.devices.push(device);
            }
        }
    }

    fn into_matches(self, criteria: &FilterCriteria) -> Vec<DiscoveredDevice> {
        self.devices.into_iter().filter(|d| criteria.matches(d)).collect()
    }
}

/// Result of one discovery pass
#[derive(Debug, Default)]
struct ScanOutcome {
    early: Option<DiscoveredDevice>,
    candidates: Vec<DiscoveredDevice>,
}

/// BLE scanner applying [`FilterCriteria`] to advertisement reports
#[derive(Clone)]
pub struct Scanner {
    transport: Arc<dyn Transport>,
    shutdown: ShutdownSignal,
}

impl Scanner {
    /// Create a scanner over `transport` that cannot be cancelled
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            shutdown: ShutdownSignal::never(),
        }
    }

    /// Observe `shutdown` at every scan wait
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Collect every matching device seen within `timeout`.
    ///
    /// Returns an empty list, not an error, when nothing matches.
    pub async fn scan(
        &self,
        criteria: &FilterCriteria,
        timeout: Duration,
    ) -> Result<Vec<DiscoveredDevice>, NusError> {
        let outcome = self.run(criteria, timeout, EarlyStop::Never).await?;
        debug!("Scan finished with {} matching device(s)", outcome.candidates.len());
        Ok(outcome.candidates)
    }

    /// Return the first device satisfying the early-match address, or the
    /// first matching device when no early-match address is set.
    pub async fn scan_until(
        &self,
        criteria: &FilterCriteria,
        timeout: Duration,
    ) -> Result<DiscoveredDevice, NusError> {
        let stop = if criteria.early_match_address.is_some() {
            EarlyStop::EarlyMatch
        } else {
            EarlyStop::FirstMatch
        };
        self.run(criteria, timeout, stop)
            .await?
            .early
            .ok_or(NusError::ScanTimeout { timeout })
    }

    /// Scan for the best device to connect to.
    ///
    /// Stops early on the early-match address; otherwise waits out the window
    /// and picks among the candidates with the configured policy.
    pub async fn find_device(
        &self,
        criteria: &FilterCriteria,
        config: &ScanConfig,
    ) -> Result<DiscoveredDevice, NusError> {
        let outcome = self.run(criteria, config.timeout, EarlyStop::EarlyMatch).await?;
        if let Some(device) = outcome.early {
            debug!("Early scan stop on preferred device {}", device.address);
            return Ok(device);
        }
        select_candidate(
            &outcome.candidates,
            criteria.early_match_address.as_deref(),
            config.selection,
        )
        .ok_or(NusError::ScanTimeout {
            timeout: config.timeout,
        })
    }

    async fn run(
        &self,
        criteria: &FilterCriteria,
        timeout: Duration,
        stop: EarlyStop,
    ) -> Result<ScanOutcome, NusError> {
        if timeout.is_zero() {
            return Err(NusError::InvalidArgument("scan timeout must be positive".into()));
        }
        if self.shutdown.is_cancelled() {
            return Err(NusError::Cancelled);
        }

        debug!("Scanning for {:?} (window {:?})", criteria, timeout);
        let mut reports = self.transport.start_discovery().await?;
        let deadline = Instant::now() + timeout;
        let mut seen = SeenDevices::default();

        let result = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break Err(NusError::Cancelled),
                _ = sleep_until(deadline) => break Ok(None),
                report = reports.next() => match report {
                    Some(device) => {
                        let hit = stop.hit(criteria, &device);
                        seen.record(device.clone());
                        if hit {
                            break Ok(Some(device));
                        }
                    }
                    None => {
                        debug!("Discovery stream ended before the scan window");
                        break Ok(None);
                    }
                },
            }
        };

        drop(reports);
        if let Err(e) = self.transport.stop_discovery().await {
            warn!("Failed to stop discovery: {}", e);
        }

        let early = result?;
        Ok(ScanOutcome {
            early,
            candidates: seen.into_matches(criteria),
        })
    }
}

/// Pick one device among `candidates`.
///
/// Devices whose address contains `preferred_address` are considered first
/// when any exist. A warning is logged when the choice is ambiguous.
pub fn select_candidate(
    candidates: &[DiscoveredDevice],
    preferred_address: Option<&str>,
    policy: SelectionPolicy,
) -> Option<DiscoveredDevice> {
    let mut pool: Vec<&DiscoveredDevice> = candidates.iter().collect();
    if let Some(preferred) = preferred_address.map(str::to_lowercase) {
        let narrowed: Vec<&DiscoveredDevice> = pool
            .iter()
            .copied()
            .filter(|d| d.address.to_lowercase().contains(&preferred))
            .collect();
        if !narrowed.is_empty() {
            pool = narrowed;
        }
    }

    if pool.len() > 1 {
        warn!(
            "{} devices match; selecting by {:?}. Use an address filter to disambiguate.",
            pool.len(),
            policy
        );
    }

    let chosen = match policy {
        SelectionPolicy::FirstDiscovered => pool.first().copied(),
        SelectionPolicy::StrongestSignal => pool.iter().copied().fold(None::<&DiscoveredDevice>, |best, d| match best {
            Some(b) if b.signal() >= d.signal() => Some(b),
            _ => Some(d),
        }),
    };

    if let Some(device) = chosen {
        info!(
            "Selected device {} ({}) RSSI={:?}",
            device.display_name(),
            device.address,
            device.rssi
        );
    }
    chosen.cloned()
}

/// Order devices by strongest signal first
pub fn sort_by_signal(devices: &mut [DiscoveredDevice]) {
    devices.sort_by(|a, b| b.signal().cmp(&a.signal()));
}
