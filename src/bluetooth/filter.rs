//! Advertisement filtering
//!
//! Pure predicates over discovered devices: name substring, address substring
//! and required service UUID. Each criterion can be disabled independently.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bluetooth::DiscoveredDevice;

/// Filter for Bluetooth devices
pub trait DeviceFilter: Send + Sync {
    /// Check if a device passes the filter
    fn matches(&self, device: &DiscoveredDevice) -> bool;

    /// Apply the filter to a list of devices
    fn apply_filter(&self, devices: &[DiscoveredDevice]) -> Vec<DiscoveredDevice> {
        devices.iter().filter(|d| self.matches(d)).cloned().collect()
    }
}

/// Case-insensitive name substring; an empty substring matches everything
pub struct NameFilter {
    substring: String,
}

impl NameFilter {
    /// Create a new name filter
    pub fn new(substring: &str) -> Self {
        Self {
            substring: substring.trim().to_lowercase(),
        }
    }
}

impl DeviceFilter for NameFilter {
    fn matches(&self, device: &DiscoveredDevice) -> bool {
        if self.substring.is_empty() {
            return true;
        }
        match device.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_lowercase().contains(&self.substring),
            _ => false,
        }
    }
}

/// Case-insensitive address substring; no substring matches everything
pub struct AddressFilter {
    substring: Option<String>,
}

impl AddressFilter {
    /// Create a new address filter
    pub fn new(substring: Option<&str>) -> Self {
        Self {
            substring: substring.map(str::to_lowercase),
        }
    }
}

impl DeviceFilter for AddressFilter {
    fn matches(&self, device: &DiscoveredDevice) -> bool {
        match &self.substring {
            Some(sub) => device.address.to_lowercase().contains(sub),
            None => true,
        }
    }
}

/// Requires a service UUID in advertisement or scan-response data
pub struct ServiceFilter {
    required: Option<Uuid>,
}

impl ServiceFilter {
    /// Create a new service filter
    pub fn new(required: Option<Uuid>) -> Self {
        Self { required }
    }
}

impl DeviceFilter for ServiceFilter {
    fn matches(&self, device: &DiscoveredDevice) -> bool {
        match &self.required {
            Some(uuid) => device.services.contains(uuid),
            None => true,
        }
    }
}

/// Criteria applied to every advertisement during one scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterCriteria {
    /// Name substring, empty for wildcard scanning
    pub name_substring: String,
    /// Address substring
    pub address_substring: Option<String>,
    /// Service that must be advertised
    pub require_service: Option<Uuid>,
    /// Address substring that ends a scan as soon as it is seen
    pub early_match_address: Option<String>,
}

impl FilterCriteria {
    /// Criteria matching `name_substring` with no other requirement
    pub fn new(name_substring: impl Into<String>) -> Self {
        Self {
            name_substring: name_substring.into(),
            ..Self::default()
        }
    }

    /// Criteria matching every device
    pub fn wildcard() -> Self {
        Self::default()
    }

    /// Set the address substring
    pub fn with_address(mut self, address_substring: Option<String>) -> Self {
        self.address_substring = address_substring;
        self
    }

    /// Set the required service
    pub fn with_required_service(mut self, service: Option<Uuid>) -> Self {
        self.require_service = service;
        self
    }

    /// Set the early-match address substring
    pub fn with_early_match(mut self, address_substring: Option<String>) -> Self {
        self.early_match_address = address_substring;
        self
    }

    /// Whether `device` satisfies the criteria and the early-match address
    pub fn is_early_match(&self, device: &DiscoveredDevice) -> bool {
        match &self.early_match_address {
            Some(early) => self.matches(device) && AddressFilter::new(Some(early)).matches(device),
            None => false,
        }
    }
}

impl DeviceFilter for FilterCriteria {
    fn matches(&self, device: &DiscoveredDevice) -> bool {
        NameFilter::new(&self.name_substring).matches(device)
            && AddressFilter::new(self.address_substring.as_deref()).matches(device)
            && ServiceFilter::new(self.require_service).matches(device)
    }
}

/// Check `device` against `criteria`
pub fn matches(device: &DiscoveredDevice, criteria: &FilterCriteria) -> bool {
    criteria.matches(device)
}
