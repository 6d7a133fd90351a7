//! Transport seam between the logger core and a platform Bluetooth stack
//!
//! The core only needs advertisement scanning, connect/disconnect by address,
//! NUS notifications, RX writes and a link-loss signal. [`crate::bluetooth::BtleTransport`]
//! implements this on top of btleplug; tests supply an in-memory transport.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::bluetooth::DiscoveredDevice;
use crate::error::NusError;

/// Advertisement reports produced while discovery is running.
///
/// The same address may be reported many times; later reports carry the
/// freshest advertisement and scan-response data.
pub type AdvertisementStream = BoxStream<'static, DiscoveredDevice>;

/// Events delivered by one live link
pub type LinkEventStream = BoxStream<'static, LinkEvent>;

/// Something that happened on a live link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A notification chunk from the TX characteristic
    Notification(Vec<u8>),
    /// The stack reported that the link is gone
    Disconnected,
}

/// Platform Bluetooth stack capable of discovering and connecting devices
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start advertisement discovery
    async fn start_discovery(&self) -> Result<AdvertisementStream, NusError>;

    /// Stop advertisement discovery
    async fn stop_discovery(&self) -> Result<(), NusError>;

    /// Establish a transport-level connection to `address`
    async fn connect(&self, address: &str) -> Result<Box<dyn Link>, NusError>;

    /// Abandon an in-flight or half-open connection to `address`
    async fn cancel_connect(&self, address: &str) -> Result<(), NusError>;
}

/// One connection to a peripheral
#[async_trait]
pub trait Link: Send + Sync {
    /// Platform address of the connected peripheral
    fn address(&self) -> String;

    /// Discover the NUS service and subscribe to TX notifications.
    ///
    /// The returned stream ends, or yields [`LinkEvent::Disconnected`], when
    /// the link is lost.
    async fn subscribe(&self) -> Result<LinkEventStream, NusError>;

    /// Write bytes to the RX characteristic
    async fn write(&self, data: &[u8]) -> Result<(), NusError>;

    /// Tear the connection down. Must tolerate an already lost link.
    async fn disconnect(&self) -> Result<(), NusError>;

    /// Whether the stack still considers the link connected
    async fn is_connected(&self) -> bool;

    /// Multi-line dump of discovered services and characteristics
    async fn describe_services(&self) -> Result<String, NusError>;
}
