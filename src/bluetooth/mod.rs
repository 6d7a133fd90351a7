//! BLE discovery, connection and the Nordic UART Service

use uuid::Uuid;

mod adapter;
pub mod events;
pub mod filter;
mod scanner;
mod scanner_config;
pub mod session;
pub mod transport;

pub use scanner::{select_candidate, sort_by_signal, DiscoveredDevice, Scanner};

pub use adapter::{list_adapters, AdapterInfo, BtleLink, BtleTransport};

pub use scanner_config::{ScanConfig, SelectionPolicy};

pub use filter::{matches, DeviceFilter, FilterCriteria};

pub use session::{Session, SessionHandle, SessionOptions, SessionState};

pub use transport::{AdvertisementStream, Link, LinkEvent, LinkEventStream, Transport};

pub use events::{receiver_to_stream, EventBroker, EventFilter, EventType, LoggerEvent, SubscriberId};

/// Nordic UART Service
pub const NUS_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// RX characteristic, written by the central
pub const NUS_RX_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// TX characteristic, notified by the peripheral
pub const NUS_TX_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);
