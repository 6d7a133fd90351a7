// Root module exports
pub mod bluetooth;
pub mod cli;
pub mod config;
pub mod error;
pub mod framing;
pub mod lifecycle;
pub mod logger_controller;
pub mod logging;
pub mod output;
pub mod reconnect;
pub mod wizard;

// Re-exports for convenience
pub use bluetooth::{
    DiscoveredDevice, EventBroker, EventFilter, FilterCriteria, LoggerEvent, Scanner, Session, SessionHandle,
    Transport, NUS_RX_CHAR_UUID, NUS_SERVICE_UUID, NUS_TX_CHAR_UUID,
};
pub use config::LoggerSettings;
pub use error::NusError;
pub use framing::{LineFramer, LogLine};
pub use lifecycle::{ShutdownHandle, ShutdownSignal};
pub use logger_controller::{LoggerController, LoggerStatus, RunSummary, StopReason};
pub use logging::init_logger;
pub use reconnect::{ReconnectController, ReconnectPolicy, RetryState, StreamEvent};
