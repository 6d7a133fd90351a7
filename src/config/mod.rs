//! Settings management

mod settings;

pub use settings::{default_settings_path, LoggerSettings};
