//! Shared building blocks for the Pulse tracking SDK: configuration, error
//! types, the wire data model, injectable environment capabilities and the
//! error channel.

pub mod capture;
pub mod config;
pub mod environment;
pub mod error;
pub mod reporter;
pub mod types;

pub use config::{BandwidthConfig, BandwidthSetting, PrivacyConfig, TrackerConfig};
pub use environment::Capabilities;
pub use error::{ErrorKind, PulseError, PulseResult, TrackerError};
pub use reporter::{ErrorCallback, ErrorReporter};
