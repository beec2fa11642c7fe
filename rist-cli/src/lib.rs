//! RIST CLI Library
//!
//! Shared functionality for the RIST command-line tools.

pub mod config;
pub mod logging;
pub mod stats;

pub use config::{parse_peers, Config, ConfigError, ProfileName, ReceiverConfig, SenderConfig};
pub use stats::{display_snapshot, format_bandwidth, format_bytes, format_rtt, format_snapshot};
