//! RIST - Reliable Internet Stream Transport
//!
//! Sender and receiver contexts with NACK-based loss recovery, multi-peer
//! bonding and optional AES-GCM payload encryption.
//!
//! ```no_run
//! use rist::{Context, LoggingSettings, PeerConfig, Profile, Role};
//!
//! # fn main() -> rist::Result<()> {
//! let receiver = Context::create(Role::Receiver, Profile::Main, 0, LoggingSettings::default())?;
//! let mut config = PeerConfig::new(":5000");
//! config.initiate_conn = false;
//! receiver.peer_create(&config)?;
//! receiver.start()?;
//!
//! while let Some(block) = receiver.read_data(std::time::Duration::from_secs(1))? {
//!     println!("{} bytes, seq {}", block.len(), block.seq);
//! }
//! # Ok(())
//! # }
//! ```

mod context;
mod endpoint;
mod error;
mod events;
mod flow_id;
mod link;
mod logging;
mod output;
mod receiver;
mod sender;
mod stats;

pub use rist_bonding as bonding;
pub use rist_crypto as crypto;
pub use rist_io as io;
pub use rist_protocol as protocol;

pub use context::{Context, ContextBuilder, Role};
pub use error::{Result, RistError};
pub use events::{
    AuthHandler, AuthRequest, ConnectionCallback, ConnectionEvent, DataCallback, OobCallback,
    StatsCallback,
};
pub use flow_id::flow_id_create;
pub use logging::{LogLevel, LoggingSettings};
pub use output::DEFAULT_FIFO_SIZE;

pub use protocol::{
    parse_address, parse_udp_address, AddressFamily, CongestionMode, DataBlock, DataFlags,
    NackMode, OobBlock, PeerConfig, PeerId, PeerState, Profile, ReceiverFlowStats, RecoveryMode,
    SenderPeerStats, StatsSnapshot, StatsType, TimingMode, UdpConfig,
};

/// The immutable default peer configuration
pub fn peer_config_defaults() -> &'static PeerConfig {
    PeerConfig::defaults()
}

/// Library version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Version of the context API
pub fn api_version() -> &'static str {
    "4.0.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(version(), env!("CARGO_PKG_VERSION"));
        assert!(api_version().starts_with("4."));
    }
}
