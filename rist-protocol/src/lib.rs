//! RIST Protocol Core Implementation
//!
//! This crate implements the transport-independent core of RIST (Reliable
//! Internet Stream Transport): packet structures, sequence arithmetic, NACK
//! encoding, the sender recovery cache and retransmission queue, the
//! receiver reorder buffer, congestion control, the peer state machine,
//! statistics formulas, and peer configuration including URL parsing.
//!
//! Nothing here touches sockets or threads; every time-dependent operation
//! takes `now` from the caller.

pub mod block;
pub mod buffer;
pub mod config;
pub mod congestion;
pub mod loss;
pub mod nack;
pub mod packet;
pub mod peer;
pub mod reorder;
pub mod retransmit;
pub mod sequence;
pub mod stats;
pub mod url;

pub use block::{DataBlock, DataFlags, OobBlock};
pub use buffer::{RecoveryCache, Retransmit};
pub use config::{
    AddressFamily, CongestionMode, ConfigError, PeerConfig, Profile, RecoveryMode, TimingMode,
    RIST_MAX_STRING_LONG, RIST_MAX_STRING_SHORT,
};
pub use congestion::{CongestionController, CongestionStats};
pub use loss::{LossRange, ReceiverLossList, SenderLossList};
pub use nack::{NackInfo, NackMode, RttEstimator};
pub use packet::{
    ControlPacket, ControlType, DataPacket, Packet, PacketError, MAX_PAYLOAD_SIZE,
};
pub use peer::{Peer, PeerId, PeerState};
pub use reorder::{FlowCounters, InsertOutcome, ReorderBuffer, ReorderSettings};
pub use retransmit::{RetransmitCounters, RetransmitQueue};
pub use sequence::SeqNumber;
pub use stats::{
    receiver_quality, sender_quality, InterPacketSpacing, ReceiverFlowStats, SenderPeerStats,
    StatsSnapshot, StatsType,
};
pub use url::{parse_address, parse_udp_address, UdpConfig, UrlError};
