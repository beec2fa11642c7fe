//! RIST Peer Bonding
//!
//! This crate implements the multi-peer layer of a RIST context: the peer
//! group and the weighted distribution / duplication of outgoing blocks
//! across its members.

pub mod distribution;
pub mod group;

pub use distribution::Distributor;
pub use group::{GroupError, GroupStats, Member, PeerGroup};
