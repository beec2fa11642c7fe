//! Application-facing data and out-of-band blocks
//!
//! Payloads are `Bytes`, so the recovery cache, the output queue and the
//! application all share one allocation. A block is released when its last
//! clone is dropped.

use crate::peer::PeerId;
use bytes::Bytes;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Flag bits carried by a [`DataBlock`]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DataFlags(u32);

impl DataFlags {
    /// No flags set
    pub const NONE: DataFlags = DataFlags(0);
    /// Sender: use `seq` from the block instead of assigning one
    pub const USE_SEQ: DataFlags = DataFlags(1 << 0);
    /// Block buffers are owned by the caller until explicitly released
    pub const NEED_FREE: DataFlags = DataFlags(1 << 1);
    /// Receiver: one or more blocks before this one were lost
    pub const DISCONTINUITY: DataFlags = DataFlags(1 << 2);
    /// Receiver: first block delivered for this flow
    pub const FLOW_BUFFER_START: DataFlags = DataFlags(1 << 3);

    /// Raw bit value
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Build from raw bits, ignoring unknown ones
    pub fn from_bits_truncate(bits: u32) -> Self {
        DataFlags(bits & 0x0F)
    }

    /// Check if every bit in `other` is set
    pub fn contains(self, other: DataFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits in `other`
    pub fn insert(&mut self, other: DataFlags) {
        self.0 |= other.0;
    }

    /// Clear the bits in `other`
    pub fn remove(&mut self, other: DataFlags) {
        self.0 &= !other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for DataFlags {
    type Output = DataFlags;

    fn bitor(self, rhs: DataFlags) -> DataFlags {
        DataFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for DataFlags {
    fn bitor_assign(&mut self, rhs: DataFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for DataFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (DataFlags::USE_SEQ, "USE_SEQ"),
            (DataFlags::NEED_FREE, "NEED_FREE"),
            (DataFlags::DISCONTINUITY, "DISCONTINUITY"),
            (DataFlags::FLOW_BUFFER_START, "FLOW_BUFFER_START"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "DataFlags({})", set.join(" | "))
    }
}

/// A unit of application payload
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataBlock {
    pub payload: Bytes,
    /// 64-bit NTP timestamp; 0 on write means "stamp on submission"
    pub ts_ntp: u64,
    pub virt_src_port: u16,
    pub virt_dst_port: u16,
    /// Peer the block arrived from (receiver side)
    pub peer: Option<PeerId>,
    pub flow_id: u32,
    /// Sequence number; only the low 32 bits travel on the wire
    pub seq: u64,
    pub flags: DataFlags,
}

impl DataBlock {
    /// Create a block with the given payload and all other fields defaulted
    pub fn new(payload: impl Into<Bytes>) -> Self {
        DataBlock {
            payload: payload.into(),
            ..Default::default()
        }
    }

    /// Use a caller-assigned sequence number
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self.flags.insert(DataFlags::USE_SEQ);
        self
    }

    /// Set the NTP timestamp
    pub fn with_timestamp(mut self, ts_ntp: u64) -> Self {
        self.ts_ntp = ts_ntp;
        self
    }

    /// Set the virtual destination port
    pub fn with_virt_dst_port(mut self, port: u16) -> Self {
        self.virt_dst_port = port;
        self
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Check if blocks were lost before this one
    pub fn is_discontinuous(&self) -> bool {
        self.flags.contains(DataFlags::DISCONTINUITY)
    }
}

/// Out-of-band block, bound to one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OobBlock {
    pub peer: PeerId,
    pub payload: Bytes,
    pub ts_ntp: u64,
}

impl OobBlock {
    /// Create an OOB block targeting `peer`
    pub fn new(peer: PeerId, payload: impl Into<Bytes>) -> Self {
        OobBlock {
            peer,
            payload: payload.into(),
            ts_ntp: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_distinct() {
        let all = [
            DataFlags::USE_SEQ,
            DataFlags::NEED_FREE,
            DataFlags::DISCONTINUITY,
            DataFlags::FLOW_BUFFER_START,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_eq!(a.bits() & b.bits(), 0);
            }
        }
    }

    #[test]
    fn test_flags_ops() {
        let mut flags = DataFlags::DISCONTINUITY | DataFlags::FLOW_BUFFER_START;
        assert!(flags.contains(DataFlags::DISCONTINUITY));
        assert!(!flags.contains(DataFlags::USE_SEQ));

        flags.remove(DataFlags::DISCONTINUITY);
        assert_eq!(flags, DataFlags::FLOW_BUFFER_START);
        assert_eq!(format!("{:?}", flags), "DataFlags(FLOW_BUFFER_START)");
        assert_eq!(DataFlags::from_bits_truncate(0xFF).bits(), 0x0F);
    }

    #[test]
    fn test_block_shares_payload() {
        let block = DataBlock::new(vec![1u8, 2, 3]).with_seq(77);
        let copy = block.clone();
        assert_eq!(block.payload.as_ptr(), copy.payload.as_ptr());
        assert!(copy.flags.contains(DataFlags::USE_SEQ));
        assert_eq!(copy.seq, 77);
        assert_eq!(copy.len(), 3);
    }
}
