//! RIST Packet Structures and Serialization
//!
//! Every datagram starts with one byte holding the protocol version (high
//! nibble) and the packet kind (low nibble). Data packets use a 24-byte
//! header followed by the payload; control packets use a 16-byte header
//! followed by a type-specific body. All fields are network byte order.
//!
//! Data header:
//!
//! ```text
//!  0       1       2               4               6               8
//! +-------+-------+---------------+---------------+---------------+
//! |ver|knd| flags | virt src port | virt dst port |   reserved    |
//! +-------+-------+---------------+---------------+---------------+
//! |            flow id            |           sequence            |
//! +-------------------------------+-------------------------------+
//! |                      NTP timestamp (64 bit)                   |
//! +---------------------------------------------------------------+
//! ```
//!
//! Control header:
//!
//! ```text
//! +-------+-------+---------------+-------------------------------+
//! |ver|knd| type  |  type info    |            flow id            |
//! +-------+-------+---------------+-------------------------------+
//! |                      timestamp (64 bit)                       |
//! +---------------------------------------------------------------+
//! ```

use crate::nack::{NackInfo, NackMode};
use crate::sequence::SeqNumber;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

/// Protocol version carried in the high nibble of the first byte
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the data packet header in bytes
pub const DATA_HEADER_SIZE: usize = 24;

/// Size of the control packet header in bytes
pub const CONTROL_HEADER_SIZE: usize = 16;

/// Largest payload accepted in a single data block
pub const MAX_PAYLOAD_SIZE: usize = 10_000;

/// Room left on the wire for encryption framing around a full block
const SEAL_ALLOWANCE: usize = 64;

/// Data flag: packet is a retransmission
const FLAG_RETRANSMITTED: u8 = 0x01;

/// Packet kind (low nibble of the first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    Data = 1,
    Control = 2,
}

impl PacketKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(PacketKind::Data),
            2 => Some(PacketKind::Control),
            _ => None,
        }
    }
}

/// Control packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlType {
    /// Liveness signal, body carries the sender CNAME
    Keepalive = 1,
    /// Loss report as (start, extra count) pairs
    NackRange = 2,
    /// Loss report as (base, 16-bit mask) pairs
    NackBitmask = 3,
    /// RTT request, body carries the local echo timestamp
    EchoRequest = 4,
    /// RTT reply, body echoes the request timestamp
    EchoResponse = 5,
    /// Out-of-band payload
    Oob = 6,
    /// Graceful disconnect
    Shutdown = 7,
}

impl ControlType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ControlType::Keepalive),
            2 => Some(ControlType::NackRange),
            3 => Some(ControlType::NackBitmask),
            4 => Some(ControlType::EchoRequest),
            5 => Some(ControlType::EchoResponse),
            6 => Some(ControlType::Oob),
            7 => Some(ControlType::Shutdown),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Packet parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown packet kind {0}")]
    UnknownKind(u8),

    #[error("Unknown control type {0}")]
    UnknownControlType(u8),

    #[error("Wrong packet type: expected {expected}, got {actual}")]
    WrongPacketType {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Malformed control body for {0:?}")]
    MalformedBody(ControlType),
}

fn split_first_byte(byte: u8) -> Result<PacketKind, PacketError> {
    let version = byte >> 4;
    if version != PROTOCOL_VERSION {
        return Err(PacketError::UnsupportedVersion(version));
    }
    PacketKind::from_u8(byte & 0x0F).ok_or(PacketError::UnknownKind(byte & 0x0F))
}

#[inline]
fn first_byte(kind: PacketKind) -> u8 {
    (PROTOCOL_VERSION << 4) | kind as u8
}

/// Data packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub flow_id: u32,
    pub seq: SeqNumber,
    /// 64-bit NTP timestamp taken when the block entered the sender
    pub ts_ntp: u64,
    pub virt_src_port: u16,
    pub virt_dst_port: u16,
    pub retransmitted: bool,
    pub payload: Bytes,
}

impl DataPacket {
    /// Create a new data packet
    pub fn new(flow_id: u32, seq: SeqNumber, ts_ntp: u64, payload: Bytes) -> Self {
        DataPacket {
            flow_id,
            seq,
            ts_ntp,
            virt_src_port: 0,
            virt_dst_port: 0,
            retransmitted: false,
            payload,
        }
    }

    /// Set the virtual ports
    pub fn with_ports(mut self, virt_src_port: u16, virt_dst_port: u16) -> Self {
        self.virt_src_port = virt_src_port;
        self.virt_dst_port = virt_dst_port;
        self
    }

    /// Total size of the packet (header + payload)
    pub fn size(&self) -> usize {
        DATA_HEADER_SIZE + self.payload.len()
    }

    /// Serialize the packet to bytes
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.size());
        buf.put_u8(first_byte(PacketKind::Data));
        buf.put_u8(if self.retransmitted {
            FLAG_RETRANSMITTED
        } else {
            0
        });
        buf.put_u16(self.virt_src_port);
        buf.put_u16(self.virt_dst_port);
        buf.put_u16(0);
        buf.put_u32(self.flow_id);
        buf.put_u32(self.seq.as_raw());
        buf.put_u64(self.ts_ntp);
        buf.put_slice(&self.payload);
        buf
    }

    /// Parse a data packet, sharing the payload with `bytes`
    pub fn from_bytes(bytes: Bytes) -> Result<Self, PacketError> {
        if bytes.len() < DATA_HEADER_SIZE {
            return Err(PacketError::InsufficientData {
                expected: DATA_HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let mut buf = &bytes[..DATA_HEADER_SIZE];
        if split_first_byte(buf.get_u8())? != PacketKind::Data {
            return Err(PacketError::WrongPacketType {
                expected: "data",
                actual: "control",
            });
        }
        let flags = buf.get_u8();
        let virt_src_port = buf.get_u16();
        let virt_dst_port = buf.get_u16();
        let _reserved = buf.get_u16();
        let flow_id = buf.get_u32();
        let seq = SeqNumber::new(buf.get_u32());
        let ts_ntp = buf.get_u64();

        let payload = bytes.slice(DATA_HEADER_SIZE..);
        if payload.len() > MAX_PAYLOAD_SIZE + SEAL_ALLOWANCE {
            return Err(PacketError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE + SEAL_ALLOWANCE,
            });
        }

        Ok(DataPacket {
            flow_id,
            seq,
            ts_ntp,
            virt_src_port,
            virt_dst_port,
            retransmitted: flags & FLAG_RETRANSMITTED != 0,
            payload,
        })
    }
}

/// Control packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub control_type: ControlType,
    /// Type-specific 16-bit field
    pub type_info: u16,
    pub flow_id: u32,
    pub timestamp: u64,
    pub body: Bytes,
}

impl ControlPacket {
    /// Create a new control packet
    pub fn new(control_type: ControlType, flow_id: u32, timestamp: u64, body: Bytes) -> Self {
        ControlPacket {
            control_type,
            type_info: 0,
            flow_id,
            timestamp,
            body,
        }
    }

    /// Keepalive carrying the local CNAME
    pub fn keepalive(flow_id: u32, timestamp: u64, cname: &str) -> Self {
        let name = cname.as_bytes();
        let len = name.len().min(u8::MAX as usize);
        let mut body = BytesMut::with_capacity(1 + len);
        body.put_u8(len as u8);
        body.put_slice(&name[..len]);
        ControlPacket::new(ControlType::Keepalive, flow_id, timestamp, body.freeze())
    }

    /// RTT echo request; `echo_us` is returned untouched in the response
    pub fn echo_request(flow_id: u32, timestamp: u64, echo_us: u64) -> Self {
        let mut body = BytesMut::with_capacity(8);
        body.put_u64(echo_us);
        ControlPacket::new(ControlType::EchoRequest, flow_id, timestamp, body.freeze())
    }

    /// RTT echo response for a request body
    pub fn echo_response(flow_id: u32, timestamp: u64, echo_us: u64) -> Self {
        let mut body = BytesMut::with_capacity(8);
        body.put_u64(echo_us);
        ControlPacket::new(ControlType::EchoResponse, flow_id, timestamp, body.freeze())
    }

    /// NACK for the given losses in the requested encoding
    pub fn nack(flow_id: u32, timestamp: u64, info: &NackInfo, mode: NackMode) -> Self {
        let control_type = match mode {
            NackMode::Range => ControlType::NackRange,
            NackMode::Bitmask => ControlType::NackBitmask,
        };
        ControlPacket::new(control_type, flow_id, timestamp, info.encode(mode))
    }

    /// Out-of-band payload
    pub fn oob(flow_id: u32, timestamp: u64, payload: Bytes) -> Self {
        ControlPacket::new(ControlType::Oob, flow_id, timestamp, payload)
    }

    /// Graceful disconnect notice
    pub fn shutdown(flow_id: u32, timestamp: u64) -> Self {
        ControlPacket::new(ControlType::Shutdown, flow_id, timestamp, Bytes::new())
    }

    /// CNAME carried by a keepalive
    pub fn keepalive_cname(&self) -> Result<String, PacketError> {
        let mut body = &self.body[..];
        if self.control_type != ControlType::Keepalive || body.is_empty() {
            return Err(PacketError::MalformedBody(self.control_type));
        }
        let len = body.get_u8() as usize;
        if body.len() < len {
            return Err(PacketError::MalformedBody(self.control_type));
        }
        Ok(String::from_utf8_lossy(&body[..len]).into_owned())
    }

    /// Echo timestamp carried by an echo request or response
    pub fn echo_timestamp(&self) -> Result<u64, PacketError> {
        match self.control_type {
            ControlType::EchoRequest | ControlType::EchoResponse if self.body.len() >= 8 => {
                Ok((&self.body[..8]).get_u64())
            }
            other => Err(PacketError::MalformedBody(other)),
        }
    }

    /// Losses carried by either NACK encoding
    pub fn nack_info(&self) -> Result<NackInfo, PacketError> {
        let mode = match self.control_type {
            ControlType::NackRange => NackMode::Range,
            ControlType::NackBitmask => NackMode::Bitmask,
            other => return Err(PacketError::MalformedBody(other)),
        };
        NackInfo::decode(mode, &self.body).ok_or(PacketError::MalformedBody(self.control_type))
    }

    /// Total size of the packet (header + body)
    pub fn size(&self) -> usize {
        CONTROL_HEADER_SIZE + self.body.len()
    }

    /// Serialize the packet to bytes
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.size());
        buf.put_u8(first_byte(PacketKind::Control));
        buf.put_u8(self.control_type.as_u8());
        buf.put_u16(self.type_info);
        buf.put_u32(self.flow_id);
        buf.put_u64(self.timestamp);
        buf.put_slice(&self.body);
        buf
    }

    /// Parse a control packet, sharing the body with `bytes`
    pub fn from_bytes(bytes: Bytes) -> Result<Self, PacketError> {
        if bytes.len() < CONTROL_HEADER_SIZE {
            return Err(PacketError::InsufficientData {
                expected: CONTROL_HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let mut buf = &bytes[..CONTROL_HEADER_SIZE];
        if split_first_byte(buf.get_u8())? != PacketKind::Control {
            return Err(PacketError::WrongPacketType {
                expected: "control",
                actual: "data",
            });
        }
        let raw_type = buf.get_u8();
        let control_type =
            ControlType::from_u8(raw_type).ok_or(PacketError::UnknownControlType(raw_type))?;
        let type_info = buf.get_u16();
        let flow_id = buf.get_u32();
        let timestamp = buf.get_u64();

        Ok(ControlPacket {
            control_type,
            type_info,
            flow_id,
            timestamp,
            body: bytes.slice(CONTROL_HEADER_SIZE..),
        })
    }
}

/// Unified packet type (either data or control)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Data(DataPacket),
    Control(ControlPacket),
}

impl Packet {
    /// Check if this is a data packet
    pub fn is_data(&self) -> bool {
        matches!(self, Packet::Data(_))
    }

    /// Check if this is a control packet
    pub fn is_control(&self) -> bool {
        matches!(self, Packet::Control(_))
    }

    /// Flow identifier carried in the header
    pub fn flow_id(&self) -> u32 {
        match self {
            Packet::Data(p) => p.flow_id,
            Packet::Control(p) => p.flow_id,
        }
    }

    /// Total size of the packet
    pub fn size(&self) -> usize {
        match self {
            Packet::Data(p) => p.size(),
            Packet::Control(p) => p.size(),
        }
    }

    /// Serialize the packet to bytes
    pub fn to_bytes(&self) -> BytesMut {
        match self {
            Packet::Data(p) => p.to_bytes(),
            Packet::Control(p) => p.to_bytes(),
        }
    }

    /// Parse any packet, dispatching on the kind nibble
    pub fn from_bytes(bytes: Bytes) -> Result<Self, PacketError> {
        let Some(&first) = bytes.first() else {
            return Err(PacketError::InsufficientData {
                expected: 1,
                actual: 0,
            });
        };

        match split_first_byte(first)? {
            PacketKind::Data => DataPacket::from_bytes(bytes).map(Packet::Data),
            PacketKind::Control => ControlPacket::from_bytes(bytes).map(Packet::Control),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packet::Data(p) => write!(
                f,
                "DATA flow={} seq={} len={}{}",
                p.flow_id,
                p.seq,
                p.payload.len(),
                if p.retransmitted { " (rexmit)" } else { "" }
            ),
            Packet::Control(p) => write!(
                f,
                "CTRL {:?} flow={} len={}",
                p.control_type,
                p.flow_id,
                p.body.len()
            ),
        }
    }
}
