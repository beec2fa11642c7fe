//! Sender-side recovery cache
//!
//! Every data packet sent on a flow is kept here until it ages out of the
//! recovery window, so NACKed sequence numbers can be retransmitted. The
//! cache is bounded twice: by time (`recovery_length_max`) and by bytes
//! (`recovery_maxbitrate` over the window). The byte bound only evicts
//! entries older than `recovery_length_min`.

use crate::packet::DataPacket;
use crate::peer::PeerId;
use crate::sequence::SeqNumber;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct CacheEntry {
    packet: DataPacket,
    first_sent: Instant,
    /// Retransmissions per peer and the time of the latest one
    retries: HashMap<PeerId, (u32, Instant)>,
}

/// Outcome of a retransmission request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retransmit {
    /// Packet to resend, flagged as retransmitted, with the retry count
    Found(DataPacket, u32),
    /// Retry limit reached for this peer
    Exhausted,
    /// Not cached (never sent, evicted, or dropped earlier)
    Missing,
    /// Resent to this peer too recently
    TooSoon,
}

/// Recovery cache for one sender flow
#[derive(Debug)]
pub struct RecoveryCache {
    entries: HashMap<SeqNumber, CacheEntry>,
    /// Insertion order for eviction
    order: VecDeque<(SeqNumber, Instant)>,
    total_bytes: u64,
    length_min: Duration,
    length_max: Duration,
    byte_cap: u64,
    max_retries: u32,
}

impl RecoveryCache {
    /// Create a new cache
    ///
    /// # Arguments
    /// * `length_min` - Entries younger than this survive the byte cap
    /// * `length_max` - Entries older than this are always evicted
    /// * `byte_cap` - Payload bytes retained before early eviction kicks in
    /// * `max_retries` - Retransmissions allowed per peer per packet
    pub fn new(length_min: Duration, length_max: Duration, byte_cap: u64, max_retries: u32) -> Self {
        RecoveryCache {
            entries: HashMap::new(),
            order: VecDeque::new(),
            total_bytes: 0,
            length_min,
            length_max,
            byte_cap,
            max_retries,
        }
    }

    /// Store a freshly sent packet
    pub fn insert(&mut self, packet: DataPacket, now: Instant) {
        let seq = packet.seq;
        if let Some(old) = self.entries.remove(&seq) {
            self.total_bytes -= old.packet.payload.len() as u64;
        }
        self.total_bytes += packet.payload.len() as u64;
        self.entries.insert(
            seq,
            CacheEntry {
                packet,
                first_sent: now,
                retries: HashMap::new(),
            },
        );
        self.order.push_back((seq, now));
    }

    /// Look up a packet for retransmission to `peer`
    ///
    /// `min_gap` is the minimum spacing between two retransmissions of the
    /// same packet to the same peer.
    pub fn retransmit(
        &mut self,
        seq: SeqNumber,
        peer: PeerId,
        min_gap: Duration,
        now: Instant,
    ) -> Retransmit {
        let Some(entry) = self.entries.get_mut(&seq) else {
            return Retransmit::Missing;
        };

        let (count, last) = entry.retries.get(&peer).copied().unwrap_or((0, entry.first_sent));
        if count >= self.max_retries {
            return Retransmit::Exhausted;
        }
        if count > 0 && now.saturating_duration_since(last) < min_gap {
            return Retransmit::TooSoon;
        }

        entry.retries.insert(peer, (count + 1, now));
        let mut packet = entry.packet.clone();
        packet.retransmitted = true;
        Retransmit::Found(packet, count + 1)
    }

    /// Retransmissions so far of `seq` to `peer`
    pub fn retries(&self, seq: SeqNumber, peer: PeerId) -> u32 {
        self.entries
            .get(&seq)
            .and_then(|e| e.retries.get(&peer))
            .map_or(0, |(count, _)| *count)
    }

    /// Payload length of a cached packet
    pub fn packet_len(&self, seq: SeqNumber) -> Option<usize> {
        self.entries.get(&seq).map(|e| e.packet.payload.len())
    }

    /// Check if a packet will age out of the window within `horizon`
    pub fn expires_within(&self, seq: SeqNumber, horizon: Duration, now: Instant) -> bool {
        match self.entries.get(&seq) {
            Some(entry) => entry.first_sent + self.length_max <= now + horizon,
            None => true,
        }
    }

    /// Drop a cached packet
    pub fn remove(&mut self, seq: SeqNumber) -> bool {
        match self.entries.remove(&seq) {
            Some(entry) => {
                self.total_bytes -= entry.packet.payload.len() as u64;
                true
            }
            None => false,
        }
    }

    /// Evict expired entries; returns how many were dropped
    pub fn evict(&mut self, now: Instant) -> usize {
        let mut evicted = 0;

        while let Some(&(seq, inserted)) = self.order.front() {
            let age = now.saturating_duration_since(inserted);
            let over_time = age >= self.length_max;
            let over_bytes = self.total_bytes > self.byte_cap && age >= self.length_min;
            if !over_time && !over_bytes {
                break;
            }

            self.order.pop_front();
            // Skip stale order records left by removals or re-inserts
            let current = self
                .entries
                .get(&seq)
                .map_or(false, |e| e.first_sent == inserted);
            if current && self.remove(seq) {
                evicted += 1;
            }
        }

        evicted
    }

    pub fn contains(&self, seq: SeqNumber) -> bool {
        self.entries.contains_key(&seq)
    }

    /// Number of cached packets
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached payload bytes
    pub fn bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Release everything
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.total_bytes = 0;
    }
}
