//! Statistics snapshots and quality formulas

use crate::peer::PeerId;
use std::time::{Duration, Instant};

/// Which snapshot variant a context produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsType {
    SenderPeer,
    ReceiverFlow,
}

/// Per-peer sender statistics for one interval
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SenderPeerStats {
    pub peer: Option<PeerId>,
    pub cname: String,
    /// Original data bandwidth (bits per second)
    pub bandwidth: u64,
    /// Retransmission bandwidth (bits per second)
    pub retry_bandwidth: u64,
    pub sent: u64,
    /// Control packets received from the peer
    pub received: u64,
    pub retransmitted: u64,
    pub bloat_skipped: u64,
    pub bandwidth_skipped: u64,
    pub retransmit_skipped: u64,
    pub rtt: Duration,
    pub quality: f64,
}

/// Per-flow receiver statistics for one interval
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReceiverFlowStats {
    pub flow_id: u32,
    pub peer_count: u32,
    /// CNAMEs of contributing peers, comma separated
    pub cnames: String,
    /// Bits per second
    pub bandwidth: u64,
    pub retry_bandwidth: u64,
    pub received: u64,
    pub missing: u64,
    pub reordered: u64,
    pub recovered: u64,
    pub recovered_one_retry: u64,
    pub lost: u64,
    pub duplicates: u64,
    /// Inter-packet spacing in microseconds
    pub min_inter_packet_spacing: u64,
    pub avg_inter_packet_spacing: u64,
    pub max_inter_packet_spacing: u64,
    pub rtt: Duration,
    pub quality: f64,
}

/// One statistics report; exactly one variant per context role
#[derive(Debug, Clone, PartialEq)]
pub enum StatsSnapshot {
    SenderPeer(SenderPeerStats),
    ReceiverFlow(ReceiverFlowStats),
}

impl StatsSnapshot {
    pub fn stats_type(&self) -> StatsType {
        match self {
            StatsSnapshot::SenderPeer(_) => StatsType::SenderPeer,
            StatsSnapshot::ReceiverFlow(_) => StatsType::ReceiverFlow,
        }
    }

    pub fn quality(&self) -> f64 {
        match self {
            StatsSnapshot::SenderPeer(s) => s.quality,
            StatsSnapshot::ReceiverFlow(s) => s.quality,
        }
    }
}

/// Sender quality: share of attempts that were plain first transmissions
pub fn sender_quality(
    sent: u64,
    bloat_skipped: u64,
    bandwidth_skipped: u64,
    retransmit_skipped: u64,
    retransmitted: u64,
) -> f64 {
    let total = sent + bloat_skipped + bandwidth_skipped + retransmit_skipped + retransmitted;
    ratio(sent, total)
}

/// Receiver quality: share of packets that arrived without being missed
pub fn receiver_quality(received: u64, missing: u64) -> f64 {
    ratio(received, received + missing)
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (part as f64 * 100.0 / total as f64).clamp(0.0, 100.0)
}

/// Min/avg/max spacing between consecutive arrivals
#[derive(Debug, Clone, Default)]
pub struct InterPacketSpacing {
    last: Option<Instant>,
    min_us: u64,
    max_us: u64,
    total_us: u64,
    samples: u64,
}

impl InterPacketSpacing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an arrival
    pub fn on_arrival(&mut self, now: Instant) {
        if let Some(last) = self.last {
            let us = now.saturating_duration_since(last).as_micros() as u64;
            if self.samples == 0 {
                self.min_us = us;
                self.max_us = us;
            } else {
                self.min_us = self.min_us.min(us);
                self.max_us = self.max_us.max(us);
            }
            self.total_us += us;
            self.samples += 1;
        }
        self.last = Some(now);
    }

    /// `(min, avg, max)` in microseconds
    pub fn summary(&self) -> (u64, u64, u64) {
        if self.samples == 0 {
            return (0, 0, 0);
        }
        (self.min_us, self.total_us / self.samples, self.max_us)
    }

    /// Start a new interval, keeping the last arrival time
    pub fn reset(&mut self) {
        *self = InterPacketSpacing {
            last: self.last,
            ..Default::default()
        };
    }
}
