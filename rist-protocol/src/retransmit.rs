//! Sender-side retransmission scheduling
//!
//! NACKed sequence numbers for one peer wait in a [`SenderLossList`] until
//! the timer drains them. Each one is checked against the recovery cache
//! and the congestion budget; packets that cannot go out this interval are
//! deferred, unless they are about to leave the recovery window, in which
//! case they are dropped.

use crate::buffer::{RecoveryCache, Retransmit};
use crate::congestion::CongestionController;
use crate::loss::SenderLossList;
use crate::nack::NackInfo;
use crate::packet::DataPacket;
use crate::peer::PeerId;
use crate::sequence::SeqNumber;
use std::time::{Duration, Instant};
use tracing::trace;

/// Sender-side skip counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetransmitCounters {
    pub retransmitted: u64,
    /// Requests ignored because the packet was resent within rtt/2
    pub bloat_skipped: u64,
    /// Requests deferred for lack of congestion budget
    pub bandwidth_skipped: u64,
    /// Requests dropped: not cached, retries exhausted, or about to expire
    pub retransmit_skipped: u64,
}

impl RetransmitCounters {
    /// Counters accumulated since `earlier`
    pub fn delta(&self, earlier: &RetransmitCounters) -> RetransmitCounters {
        RetransmitCounters {
            retransmitted: self.retransmitted.saturating_sub(earlier.retransmitted),
            bloat_skipped: self.bloat_skipped.saturating_sub(earlier.bloat_skipped),
            bandwidth_skipped: self.bandwidth_skipped.saturating_sub(earlier.bandwidth_skipped),
            retransmit_skipped: self
                .retransmit_skipped
                .saturating_sub(earlier.retransmit_skipped),
        }
    }
}

/// Retransmission queue for one peer
#[derive(Debug)]
pub struct RetransmitQueue {
    peer: PeerId,
    pending: SenderLossList,
    congestion: CongestionController,
    counters: RetransmitCounters,
}

impl RetransmitQueue {
    pub fn new(peer: PeerId, congestion: CongestionController) -> Self {
        RetransmitQueue {
            peer,
            pending: SenderLossList::new(),
            congestion,
            counters: RetransmitCounters::default(),
        }
    }

    /// Queue every sequence number in a NACK
    pub fn on_nack(&mut self, info: &NackInfo, now: Instant) {
        self.congestion.on_nack(info.seq_count());
        for range in &info.loss_ranges {
            self.pending.add_range(*range, now);
        }
    }

    /// Record an original data packet sent to this peer
    pub fn on_data_sent(&mut self, bytes: usize) {
        self.congestion.on_data_sent(bytes);
    }

    /// Produce the packets to resend now
    ///
    /// `interval` is the time until the next drain; packets expiring before
    /// then are dropped instead of deferred.
    pub fn drain(
        &mut self,
        cache: &mut RecoveryCache,
        rtt: Duration,
        interval: Duration,
        now: Instant,
    ) -> Vec<DataPacket> {
        let mut out = Vec::new();
        let mut deferred: Vec<SeqNumber> = Vec::new();

        while let Some(seq) = self.pending.pop_next() {
            let Some(len) = cache.packet_len(seq) else {
                self.counters.retransmit_skipped += 1;
                continue;
            };

            let retry = cache.retries(seq, self.peer) + 1;
            if !self.congestion.try_consume(len, retry) {
                if cache.expires_within(seq, interval, now) {
                    self.counters.retransmit_skipped += 1;
                    trace!(%seq, "no budget before window expiry, dropping retransmission");
                } else {
                    self.counters.bandwidth_skipped += 1;
                    deferred.push(seq);
                }
                continue;
            }

            match cache.retransmit(seq, self.peer, rtt / 2, now) {
                Retransmit::Found(packet, _) => {
                    self.counters.retransmitted += 1;
                    out.push(packet);
                }
                Retransmit::TooSoon => {
                    self.congestion.refund(len);
                    self.counters.bloat_skipped += 1;
                }
                Retransmit::Exhausted | Retransmit::Missing => {
                    self.congestion.refund(len);
                    self.counters.retransmit_skipped += 1;
                }
            }
        }

        for seq in deferred {
            self.pending.add(seq, now);
        }
        out
    }

    /// Close a statistics interval on the congestion controller
    pub fn on_interval(&mut self, elapsed: Duration) -> crate::congestion::CongestionStats {
        self.congestion.on_interval(elapsed)
    }

    pub fn congestion(&self) -> &CongestionController {
        &self.congestion
    }

    pub fn counters(&self) -> RetransmitCounters {
        self.counters
    }

    /// Sequence numbers waiting to be resent
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CongestionMode, PeerConfig};
    use crate::loss::LossRange;
    use bytes::Bytes;

    const PEER: PeerId = PeerId::new(3);
    const RTT: Duration = Duration::from_millis(50);
    const TICK: Duration = Duration::from_millis(10);

    fn cache_with(now: Instant, seqs: std::ops::Range<u32>) -> RecoveryCache {
        let mut cache =
            RecoveryCache::new(Duration::from_secs(1), Duration::from_secs(1), u64::MAX, 4);
        for seq in seqs {
            cache.insert(
                DataPacket::new(1, SeqNumber::new(seq), 0, Bytes::from(vec![0u8; 100])),
                now,
            );
        }
        cache
    }

    fn queue(return_kbps: u32, min_retries: u32) -> RetransmitQueue {
        let config = PeerConfig {
            congestion_control: CongestionMode::Normal,
            recovery_maxbitrate_return: return_kbps,
            min_retries,
            ..PeerConfig::default()
        };
        RetransmitQueue::new(PEER, CongestionController::new(&config, Duration::from_secs(1)))
    }

    fn nack(start: u32, end: u32) -> NackInfo {
        NackInfo::new(vec![LossRange::new(SeqNumber::new(start), SeqNumber::new(end))])
    }

    #[test]
    fn test_drain_resends_cached() {
        let now = Instant::now();
        let mut cache = cache_with(now, 0..10);
        let mut queue = queue(0, 0);

        queue.on_nack(&nack(3, 5), now);
        let out = queue.drain(&mut cache, RTT, TICK, now);
        let seqs: Vec<u32> = out.iter().map(|p| p.seq.as_raw()).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert!(out.iter().all(|p| p.retransmitted));
        assert_eq!(queue.counters().retransmitted, 3);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_missing_counts_as_skipped() {
        let now = Instant::now();
        let mut cache = cache_with(now, 0..2);
        let mut queue = queue(0, 0);

        queue.on_nack(&nack(1, 3), now);
        assert_eq!(queue.drain(&mut cache, RTT, TICK, now).len(), 1);
        assert_eq!(queue.counters().retransmit_skipped, 2);
    }

    #[test]
    fn test_bloat_skip() {
        let now = Instant::now();
        let mut cache = cache_with(now, 0..2);
        let mut queue = queue(0, 0);

        queue.on_nack(&nack(1, 1), now);
        assert_eq!(queue.drain(&mut cache, RTT, TICK, now).len(), 1);
        queue.on_nack(&nack(1, 1), now);
        assert!(queue.drain(&mut cache, RTT, TICK, now + TICK).is_empty());
        assert_eq!(queue.counters().bloat_skipped, 1);
    }

    #[test]
    fn test_budget_defers() {
        let now = Instant::now();
        let mut cache = cache_with(now, 0..10);
        // 2 kbps for one second leaves room for two packets
        let mut queue = queue(2, 0);
        assert_eq!(queue.congestion().budget(), 250);

        queue.on_nack(&nack(0, 4), now);
        assert_eq!(queue.drain(&mut cache, RTT, TICK, now).len(), 2);
        assert_eq!(queue.counters().bandwidth_skipped, 3);
        assert_eq!(queue.pending(), 3);
    }

    #[test]
    fn test_budget_drops_expiring() {
        let now = Instant::now();
        let mut cache = cache_with(now, 0..10);
        let mut queue = queue(2, 0);

        queue.on_nack(&nack(0, 4), now);
        let late = now + Duration::from_millis(995);
        assert_eq!(queue.drain(&mut cache, RTT, TICK, late).len(), 2);
        assert_eq!(queue.counters().retransmit_skipped, 3);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_counters_delta() {
        let a = RetransmitCounters {
            retransmitted: 4,
            ..Default::default()
        };
        let b = RetransmitCounters {
            retransmitted: 9,
            bloat_skipped: 1,
            ..Default::default()
        };
        let d = b.delta(&a);
        assert_eq!(d.retransmitted, 5);
        assert_eq!(d.bloat_skipped, 1);
    }
}
