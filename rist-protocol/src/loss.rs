//! Loss list tracking for RIST
//!
//! Tracks missing sequence numbers for NACK generation on the receiver and
//! retransmission scheduling on the sender. Callers pass `now` explicitly so
//! the timers driving NACKs can be tested without sleeping.

use crate::sequence::SeqNumber;
use std::time::{Duration, Instant};

/// Loss sequence range (inclusive)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossRange {
    /// First sequence number in range
    pub start: SeqNumber,
    /// Last sequence number in range (inclusive)
    pub end: SeqNumber,
}

impl LossRange {
    /// Create a new loss range
    pub fn new(start: SeqNumber, end: SeqNumber) -> Self {
        LossRange { start, end }
    }

    /// Create a single-packet loss range
    pub fn single(seq: SeqNumber) -> Self {
        LossRange {
            start: seq,
            end: seq,
        }
    }

    /// Check if this range contains a sequence number
    pub fn contains(&self, seq: SeqNumber) -> bool {
        seq.ge(self.start) && seq.le(self.end)
    }

    /// Get the length of this range
    pub fn len(&self) -> usize {
        self.end.as_raw().wrapping_sub(self.start.as_raw()) as usize + 1
    }

    /// Check if this is a single packet
    pub fn is_single(&self) -> bool {
        self.start == self.end
    }

    /// Merge with another range if they overlap or are adjacent
    pub fn try_merge(&self, other: &LossRange) -> Option<LossRange> {
        if other.start.le(self.end.next()) && other.end.ge(self.start - 1) {
            Some(LossRange {
                start: if self.start.lt(other.start) {
                    self.start
                } else {
                    other.start
                },
                end: if self.end.gt(other.end) {
                    self.end
                } else {
                    other.end
                },
            })
        } else {
            None
        }
    }
}

/// Loss entry with timing information
#[derive(Debug, Clone)]
struct LossEntry {
    range: LossRange,
    /// Time when loss was first detected
    detected_at: Instant,
    /// Time when NACK was last sent
    last_nak_sent: Option<Instant>,
    /// Number of NACKs sent for this loss
    nak_count: u32,
}

/// Loss list for tracking packet losses
///
/// Entries stay sorted by sequence number and adjacent entries with the same
/// NACK history are merged.
#[derive(Debug)]
pub struct LossList {
    losses: Vec<LossEntry>,
    /// Maximum number of NACKs to send for a single loss
    max_nak_count: u32,
}

impl LossList {
    /// Create a new loss list
    pub fn new(max_nak_count: u32) -> Self {
        LossList {
            losses: Vec::new(),
            max_nak_count,
        }
    }

    /// Add a lost packet
    pub fn add(&mut self, seq: SeqNumber, now: Instant) {
        self.add_range(LossRange::single(seq), now);
    }

    /// Add a range of lost packets
    pub fn add_range(&mut self, range: LossRange, now: Instant) {
        let mut merged = LossEntry {
            range,
            detected_at: now,
            last_nak_sent: None,
            nak_count: 0,
        };
        let mut new_losses = Vec::with_capacity(self.losses.len() + 1);

        for existing in self.losses.drain(..) {
            if let Some(merged_range) = merged.range.try_merge(&existing.range) {
                merged.range = merged_range;
                if existing.detected_at < merged.detected_at {
                    merged.detected_at = existing.detected_at;
                }
                merged.last_nak_sent = merged.last_nak_sent.max(existing.last_nak_sent);
                merged.nak_count = merged.nak_count.max(existing.nak_count);
            } else if existing.range.start.lt(merged.range.start) {
                new_losses.push(existing);
            } else {
                new_losses.push(merged);
                merged = existing;
            }
        }

        new_losses.push(merged);
        self.losses = new_losses;
    }

    /// Remove a sequence number (packet recovered)
    pub fn remove(&mut self, seq: SeqNumber) {
        let Some(index) = self.losses.iter().position(|e| e.range.contains(seq)) else {
            return;
        };

        let entry = self.losses.remove(index);
        if entry.range.is_single() {
            return;
        }

        let mut pieces = Vec::with_capacity(2);
        if seq != entry.range.start {
            pieces.push(LossEntry {
                range: LossRange::new(entry.range.start, seq - 1),
                ..entry.clone()
            });
        }
        if seq != entry.range.end {
            pieces.push(LossEntry {
                range: LossRange::new(seq.next(), entry.range.end),
                ..entry
            });
        }
        for (offset, piece) in pieces.into_iter().enumerate() {
            self.losses.insert(index + offset, piece);
        }
    }

    /// Remove all losses up to and including a sequence number
    pub fn remove_up_to(&mut self, seq: SeqNumber) {
        self.losses.retain(|entry| entry.range.end.gt(seq));

        if let Some(first) = self.losses.first_mut() {
            if first.range.start.le(seq) {
                first.range.start = seq.next();
            }
        }
    }

    /// Get ranges that are due for a NACK and mark them as sent
    ///
    /// A loss is first reported `first_delay` after detection, then every
    /// `interval` until it has been reported `max_nak_count` times.
    pub fn get_nak_ranges(
        &mut self,
        now: Instant,
        first_delay: Duration,
        interval: Duration,
    ) -> Vec<LossRange> {
        let mut ranges = Vec::new();

        for entry in &mut self.losses {
            if entry.nak_count >= self.max_nak_count {
                continue;
            }
            let due = match entry.last_nak_sent {
                None => now.saturating_duration_since(entry.detected_at) >= first_delay,
                Some(last_sent) => now.saturating_duration_since(last_sent) >= interval,
            };

            if due {
                ranges.push(entry.range);
                entry.last_nak_sent = Some(now);
                entry.nak_count += 1;
            }
        }

        ranges
    }

    /// Number of NACKs already sent for a sequence number
    pub fn nak_count(&self, seq: SeqNumber) -> Option<u32> {
        self.losses
            .iter()
            .find(|e| e.range.contains(seq))
            .map(|e| e.nak_count)
    }

    /// Get all loss ranges (for inspection)
    pub fn ranges(&self) -> Vec<LossRange> {
        self.losses.iter().map(|e| e.range).collect()
    }

    /// First (oldest) loss range
    pub fn first(&self) -> Option<LossRange> {
        self.losses.first().map(|e| e.range)
    }

    /// Get total number of lost packets
    pub fn len(&self) -> usize {
        self.losses.iter().map(|e| e.range.len()).sum()
    }

    /// Check if the loss list is empty
    pub fn is_empty(&self) -> bool {
        self.losses.is_empty()
    }

    /// Clear all losses
    pub fn clear(&mut self) {
        self.losses.clear();
    }

    /// Check if a sequence number is in the loss list
    pub fn contains(&self, seq: SeqNumber) -> bool {
        self.losses.iter().any(|e| e.range.contains(seq))
    }
}

/// Sender loss list
///
/// Sequence numbers requested by receiver NACKs, waiting to be resent.
#[derive(Debug)]
pub struct SenderLossList {
    inner: LossList,
}

impl SenderLossList {
    /// Create a new sender loss list
    pub fn new() -> Self {
        SenderLossList {
            inner: LossList::new(u32::MAX),
        }
    }

    /// Add a lost packet from a NACK
    pub fn add(&mut self, seq: SeqNumber, now: Instant) {
        self.inner.add(seq, now);
    }

    /// Add a range of lost packets from a NACK
    pub fn add_range(&mut self, range: LossRange, now: Instant) {
        self.inner.add_range(range, now);
    }

    /// Remove a packet (retransmitted or given up)
    pub fn remove(&mut self, seq: SeqNumber) {
        self.inner.remove(seq);
    }

    /// Oldest packet waiting for retransmission
    pub fn first(&self) -> Option<SeqNumber> {
        self.inner.first().map(|r| r.start)
    }

    /// Take the oldest packet waiting for retransmission
    pub fn pop_next(&mut self) -> Option<SeqNumber> {
        let seq = self.first()?;
        self.remove(seq);
        Some(seq)
    }

    /// Get all packets that need retransmission
    pub fn get_all(&self) -> Vec<SeqNumber> {
        let mut packets = Vec::new();
        for range in self.inner.ranges() {
            let mut seq = range.start;
            while seq.le(range.end) {
                packets.push(seq);
                seq = seq.next();
            }
        }
        packets
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Get count of packets to retransmit
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Drop everything pending
    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

impl Default for SenderLossList {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver loss list
///
/// Gaps detected in a flow, with their NACK history.
#[derive(Debug)]
pub struct ReceiverLossList {
    inner: LossList,
}

impl ReceiverLossList {
    /// Create a new receiver loss list
    ///
    /// # Arguments
    /// * `max_nak_count` - Maximum times to send a NACK for a single loss
    pub fn new(max_nak_count: u32) -> Self {
        ReceiverLossList {
            inner: LossList::new(max_nak_count),
        }
    }

    /// Add a detected loss
    pub fn add(&mut self, seq: SeqNumber, now: Instant) {
        self.inner.add(seq, now);
    }

    /// Add a range of detected losses
    pub fn add_range(&mut self, range: LossRange, now: Instant) {
        self.inner.add_range(range, now);
    }

    /// Remove a recovered packet
    pub fn remove(&mut self, seq: SeqNumber) {
        self.inner.remove(seq);
    }

    /// Forget every loss up to and including `seq`
    pub fn remove_up_to(&mut self, seq: SeqNumber) {
        self.inner.remove_up_to(seq);
    }

    /// Get ranges to include in the next NACK
    pub fn get_nak_ranges(
        &mut self,
        now: Instant,
        first_delay: Duration,
        interval: Duration,
    ) -> Vec<LossRange> {
        self.inner.get_nak_ranges(now, first_delay, interval)
    }

    /// Number of NACKs already sent for a sequence number
    pub fn nak_count(&self, seq: SeqNumber) -> Option<u32> {
        self.inner.nak_count(seq)
    }

    /// Check if a sequence number is still missing
    pub fn contains(&self, seq: SeqNumber) -> bool {
        self.inner.contains(seq)
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Get count of lost packets
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Drop everything pending
    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(n: u32) -> SeqNumber {
        SeqNumber::new(n)
    }

    #[test]
    fn test_loss_range_merge() {
        let r1 = LossRange::new(seq(10), seq(15));
        let r2 = LossRange::new(seq(16), seq(20));

        let merged = r1.try_merge(&r2).unwrap();
        assert_eq!(merged.start, seq(10));
        assert_eq!(merged.end, seq(20));
    }

    #[test]
    fn test_loss_range_no_merge() {
        let r1 = LossRange::new(seq(10), seq(15));
        let r2 = LossRange::new(seq(20), seq(25));
        assert!(r1.try_merge(&r2).is_none());
    }

    #[test]
    fn test_loss_list_add_remove() {
        let now = Instant::now();
        let mut list = LossList::new(3);

        list.add(seq(10), now);
        list.add(seq(11), now);
        list.add(seq(12), now);
        assert_eq!(list.len(), 3);

        list.remove(seq(11));
        assert_eq!(list.len(), 2);
        assert_eq!(
            list.ranges(),
            vec![LossRange::single(seq(10)), LossRange::single(seq(12))]
        );
    }

    #[test]
    fn test_loss_list_merge() {
        let now = Instant::now();
        let mut list = LossList::new(3);

        list.add(seq(10), now);
        list.add(seq(12), now);
        list.add(seq(11), now);

        assert_eq!(list.ranges(), vec![LossRange::new(seq(10), seq(12))]);
    }

    #[test]
    fn test_remove_up_to() {
        let now = Instant::now();
        let mut list = LossList::new(3);
        list.add_range(LossRange::new(seq(5), seq(9)), now);
        list.add(seq(20), now);

        list.remove_up_to(seq(7));
        assert_eq!(
            list.ranges(),
            vec![LossRange::new(seq(8), seq(9)), LossRange::single(seq(20))]
        );
    }

    #[test]
    fn test_sender_loss_list() {
        let now = Instant::now();
        let mut list = SenderLossList::new();

        list.add(seq(5), now);
        list.add(seq(7), now);
        list.add(seq(6), now);
        assert_eq!(list.len(), 3);
        assert_eq!(list.first(), Some(seq(5)));

        assert_eq!(list.pop_next(), Some(seq(5)));
        assert_eq!(list.len(), 2);
        assert_eq!(list.get_all(), vec![seq(6), seq(7)]);
    }

    #[test]
    fn test_receiver_nak_timing() {
        let start = Instant::now();
        let first_delay = Duration::from_millis(20);
        let interval = Duration::from_millis(50);
        let mut list = ReceiverLossList::new(2);

        list.add_range(LossRange::new(seq(10), seq(11)), start);

        // Not yet due
        assert!(list
            .get_nak_ranges(start + Duration::from_millis(5), first_delay, interval)
            .is_empty());

        let t1 = start + first_delay;
        assert_eq!(
            list.get_nak_ranges(t1, first_delay, interval),
            vec![LossRange::new(seq(10), seq(11))]
        );
        assert_eq!(list.nak_count(seq(11)), Some(1));

        // Too soon after the first NACK
        assert!(list
            .get_nak_ranges(t1 + Duration::from_millis(10), first_delay, interval)
            .is_empty());

        let t2 = t1 + interval;
        assert_eq!(list.get_nak_ranges(t2, first_delay, interval).len(), 1);

        // Retry budget exhausted
        assert!(list
            .get_nak_ranges(t2 + interval, first_delay, interval)
            .is_empty());
        assert_eq!(list.nak_count(seq(10)), Some(2));
        assert_eq!(list.nak_count(seq(12)), None);
    }

    #[test]
    fn test_split_keeps_history() {
        let now = Instant::now();
        let mut list = ReceiverLossList::new(5);
        list.add_range(LossRange::new(seq(1), seq(3)), now);
        list.get_nak_ranges(now, Duration::ZERO, Duration::ZERO);

        list.remove(seq(2));
        assert_eq!(list.nak_count(seq(1)), Some(1));
        assert_eq!(list.nak_count(seq(3)), Some(1));
        assert!(!list.contains(seq(2)));
    }
}
