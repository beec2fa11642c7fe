//! NACK encoding and RTT estimation
//!
//! Receivers report missing sequence numbers with one of two encodings,
//! chosen per receiver:
//!
//! - **Range**: `u32 start` followed by `u16 extra`, covering
//!   `start ..= start + extra`.
//! - **Bitmask**: `u32 base` followed by a `u16` mask where bit `i` marks
//!   `base + 1 + i` as missing; `base` itself is always missing.
//!
//! Senders decode either form, so a mismatched choice only changes how
//! compactly losses are described.

use crate::loss::LossRange;
use crate::sequence::SeqNumber;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;
use tracing::info;

/// Largest span a single range entry can describe
const MAX_RANGE_SPAN: u32 = u16::MAX as u32 + 1;

/// Size of one encoded NACK entry (either encoding)
const ENTRY_SIZE: usize = 6;

/// NACK encoding selected by the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NackMode {
    #[default]
    Range,
    Bitmask,
}

/// Lost sequence ranges carried by a NACK
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NackInfo {
    pub loss_ranges: Vec<LossRange>,
}

impl NackInfo {
    /// Create a new NACK info
    pub fn new(loss_ranges: Vec<LossRange>) -> Self {
        NackInfo { loss_ranges }
    }

    /// Number of sequence numbers covered
    pub fn seq_count(&self) -> usize {
        self.loss_ranges.iter().map(|r| r.len()).sum()
    }

    /// Check if there is nothing to report
    pub fn is_empty(&self) -> bool {
        self.loss_ranges.is_empty()
    }

    /// Iterate every missing sequence number in report order
    pub fn sequences(&self) -> impl Iterator<Item = SeqNumber> + '_ {
        self.loss_ranges
            .iter()
            .flat_map(|r| (0..r.len() as u32).map(move |i| r.start + i))
    }

    /// Serialize to a control packet body
    pub fn encode(&self, mode: NackMode) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.loss_ranges.len() * ENTRY_SIZE);
        match mode {
            NackMode::Range => {
                for range in &self.loss_ranges {
                    let mut start = range.start;
                    let mut remaining = range.len() as u32;
                    while remaining > 0 {
                        let span = remaining.min(MAX_RANGE_SPAN);
                        buf.put_u32(start.as_raw());
                        buf.put_u16((span - 1) as u16);
                        start += span;
                        remaining -= span;
                    }
                }
            }
            NackMode::Bitmask => {
                let mut seqs = self.sequences().peekable();
                while let Some(base) = seqs.next() {
                    let mut mask = 0u16;
                    while let Some(&next) = seqs.peek() {
                        let offset = base.distance_to(next);
                        if !(1..=16).contains(&offset) {
                            break;
                        }
                        mask |= 1 << (offset - 1);
                        seqs.next();
                    }
                    buf.put_u32(base.as_raw());
                    buf.put_u16(mask);
                }
            }
        }
        buf.freeze()
    }

    /// Parse a control packet body
    ///
    /// Returns `None` when the body is not a whole number of entries.
    pub fn decode(mode: NackMode, body: &[u8]) -> Option<Self> {
        if body.len() % ENTRY_SIZE != 0 {
            return None;
        }

        let mut buf = body;
        let mut ranges: Vec<LossRange> = Vec::new();
        while buf.remaining() >= ENTRY_SIZE {
            let seq = SeqNumber::new(buf.get_u32());
            let field = buf.get_u16();
            match mode {
                NackMode::Range => {
                    push_range(&mut ranges, LossRange::new(seq, seq + field as u32));
                }
                NackMode::Bitmask => {
                    push_range(&mut ranges, LossRange::single(seq));
                    for bit in 0..16u32 {
                        if field & (1 << bit) != 0 {
                            push_range(&mut ranges, LossRange::single(seq + bit + 1));
                        }
                    }
                }
            }
        }

        Some(NackInfo {
            loss_ranges: ranges,
        })
    }
}

/// Append a range, coalescing with the previous one when adjacent
fn push_range(ranges: &mut Vec<LossRange>, range: LossRange) {
    if let Some(last) = ranges.last_mut() {
        if let Some(merged) = last.try_merge(&range) {
            *last = merged;
            return;
        }
    }
    ranges.push(range);
}

/// RTT (Round-Trip Time) estimator
///
/// Smoothed RTT and variance via exponential moving average. Every sample
/// feeds the average; only the value handed to recovery and congestion
/// decisions is clamped to the configured bounds.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    /// Smoothed RTT (microseconds)
    srtt: f64,
    /// RTT variance (microseconds)
    rtt_var: f64,
    sample_count: u32,
    rtt_min: Duration,
    rtt_max: Duration,
    last_sample: Option<Duration>,
}

impl RttEstimator {
    /// Create a new estimator bounded to `[rtt_min, rtt_max]`
    pub fn new(rtt_min: Duration, rtt_max: Duration) -> Self {
        let rtt_max = rtt_max.max(rtt_min);
        RttEstimator {
            srtt: rtt_min.as_micros() as f64,
            rtt_var: rtt_min.as_micros() as f64 / 2.0,
            sample_count: 0,
            rtt_min,
            rtt_max,
            last_sample: None,
        }
    }

    /// Update with a new RTT sample
    pub fn update(&mut self, sample: Duration) {
        if sample < self.rtt_min || sample > self.rtt_max {
            info!(
                sample_us = sample.as_micros() as u64,
                min_ms = self.rtt_min.as_millis() as u64,
                max_ms = self.rtt_max.as_millis() as u64,
                "RTT sample outside configured bounds"
            );
        }

        let sample_us = sample.as_micros() as f64;
        if self.sample_count == 0 {
            self.srtt = sample_us;
            self.rtt_var = sample_us / 2.0;
        } else {
            let alpha = 0.125;
            let beta = 0.25;

            let error = sample_us - self.srtt;
            self.srtt += alpha * error;
            self.rtt_var = (1.0 - beta) * self.rtt_var + beta * error.abs();
        }

        self.sample_count = self.sample_count.saturating_add(1);
        self.last_sample = Some(sample);
    }

    /// Smoothed RTT, unclamped
    pub fn srtt(&self) -> Duration {
        Duration::from_micros(self.srtt as u64)
    }

    /// Smoothed RTT clamped to `[rtt_min, rtt_max]`
    pub fn clamped_srtt(&self) -> Duration {
        self.srtt().clamp(self.rtt_min, self.rtt_max)
    }

    /// RTT variance
    pub fn rtt_var(&self) -> Duration {
        Duration::from_micros(self.rtt_var as u64)
    }

    /// Most recent raw sample
    pub fn last_sample(&self) -> Option<Duration> {
        self.last_sample
    }

    /// Number of samples seen
    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }
}
