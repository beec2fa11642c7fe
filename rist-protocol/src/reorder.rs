//! Receiver-side reorder buffer
//!
//! One buffer per flow. Slots are indexed from the next sequence number the
//! application expects. Arriving packets fill their slot; the contiguous
//! prefix is released in order. A slot that stays empty past the recovery
//! window is declared lost, the watermark moves past it, and the next
//! released block carries the discontinuity flag.
//!
//! Gaps are tracked in a [`ReceiverLossList`] that paces NACKs: the first
//! one goes out after the congestion mode's NACK delay, later ones once per
//! RTT, up to the retry limit.

use crate::block::{DataBlock, DataFlags};
use crate::config::{CongestionMode, PeerConfig, RecoveryMode};
use crate::loss::{LossRange, ReceiverLossList};
use crate::sequence::SeqNumber;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Largest forward or backward jump treated as part of the same stream
const MAX_SPAN: i32 = 1 << 16;

/// How many lost sequence numbers are remembered for late-arrival accounting
const LOST_HISTORY: usize = 4096;

#[derive(Debug)]
enum Slot {
    Missing { since: Instant },
    Filled(DataBlock),
}

/// What happened to an inserted packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New packet at or ahead of the expected position
    Accepted,
    /// Filled a gap (retransmission or out-of-order arrival)
    FilledGap,
    /// Already buffered or delivered
    Duplicate,
    /// Arrived after its slot was declared lost
    Late,
    /// Jumped too far; the buffer restarted at this packet
    Reset,
}

/// Per-flow receive counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowCounters {
    pub received: u64,
    pub bytes: u64,
    /// Sequence numbers detected missing (recovered or not)
    pub missing: u64,
    /// Gaps filled by an original, out-of-order packet
    pub reordered: u64,
    /// Gaps filled by a retransmission
    pub recovered: u64,
    /// Gaps filled after exactly one NACK
    pub recovered_one_retry: u64,
    /// Gaps given up on
    pub lost: u64,
    pub duplicates: u64,
}

impl FlowCounters {
    /// Counters accumulated since `earlier`
    pub fn delta(&self, earlier: &FlowCounters) -> FlowCounters {
        FlowCounters {
            received: self.received.saturating_sub(earlier.received),
            bytes: self.bytes.saturating_sub(earlier.bytes),
            missing: self.missing.saturating_sub(earlier.missing),
            reordered: self.reordered.saturating_sub(earlier.reordered),
            recovered: self.recovered.saturating_sub(earlier.recovered),
            recovered_one_retry: self
                .recovered_one_retry
                .saturating_sub(earlier.recovered_one_retry),
            lost: self.lost.saturating_sub(earlier.lost),
            duplicates: self.duplicates.saturating_sub(earlier.duplicates),
        }
    }
}

/// Reorder buffer settings taken from the peer configuration
#[derive(Debug, Clone, Copy)]
pub struct ReorderSettings {
    pub recovery_mode: RecoveryMode,
    pub congestion: CongestionMode,
    /// How long a gap may stay open before it is declared lost
    pub window: Duration,
    pub reorder_delay: Duration,
    pub max_retries: u32,
}

impl ReorderSettings {
    pub fn from_config(config: &PeerConfig) -> Self {
        ReorderSettings {
            recovery_mode: config.recovery_mode,
            congestion: config.congestion_control,
            window: config.recovery_length_max(),
            reorder_delay: config.reorder_buffer(),
            max_retries: config.max_retries,
        }
    }

    fn recovers(&self) -> bool {
        self.recovery_mode != RecoveryMode::Disabled
    }

    /// Time a gap is held before release
    fn hold_time(&self) -> Duration {
        if self.recovers() {
            self.window
        } else {
            self.reorder_delay
        }
    }
}

/// Reorder buffer for one flow
#[derive(Debug)]
pub struct ReorderBuffer {
    settings: ReorderSettings,
    slots: VecDeque<Slot>,
    /// Sequence number of `slots[0]`; `None` before the first packet
    next_expected: Option<SeqNumber>,
    losses: ReceiverLossList,
    recently_lost: VecDeque<SeqNumber>,
    pending_discontinuity: bool,
    counters: FlowCounters,
}

impl ReorderBuffer {
    /// Create a new reorder buffer
    pub fn new(settings: ReorderSettings) -> Self {
        ReorderBuffer {
            settings,
            slots: VecDeque::new(),
            next_expected: None,
            losses: ReceiverLossList::new(settings.max_retries),
            recently_lost: VecDeque::new(),
            pending_discontinuity: false,
            counters: FlowCounters::default(),
        }
    }

    /// Insert an arriving packet
    pub fn insert(
        &mut self,
        seq: SeqNumber,
        mut block: DataBlock,
        retransmitted: bool,
        now: Instant,
    ) -> InsertOutcome {
        block.seq = seq.as_raw() as u64;
        let payload_len = block.payload.len() as u64;

        let Some(base) = self.next_expected else {
            block.flags.insert(DataFlags::FLOW_BUFFER_START);
            self.next_expected = Some(seq);
            self.slots.push_back(Slot::Filled(block));
            self.count_received(payload_len);
            return InsertOutcome::Accepted;
        };

        let offset = base.distance_to(seq);
        if !(-MAX_SPAN..=MAX_SPAN).contains(&offset) {
            debug!(%seq, expected = %base, "sequence jump, restarting flow buffer");
            self.reset(seq, block);
            self.count_received(payload_len);
            return InsertOutcome::Reset;
        }

        if offset < 0 {
            if let Some(pos) = self.recently_lost.iter().position(|s| *s == seq) {
                self.recently_lost.remove(pos);
                self.counters.reordered += 1;
                trace!(%seq, "packet arrived after its gap was declared lost");
                return InsertOutcome::Late;
            }
            self.counters.duplicates += 1;
            return InsertOutcome::Duplicate;
        }

        let index = offset as usize;
        if index >= self.slots.len() {
            let gap = index - self.slots.len();
            if gap > 0 {
                let first_missing = base + self.slots.len() as u32;
                for _ in 0..gap {
                    self.slots.push_back(Slot::Missing { since: now });
                }
                if self.settings.recovers() {
                    self.losses
                        .add_range(LossRange::new(first_missing, seq - 1), now);
                }
                self.counters.missing += gap as u64;
                trace!(from = %first_missing, count = gap, "gap detected");
            }
            self.slots.push_back(Slot::Filled(block));
            self.count_received(payload_len);
            return InsertOutcome::Accepted;
        }

        match &self.slots[index] {
            Slot::Filled(_) => {
                self.counters.duplicates += 1;
                InsertOutcome::Duplicate
            }
            Slot::Missing { .. } => {
                if retransmitted {
                    self.counters.recovered += 1;
                    if self.losses.nak_count(seq) == Some(1) {
                        self.counters.recovered_one_retry += 1;
                    }
                } else {
                    self.counters.reordered += 1;
                }
                self.losses.remove(seq);
                self.slots[index] = Slot::Filled(block);
                self.count_received(payload_len);
                InsertOutcome::FilledGap
            }
        }
    }

    fn count_received(&mut self, bytes: u64) {
        self.counters.received += 1;
        self.counters.bytes += bytes;
    }

    fn reset(&mut self, seq: SeqNumber, mut block: DataBlock) {
        self.slots.clear();
        self.losses.clear();
        self.recently_lost.clear();
        block.flags.insert(DataFlags::DISCONTINUITY);
        self.pending_discontinuity = false;
        self.next_expected = Some(seq);
        self.slots.push_back(Slot::Filled(block));
    }

    /// Release every block that is ready, in sequence order
    ///
    /// Gaps older than the hold time are declared lost on the way.
    pub fn pop_ready(&mut self, now: Instant) -> Vec<DataBlock> {
        let mut ready = Vec::new();
        let hold = self.settings.hold_time();

        while let Some(front) = self.slots.front() {
            let Some(seq) = self.next_expected else {
                break;
            };

            match front {
                Slot::Filled(_) => {
                    if let Some(Slot::Filled(mut block)) = self.slots.pop_front() {
                        if self.pending_discontinuity {
                            block.flags.insert(DataFlags::DISCONTINUITY);
                            self.pending_discontinuity = false;
                        }
                        ready.push(block);
                    }
                }
                Slot::Missing { since } => {
                    if now.saturating_duration_since(*since) < hold {
                        break;
                    }
                    self.slots.pop_front();
                    self.losses.remove_up_to(seq);
                    self.counters.lost += 1;
                    self.pending_discontinuity = true;
                    if self.recently_lost.len() == LOST_HISTORY {
                        self.recently_lost.pop_front();
                    }
                    self.recently_lost.push_back(seq);
                    debug!(%seq, "gap not recovered, declared lost");
                }
            }
            self.next_expected = Some(seq.next());
        }

        ready
    }

    /// Loss ranges due for a NACK now
    pub fn nack_ranges(&mut self, now: Instant, rtt: Duration) -> Vec<LossRange> {
        if !self.settings.recovers() {
            return Vec::new();
        }
        let first_delay = self
            .settings
            .congestion
            .nack_delay(rtt, self.settings.reorder_delay);
        self.losses.get_nak_ranges(now, first_delay, rtt)
    }

    /// Next sequence number the application will see
    pub fn next_expected(&self) -> Option<SeqNumber> {
        self.next_expected
    }

    /// Packets held back behind a gap
    pub fn buffered(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Filled(_)))
            .count()
    }

    /// Sequence numbers currently missing
    pub fn missing(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Missing { .. }))
            .count()
    }

    pub fn counters(&self) -> FlowCounters {
        self.counters
    }

    /// Drop everything held
    pub fn clear(&mut self) {
        self.slots.clear();
        self.losses.clear();
        self.recently_lost.clear();
        self.next_expected = None;
        self.pending_discontinuity = false;
    }
}
