//! Sender data path
//!
//! `write_data` only queues the block. The send thread numbers it, stores
//! it in the recovery cache, paces it to the configured bitrate and hands
//! it to every link the group selects. NACKs feed each link's retransmit
//! queue, drained right away and again on every timer tick.

use crate::context::Shared;
use crate::error::{Result, RistError};
use crate::link::Link;
use crossbeam::channel::{bounded, select, Receiver, SendTimeoutError, Sender};
use parking_lot::Mutex;
use rist_io::{ntp_now, RateLimiter};
use rist_protocol::{
    DataBlock, DataFlags, DataPacket, NackInfo, PeerConfig, Profile, RecoveryCache, RecoveryMode,
    SeqNumber,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

const SEND_QUEUE_SIZE: usize = 1024;

/// How long a blocked writer waits before rechecking for shutdown
const SUBMIT_POLL: Duration = Duration::from_millis(100);

/// Token bucket depth in milliseconds of traffic at the maximum bitrate
const PACER_BURST_MS: u64 = 50;

pub(crate) struct SenderState {
    tx: Sender<DataBlock>,
    rx: Receiver<DataBlock>,
    cache: Mutex<Option<RecoveryCache>>,
    next_seq: Mutex<SeqNumber>,
    pacer: Mutex<Option<RateLimiter>>,
}

impl SenderState {
    pub(crate) fn new() -> Self {
        let (tx, rx) = bounded(SEND_QUEUE_SIZE);
        SenderState {
            tx,
            rx,
            cache: Mutex::new(None),
            next_seq: Mutex::new(SeqNumber::new(rand::random())),
            pacer: Mutex::new(None),
        }
    }

    /// Size the cache and pacer from the first peer that asks for them
    pub(crate) fn configure(&self, config: &PeerConfig) {
        let mut cache = self.cache.lock();
        if cache.is_none() && config.recovery_mode != RecoveryMode::Disabled {
            *cache = Some(RecoveryCache::new(
                config.recovery_length_min(),
                config.recovery_length_max(),
                config.recovery_byte_cap(),
                config.max_retries,
            ));
            debug!(
                window_ms = config.recovery_length_max,
                byte_cap = config.recovery_byte_cap(),
                "recovery cache configured"
            );
        }

        let mut pacer = self.pacer.lock();
        if pacer.is_none() && config.recovery_maxbitrate > 0 {
            let rate_bps = config.recovery_maxbitrate as u64 * 1000;
            let burst = (rate_bps / 8 * PACER_BURST_MS / 1000).max(64 * 1024);
            *pacer = Some(RateLimiter::new(rate_bps, burst, Instant::now()));
        }
    }

    /// Queue a block for the send thread
    pub(crate) fn submit(&self, shared: &Shared, mut block: DataBlock) -> Result<usize> {
        let len = block.len();
        loop {
            match self.tx.send_timeout(block, SUBMIT_POLL) {
                Ok(()) => return Ok(len),
                Err(SendTimeoutError::Timeout(returned)) => {
                    if shared.is_stopping() {
                        return Err(RistError::Destroyed);
                    }
                    block = returned;
                }
                Err(SendTimeoutError::Disconnected(_)) => return Err(RistError::Destroyed),
            }
        }
    }

    /// Send thread body
    pub(crate) fn run(&self, shared: &Arc<Shared>) {
        loop {
            select! {
                recv(self.rx) -> block => match block {
                    Ok(block) => self.send_block(shared, block),
                    Err(_) => break,
                },
                recv(shared.shutdown_rx) -> _ => break,
            }
        }
        debug!("send thread stopped");
    }

    fn send_block(&self, shared: &Shared, block: DataBlock) {
        let seq = {
            let mut next = self.next_seq.lock();
            if block.flags.contains(DataFlags::USE_SEQ) {
                *next = SeqNumber::from_u64(block.seq);
            }
            let seq = *next;
            next.increment();
            seq
        };

        let targets = match shared.group.select_targets() {
            Ok(targets) if !targets.is_empty() => targets,
            _ => {
                trace!(%seq, "no peer to send to, dropping block");
                return;
            }
        };

        let (src_port, dst_port) = if shared.profile == Profile::Simple {
            (0, 0)
        } else {
            let config = &targets[0].config;
            let src = if block.virt_src_port != 0 {
                block.virt_src_port
            } else {
                config.virt_src_port
            };
            let dst = if block.virt_dst_port != 0 {
                block.virt_dst_port
            } else {
                config.virt_dst_port
            };
            (src, dst)
        };
        let ts_ntp = if block.ts_ntp == 0 {
            ntp_now()
        } else {
            block.ts_ntp
        };
        let len = block.len();
        let packet =
            DataPacket::new(shared.flow_id(), seq, ts_ntp, block.payload).with_ports(src_port, dst_port);

        if let Some(pacer) = self.pacer.lock().as_mut() {
            pacer.acquire(len);
        }
        let now = Instant::now();
        if let Some(cache) = self.cache.lock().as_mut() {
            cache.insert(packet.clone(), now);
        }

        for link in targets {
            if let Err(e) = link.send_data(&packet) {
                debug!(peer = %link.id(), %seq, error = %e, "send failed");
            }
            link.retransmit.lock().queue.on_data_sent(len);
        }
    }

    /// Queue a NACK from `link` and answer it right away
    pub(crate) fn on_nack(&self, link: &Link, info: &NackInfo, interval: Duration, now: Instant) {
        link.retransmit.lock().queue.on_nack(info, now);
        self.drain(link, interval, now);
    }

    /// Resend whatever `link` is owed and the budget allows
    pub(crate) fn drain(&self, link: &Link, interval: Duration, now: Instant) {
        let rtt = link.rtt();
        let packets = {
            let mut cache = self.cache.lock();
            let Some(cache) = cache.as_mut() else {
                return;
            };
            link.retransmit
                .lock()
                .queue
                .drain(cache, rtt, interval, now)
        };

        for packet in packets {
            trace!(peer = %link.id(), seq = %packet.seq, "retransmitting");
            if let Err(e) = link.send_data(&packet) {
                debug!(peer = %link.id(), error = %e, "retransmission failed");
            }
        }
    }

    pub(crate) fn evict(&self, now: Instant) {
        if let Some(cache) = self.cache.lock().as_mut() {
            let evicted = cache.evict(now);
            if evicted > 0 {
                trace!(evicted, "recovery cache eviction");
            }
        }
    }

    /// Drop queued blocks and cached packets
    pub(crate) fn clear(&self) {
        while self.rx.try_recv().is_ok() {}
        if let Some(cache) = self.cache.lock().as_mut() {
            cache.clear();
        }
    }
}
