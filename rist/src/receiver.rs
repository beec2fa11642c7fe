//! Receiver data path
//!
//! Each flow id gets its own reorder buffer and worker thread. Receive
//! threads hand arrivals to the worker, which releases blocks in sequence
//! order, declares expired gaps lost and NACKs the rest. A flow that goes
//! quiet for a session timeout, or whose peers are all gone, is reaped by
//! the timer thread.

use crate::context::Shared;
use crate::link::Link;
use crossbeam::channel::{bounded, select, tick, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use rist_io::ntp_now;
use rist_protocol::{
    receiver_quality, ControlPacket, DataBlock, FlowCounters, InterPacketSpacing, LossRange,
    NackInfo, NackMode, PeerId, Profile, ReceiverFlowStats, ReorderBuffer, ReorderSettings,
    SeqNumber, TimingMode,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Worker period for releasing expired gaps and sending NACKs
const FLOW_TICK: Duration = Duration::from_millis(5);

const ARRIVAL_QUEUE_SIZE: usize = 4096;

/// Concurrent flows per receiver; packets for further flow ids are dropped
pub(crate) const MAX_FLOWS: usize = 64;

/// Loss ranges per NACK packet
const MAX_NACK_RANGES: usize = 128;

struct Arrival {
    peer: PeerId,
    seq: SeqNumber,
    block: DataBlock,
    retransmitted: bool,
    at: Instant,
}

struct FlowState {
    buffer: ReorderBuffer,
    last_peer: Option<PeerId>,
    peers: BTreeSet<PeerId>,
    spacing: InterPacketSpacing,
    reported: FlowCounters,
    retry_bytes: u64,
    last_arrival: Instant,
}

struct Flow {
    flow_id: u32,
    timing: TimingMode,
    idle_timeout: Duration,
    tx: Sender<Arrival>,
    /// Dropped to stop the worker
    stop: Mutex<Option<Sender<()>>>,
    state: Mutex<FlowState>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

pub(crate) struct ReceiverState {
    flows: Mutex<HashMap<u32, Arc<Flow>>>,
    nack_mode: Mutex<NackMode>,
}

impl ReceiverState {
    pub(crate) fn new() -> Self {
        ReceiverState {
            flows: Mutex::new(HashMap::new()),
            nack_mode: Mutex::new(NackMode::default()),
        }
    }

    pub(crate) fn set_nack_mode(&self, mode: NackMode) {
        *self.nack_mode.lock() = mode;
    }

    fn nack_mode(&self) -> NackMode {
        *self.nack_mode.lock()
    }

    /// Hand a received block to its flow
    pub(crate) fn deliver(
        &self,
        shared: &Arc<Shared>,
        link: &Link,
        seq: SeqNumber,
        block: DataBlock,
        retransmitted: bool,
        now: Instant,
    ) {
        if shared.is_stopping() {
            return;
        }
        let Some(flow) = self.flow(shared, link, block.flow_id) else {
            return;
        };

        let arrival = Arrival {
            peer: link.id(),
            seq,
            block,
            retransmitted,
            at: now,
        };
        match flow.tx.try_send(arrival) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(flow_id = flow.flow_id, %seq, "flow queue full, dropping packet");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Existing flow, or a new one configured from `link`
    fn flow(&self, shared: &Arc<Shared>, link: &Link, flow_id: u32) -> Option<Arc<Flow>> {
        let mut flows = self.flows.lock();
        if let Some(flow) = flows.get(&flow_id) {
            return Some(Arc::clone(flow));
        }
        if flows.len() >= MAX_FLOWS {
            debug!(flow_id, peer = %link.id(), "flow limit reached, dropping packet");
            return None;
        }

        let (tx, rx) = bounded(ARRIVAL_QUEUE_SIZE);
        let (stop_tx, stop_rx) = bounded(0);
        let flow = Arc::new(Flow {
            flow_id,
            timing: link.config.timing_mode,
            idle_timeout: link.config.session_timeout(),
            tx,
            stop: Mutex::new(Some(stop_tx)),
            state: Mutex::new(FlowState {
                buffer: ReorderBuffer::new(ReorderSettings::from_config(&link.config)),
                last_peer: None,
                peers: BTreeSet::new(),
                spacing: InterPacketSpacing::new(),
                reported: FlowCounters::default(),
                retry_bytes: 0,
                last_arrival: Instant::now(),
            }),
            thread: Mutex::new(None),
        });

        let worker = Arc::clone(&flow);
        let handle = shared.spawn(format!("rist-flow-{flow_id}"), move |shared| {
            run_flow(shared, worker, rx, stop_rx)
        });
        match handle {
            Ok(handle) => *flow.thread.lock() = Some(handle),
            Err(e) => {
                warn!(flow_id, error = %e, "cannot start flow worker");
                return None;
            }
        }

        info!(flow_id, peer = %link.id(), "new flow");
        flows.insert(flow_id, Arc::clone(&flow));
        Some(flow)
    }

    /// Tear down flows that went quiet or lost every peer
    pub(crate) fn reap(&self, shared: &Shared, now: Instant) {
        let reaped: Vec<Arc<Flow>> = {
            let mut flows = self.flows.lock();
            let idle: Vec<u32> = flows
                .values()
                .filter(|flow| flow.is_idle(shared, now))
                .map(|flow| flow.flow_id)
                .collect();
            idle.iter().filter_map(|id| flows.remove(id)).collect()
        };

        for flow in reaped {
            info!(flow_id = flow.flow_id, "flow closed");
            flow.stop();
        }
    }

    pub(crate) fn flow_count(&self) -> usize {
        self.flows.lock().len()
    }

    /// Statistics for every flow since the previous call
    pub(crate) fn snapshots(&self, shared: &Shared, elapsed: Duration) -> Vec<ReceiverFlowStats> {
        let flows: Vec<Arc<Flow>> = self.flows.lock().values().cloned().collect();
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);

        flows
            .iter()
            .map(|flow| {
                let mut state = flow.state.lock();
                let counters = state.buffer.counters();
                let delta = counters.delta(&state.reported);
                state.reported = counters;
                let (min, avg, max) = state.spacing.summary();
                state.spacing.reset();
                let retry_bytes = std::mem::take(&mut state.retry_bytes);

                let links: Vec<Arc<Link>> = state
                    .peers
                    .iter()
                    .filter_map(|id| shared.group.get(*id))
                    .collect();
                let cnames: Vec<String> = links
                    .iter()
                    .map(|l| l.cname())
                    .filter(|c| !c.is_empty())
                    .collect();
                let rtt = state
                    .last_peer
                    .and_then(|id| shared.group.get(id))
                    .map(|l| l.rtt())
                    .unwrap_or_default();

                ReceiverFlowStats {
                    flow_id: flow.flow_id,
                    peer_count: links.len() as u32,
                    cnames: cnames.join(","),
                    bandwidth: (delta.bytes as f64 * 8.0 / secs) as u64,
                    retry_bandwidth: (retry_bytes as f64 * 8.0 / secs) as u64,
                    received: delta.received,
                    missing: delta.missing,
                    reordered: delta.reordered,
                    recovered: delta.recovered,
                    recovered_one_retry: delta.recovered_one_retry,
                    lost: delta.lost,
                    duplicates: delta.duplicates,
                    min_inter_packet_spacing: min,
                    avg_inter_packet_spacing: avg,
                    max_inter_packet_spacing: max,
                    rtt,
                    quality: receiver_quality(delta.received, delta.missing),
                }
            })
            .collect()
    }

    /// Join the flow workers and drop their buffers
    pub(crate) fn shutdown(&self) {
        let flows: Vec<Arc<Flow>> = self.flows.lock().drain().map(|(_, f)| f).collect();
        for flow in flows {
            flow.stop();
        }
    }
}

fn run_flow(
    shared: Arc<Shared>,
    flow: Arc<Flow>,
    arrivals: Receiver<Arrival>,
    stop: Receiver<()>,
) {
    let ticker = tick(FLOW_TICK);
    loop {
        select! {
            recv(arrivals) -> arrival => match arrival {
                Ok(arrival) => flow.on_arrival(&shared, arrival),
                Err(_) => break,
            },
            recv(ticker) -> _ => flow.on_tick(&shared, Instant::now()),
            recv(stop) -> _ => break,
            recv(shared.shutdown_rx) -> _ => break,
        }
    }
    debug!(flow_id = flow.flow_id, "flow worker stopped");
}

impl Flow {
    /// Silent past the session timeout, or drained with no peer left
    fn is_idle(&self, shared: &Shared, now: Instant) -> bool {
        if !self.tx.is_empty() {
            return false;
        }
        let state = self.state.lock();
        if now.saturating_duration_since(state.last_arrival) >= self.idle_timeout {
            return true;
        }
        !state.peers.is_empty()
            && state.peers.iter().all(|id| shared.group.get(*id).is_none())
            && state.buffer.buffered() == 0
    }

    /// Stop the worker, join it unless called from it, and free the buffer
    fn stop(&self) {
        self.stop.lock().take();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        self.state.lock().buffer.clear();
    }

    fn on_arrival(&self, shared: &Shared, arrival: Arrival) {
        let ready = {
            let mut state = self.state.lock();
            state.spacing.on_arrival(arrival.at);
            state.last_arrival = arrival.at;
            state.peers.insert(arrival.peer);
            state.last_peer = Some(arrival.peer);
            if arrival.retransmitted {
                state.retry_bytes += arrival.block.len() as u64;
            }

            let outcome =
                state
                    .buffer
                    .insert(arrival.seq, arrival.block, arrival.retransmitted, arrival.at);
            trace!(flow_id = self.flow_id, seq = %arrival.seq, ?outcome, "packet inserted");
            state.buffer.pop_ready(arrival.at)
        };
        self.release(shared, ready);
    }

    fn on_tick(&self, shared: &Shared, now: Instant) {
        let peer = {
            let state = self.state.lock();
            state
                .last_peer
                .into_iter()
                .chain(state.peers.iter().rev().copied())
                .find_map(|id| shared.group.get(id))
        };
        let rtt = peer.as_ref().map(|l| l.rtt()).unwrap_or_default();

        let (ready, ranges) = {
            let mut state = self.state.lock();
            let ready = state.buffer.pop_ready(now);
            let ranges = match peer {
                Some(_) => state.buffer.nack_ranges(now, rtt),
                None => Vec::new(),
            };
            (ready, ranges)
        };
        self.release(shared, ready);

        if let Some(link) = peer {
            if let Some(receiver) = &shared.receiver {
                self.send_nacks(&link, ranges, receiver.nack_mode());
            }
        }
    }

    fn send_nacks(&self, link: &Link, ranges: Vec<LossRange>, mode: NackMode) {
        for chunk in ranges.chunks(MAX_NACK_RANGES) {
            let info = NackInfo::new(chunk.to_vec());
            trace!(
                flow_id = self.flow_id,
                peer = %link.id(),
                count = info.seq_count(),
                "sending nack"
            );
            let nack = ControlPacket::nack(self.flow_id, ntp_now(), &info, mode);
            if let Err(e) = link.send_control(&nack) {
                debug!(peer = %link.id(), error = %e, "nack send failed");
            }
        }
    }

    fn release(&self, shared: &Shared, ready: Vec<DataBlock>) {
        for mut block in ready {
            if shared.profile == Profile::Simple {
                block.virt_src_port = 0;
                block.virt_dst_port = 0;
            }
            if self.timing == TimingMode::Rtc {
                block.ts_ntp = ntp_now();
            }
            shared.output.push(block);
        }
    }
}
