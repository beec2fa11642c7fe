//! Periodic statistics collection

use crate::context::Shared;
use rist_protocol::{sender_quality, SenderPeerStats, StatsSnapshot};
use std::time::Duration;

/// Build the snapshots for the interval that just ended
///
/// Senders report per peer, receivers per flow.
pub(crate) fn collect(shared: &Shared, elapsed: Duration) -> Vec<StatsSnapshot> {
    if let Some(receiver) = &shared.receiver {
        return receiver
            .snapshots(shared, elapsed)
            .into_iter()
            .map(StatsSnapshot::ReceiverFlow)
            .collect();
    }

    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    shared
        .group
        .members()
        .iter()
        .map(|link| {
            let (sent, sent_bytes, retry_bytes, received) = link.counters.take();
            let rexmit = {
                let mut state = link.retransmit.lock();
                let now = state.queue.counters();
                let delta = now.delta(&state.reported);
                state.reported = now;
                delta
            };

            StatsSnapshot::SenderPeer(SenderPeerStats {
                peer: Some(link.id()),
                cname: link.cname(),
                bandwidth: (sent_bytes as f64 * 8.0 / secs) as u64,
                retry_bandwidth: (retry_bytes as f64 * 8.0 / secs) as u64,
                sent,
                received,
                retransmitted: rexmit.retransmitted,
                bloat_skipped: rexmit.bloat_skipped,
                bandwidth_skipped: rexmit.bandwidth_skipped,
                retransmit_skipped: rexmit.retransmit_skipped,
                rtt: link.rtt(),
                quality: sender_quality(
                    sent,
                    rexmit.bloat_skipped,
                    rexmit.bandwidth_skipped,
                    rexmit.retransmit_skipped,
                    rexmit.retransmitted,
                ),
            })
        })
        .collect()
}
