//! Statistics display and formatting

use rist::{ReceiverFlowStats, SenderPeerStats, StatsSnapshot};
use std::time::Duration;

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format bandwidth in human-readable form
pub fn format_bandwidth(bps: u64) -> String {
    const KBPS: u64 = 1000;
    const MBPS: u64 = KBPS * 1000;
    const GBPS: u64 = MBPS * 1000;

    if bps >= GBPS {
        format!("{:.2} Gbps", bps as f64 / GBPS as f64)
    } else if bps >= MBPS {
        format!("{:.2} Mbps", bps as f64 / MBPS as f64)
    } else if bps >= KBPS {
        format!("{:.2} Kbps", bps as f64 / KBPS as f64)
    } else {
        format!("{} bps", bps)
    }
}

/// Format RTT in human-readable form
pub fn format_rtt(rtt: Duration) -> String {
    let us = rtt.as_micros();
    if us >= 1_000_000 {
        format!("{:.2}s", rtt.as_secs_f64())
    } else if us >= 1_000 {
        format!("{:.2}ms", us as f64 / 1_000.0)
    } else {
        format!("{}µs", us)
    }
}

/// Format duration in human-readable form
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

fn format_sender(stats: &SenderPeerStats) -> String {
    let peer = stats
        .peer
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{peer} [{cname}] q={quality:.1}% bw={bw} retry={retry} sent={sent} rexmit={rexmit} \
         skipped(bloat/bw/rexmit)={bloat}/{bwskip}/{rexskip} rtt={rtt}",
        cname = stats.cname,
        quality = stats.quality,
        bw = format_bandwidth(stats.bandwidth),
        retry = format_bandwidth(stats.retry_bandwidth),
        sent = stats.sent,
        rexmit = stats.retransmitted,
        bloat = stats.bloat_skipped,
        bwskip = stats.bandwidth_skipped,
        rexskip = stats.retransmit_skipped,
        rtt = format_rtt(stats.rtt),
    )
}

fn format_receiver(stats: &ReceiverFlowStats) -> String {
    format!(
        "flow {flow} peers={peers} [{cnames}] q={quality:.1}% bw={bw} recv={recv} \
         missing={missing} reordered={reordered} recovered={recovered} lost={lost} \
         dup={dup} ipd(min/avg/max)={min}/{avg}/{max}µs rtt={rtt}",
        flow = stats.flow_id,
        peers = stats.peer_count,
        cnames = stats.cnames,
        quality = stats.quality,
        bw = format_bandwidth(stats.bandwidth),
        recv = stats.received,
        missing = stats.missing,
        reordered = stats.reordered,
        recovered = stats.recovered,
        lost = stats.lost,
        dup = stats.duplicates,
        min = stats.min_inter_packet_spacing,
        avg = stats.avg_inter_packet_spacing,
        max = stats.max_inter_packet_spacing,
        rtt = format_rtt(stats.rtt),
    )
}

/// One-line summary of a snapshot
pub fn format_snapshot(snapshot: &StatsSnapshot) -> String {
    match snapshot {
        StatsSnapshot::SenderPeer(stats) => format_sender(stats),
        StatsSnapshot::ReceiverFlow(stats) => format_receiver(stats),
    }
}

/// Log a snapshot
pub fn display_snapshot(snapshot: &StatsSnapshot) {
    tracing::info!(target: "rist::stats", "{}", format_snapshot(snapshot));
}
