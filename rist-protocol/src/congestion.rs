//! Congestion Control for RIST
//!
//! Retransmissions draw from a byte budget that is recomputed once per
//! statistics interval:
//!
//! ```text
//! allowed_bps = min(return cap (if set), max bitrate - data bitrate)
//! budget      = allowed_bps * interval / 8 * scale
//! ```
//!
//! `scale` reacts to the share of sent packets that were NACKed in the last
//! interval. Normal mode cuts it by a quarter when more than 10% were
//! NACKed and recovers 0.05 per quiet interval. Aggressive mode cuts it in
//! half above 5% and recovers 0.1 per interval. It never drops below 0.1.
//! Off disables the budget entirely.

use crate::config::{CongestionMode, PeerConfig};
use std::time::Duration;

const MIN_SCALE: f64 = 0.1;

/// Congestion statistics for one interval
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CongestionStats {
    /// Original data rate over the last interval (bits per second)
    pub data_bps: u64,
    /// Retransmission rate over the last interval (bits per second)
    pub retry_bps: u64,
    /// Share of sent packets NACKed in the last interval
    pub nack_ratio: f64,
    /// Current budget multiplier
    pub scale: f64,
}

/// Retransmission budget controller for one peer
#[derive(Debug, Clone)]
pub struct CongestionController {
    mode: CongestionMode,
    /// Overall bandwidth cap (bits per second)
    max_bitrate_bps: u64,
    /// Retransmission cap (bits per second), 0 for uncapped
    return_cap_bps: u64,
    min_retries: u32,
    /// Remaining retransmission bytes for this interval
    budget: u64,
    scale: f64,
    data_bytes: u64,
    retry_bytes: u64,
    packets_sent: u64,
    packets_nacked: u64,
    last_stats: CongestionStats,
}

impl CongestionController {
    /// Create a new congestion controller
    ///
    /// # Arguments
    /// * `config` - Peer configuration supplying mode, caps and retry floor
    /// * `interval` - Length of the first budget interval
    pub fn new(config: &PeerConfig, interval: Duration) -> Self {
        let mut controller = CongestionController {
            mode: config.congestion_control,
            max_bitrate_bps: config.recovery_maxbitrate as u64 * 1000,
            return_cap_bps: config.recovery_maxbitrate_return as u64 * 1000,
            min_retries: config.min_retries,
            budget: 0,
            scale: 1.0,
            data_bytes: 0,
            retry_bytes: 0,
            packets_sent: 0,
            packets_nacked: 0,
            last_stats: CongestionStats {
                scale: 1.0,
                ..Default::default()
            },
        };
        controller.budget = controller.compute_budget(0, interval);
        controller
    }

    pub fn mode(&self) -> CongestionMode {
        self.mode
    }

    /// Record an original data packet
    pub fn on_data_sent(&mut self, bytes: usize) {
        self.data_bytes += bytes as u64;
        self.packets_sent += 1;
    }

    /// Record sequence numbers reported lost by the receiver
    pub fn on_nack(&mut self, count: usize) {
        self.packets_nacked += count as u64;
    }

    /// Try to take `bytes` from the budget for a retransmission
    ///
    /// `retry` is the attempt number of this retransmission; attempts up to
    /// the configured minimum are always allowed.
    pub fn try_consume(&mut self, bytes: usize, retry: u32) -> bool {
        let bytes = bytes as u64;
        let allowed = match self.mode {
            CongestionMode::Off => true,
            _ if retry <= self.min_retries => true,
            _ => self.budget >= bytes,
        };
        if allowed {
            self.budget = self.budget.saturating_sub(bytes);
            self.retry_bytes += bytes;
        }
        allowed
    }

    /// Give back bytes taken for a retransmission that was not sent
    pub fn refund(&mut self, bytes: usize) {
        let bytes = bytes as u64;
        self.budget += bytes;
        self.retry_bytes = self.retry_bytes.saturating_sub(bytes);
    }

    /// Remaining budget in bytes (`u64::MAX` when unlimited)
    pub fn budget(&self) -> u64 {
        match self.mode {
            CongestionMode::Off => u64::MAX,
            _ => self.budget,
        }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Close the interval that just elapsed and open the next one
    pub fn on_interval(&mut self, elapsed: Duration) -> CongestionStats {
        let secs = elapsed.as_secs_f64().max(1e-3);
        let data_bps = (self.data_bytes as f64 * 8.0 / secs) as u64;
        let retry_bps = (self.retry_bytes as f64 * 8.0 / secs) as u64;
        let nack_ratio = if self.packets_sent == 0 {
            0.0
        } else {
            self.packets_nacked as f64 / self.packets_sent as f64
        };

        let (threshold, cut, step) = match self.mode {
            CongestionMode::Aggressive => (0.05, 0.5, 0.1),
            _ => (0.10, 0.75, 0.05),
        };
        if nack_ratio > threshold {
            self.scale = (self.scale * cut).max(MIN_SCALE);
        } else {
            self.scale = (self.scale + step).min(1.0);
        }

        self.budget = self.compute_budget(data_bps, elapsed);
        self.data_bytes = 0;
        self.retry_bytes = 0;
        self.packets_sent = 0;
        self.packets_nacked = 0;

        self.last_stats = CongestionStats {
            data_bps,
            retry_bps,
            nack_ratio,
            scale: self.scale,
        };
        self.last_stats
    }

    /// Statistics of the last closed interval
    pub fn last_stats(&self) -> CongestionStats {
        self.last_stats
    }

    fn compute_budget(&self, data_bps: u64, interval: Duration) -> u64 {
        let headroom = self.max_bitrate_bps.saturating_sub(data_bps);
        let allowed_bps = if self.return_cap_bps > 0 {
            headroom.min(self.return_cap_bps)
        } else {
            headroom
        };
        (allowed_bps as f64 / 8.0 * interval.as_secs_f64() * self.scale) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mode: CongestionMode) -> PeerConfig {
        PeerConfig {
            congestion_control: mode,
            recovery_maxbitrate: 1000,
            recovery_maxbitrate_return: 0,
            min_retries: 0,
            ..PeerConfig::default()
        }
    }

    #[test]
    fn test_initial_budget() {
        // 1 Mbps over one second
        let cc = CongestionController::new(&config(CongestionMode::Normal), Duration::from_secs(1));
        assert_eq!(cc.budget(), 125_000);
    }

    #[test]
    fn test_return_cap() {
        let mut cfg = config(CongestionMode::Normal);
        cfg.recovery_maxbitrate_return = 80;
        let cc = CongestionController::new(&cfg, Duration::from_secs(1));
        assert_eq!(cc.budget(), 10_000);
    }

    #[test]
    fn test_budget_exhaustion_and_refund() {
        let mut cfg = config(CongestionMode::Normal);
        cfg.recovery_maxbitrate_return = 8;
        let mut cc = CongestionController::new(&cfg, Duration::from_secs(1));
        assert_eq!(cc.budget(), 1000);

        assert!(cc.try_consume(600, 1));
        assert!(!cc.try_consume(600, 1));
        cc.refund(600);
        assert!(cc.try_consume(1000, 1));
        assert_eq!(cc.budget(), 0);
    }

    #[test]
    fn test_min_retries_bypass() {
        let mut cfg = config(CongestionMode::Normal);
        cfg.recovery_maxbitrate_return = 8;
        cfg.min_retries = 2;
        let mut cc = CongestionController::new(&cfg, Duration::from_secs(1));

        assert!(cc.try_consume(5000, 1));
        assert!(cc.try_consume(5000, 2));
        assert!(!cc.try_consume(5000, 3));
    }

    #[test]
    fn test_off_is_unlimited() {
        let mut cc = CongestionController::new(&config(CongestionMode::Off), Duration::from_secs(1));
        assert_eq!(cc.budget(), u64::MAX);
        assert!(cc.try_consume(10_000_000, 50));
    }

    #[test]
    fn test_loss_spike_normal_vs_aggressive() {
        let interval = Duration::from_secs(1);
        let mut normal = CongestionController::new(&config(CongestionMode::Normal), interval);
        let mut aggressive =
            CongestionController::new(&config(CongestionMode::Aggressive), interval);

        for cc in [&mut normal, &mut aggressive] {
            for _ in 0..100 {
                cc.on_data_sent(100);
            }
            cc.on_nack(20);
        }

        let stats = normal.on_interval(interval);
        assert!((stats.nack_ratio - 0.2).abs() < 1e-9);
        assert!((normal.scale() - 0.75).abs() < 1e-9);
        assert!((aggressive.on_interval(interval).scale - 0.5).abs() < 1e-9);

        // Quiet interval ramps back up
        normal.on_interval(interval);
        assert!((normal.scale() - 0.80).abs() < 1e-9);
    }

    #[test]
    fn test_scale_floor() {
        let interval = Duration::from_secs(1);
        let mut cc = CongestionController::new(&config(CongestionMode::Aggressive), interval);
        for _ in 0..20 {
            cc.on_data_sent(100);
            cc.on_nack(1);
            cc.on_interval(interval);
        }
        assert!((cc.scale() - MIN_SCALE).abs() < 1e-9);
    }

    #[test]
    fn test_data_reduces_headroom() {
        let interval = Duration::from_secs(1);
        let mut cc = CongestionController::new(&config(CongestionMode::Normal), interval);
        // 500 kbit of data in one second
        for _ in 0..625 {
            cc.on_data_sent(100);
        }
        let stats = cc.on_interval(interval);
        assert_eq!(stats.data_bps, 500_000);
        // Scale stays at 1.0 (no NACKs), half the bitrate remains
        assert_eq!(cc.budget(), 62_500);
    }
}
