//! Time utilities for RIST
//!
//! RIST carries 64-bit NTP timestamps (seconds since 1900 in the high 32
//! bits, binary fraction in the low 32 bits) on data blocks, and
//! microsecond offsets from a per-context monotonic base for RTT echoes.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970)
pub const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Current wall-clock time as a 64-bit NTP timestamp
pub fn ntp_now() -> u64 {
    ntp_from_system(SystemTime::now())
}

/// Convert a system time to a 64-bit NTP timestamp
pub fn ntp_from_system(time: SystemTime) -> u64 {
    let since_unix = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    let secs = since_unix.as_secs() + NTP_UNIX_OFFSET;
    let frac = ((since_unix.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (secs << 32) | frac
}

/// Convert a 64-bit NTP timestamp to microseconds since the Unix epoch
pub fn ntp_to_unix_micros(ntp: u64) -> u64 {
    let secs = (ntp >> 32).saturating_sub(NTP_UNIX_OFFSET);
    let frac_us = ((ntp & 0xFFFF_FFFF) * 1_000_000) >> 32;
    secs * 1_000_000 + frac_us
}

/// Monotonic clock with a fixed base
///
/// Echo requests carry `now_us()`; the matching response is converted back
/// with `elapsed_since_us` to get an RTT sample.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    base: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            base: Instant::now(),
        }
    }

    /// Microseconds since the clock was created
    pub fn now_us(&self) -> u64 {
        self.micros_at(Instant::now())
    }

    /// Microseconds from the base to `instant`
    pub fn micros_at(&self, instant: Instant) -> u64 {
        instant
            .saturating_duration_since(self.base)
            .as_micros()
            .try_into()
            .unwrap_or(u64::MAX)
    }

    /// Time elapsed between an earlier `now_us()` value and `now`
    pub fn elapsed_since_us(&self, earlier_us: u64, now: Instant) -> Duration {
        Duration::from_micros(self.micros_at(now).saturating_sub(earlier_us))
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Timer for periodic operations
///
/// Drives keepalives, echo requests and statistics intervals.
#[derive(Debug, Clone)]
pub struct Timer {
    interval: Duration,
    last_fire: Instant,
}

impl Timer {
    /// Create a new timer with the given interval, starting at `now`
    pub fn new(interval: Duration, now: Instant) -> Self {
        Timer {
            interval,
            last_fire: now,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Change the interval without resetting the phase
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Check if the timer has expired
    pub fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_fire) >= self.interval
    }

    /// Get time until next expiration
    pub fn time_until_expiration(&self, now: Instant) -> Duration {
        self.interval
            .saturating_sub(now.saturating_duration_since(self.last_fire))
    }

    /// Fire the timer if expired, returning the time since the last firing
    pub fn try_fire(&mut self, now: Instant) -> Option<Duration> {
        if self.expired(now) {
            let elapsed = now.saturating_duration_since(self.last_fire);
            self.last_fire = now;
            Some(elapsed)
        } else {
            None
        }
    }
}

/// Rate limiter using token bucket algorithm
///
/// Paces original data so a flow never exceeds its configured maximum
/// bitrate.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    /// Maximum tokens (burst size)
    capacity: u64,
    tokens: u64,
    /// Tokens added per microsecond
    rate: f64,
    last_update: Instant,
}

impl RateLimiter {
    /// Create a new rate limiter
    ///
    /// # Arguments
    /// * `rate_bps` - Rate in bits per second
    /// * `burst_bytes` - Maximum burst size in bytes
    pub fn new(rate_bps: u64, burst_bytes: u64, now: Instant) -> Self {
        RateLimiter {
            capacity: burst_bytes,
            tokens: burst_bytes,
            rate: rate_bps as f64 / 8.0 / 1_000_000.0,
            last_update: now,
        }
    }

    /// Update the rate
    pub fn set_rate(&mut self, rate_bps: u64, now: Instant) {
        self.refill(now);
        self.rate = rate_bps as f64 / 8.0 / 1_000_000.0;
    }

    fn refill(&mut self, now: Instant) {
        let elapsed_us = now.saturating_duration_since(self.last_update).as_micros() as f64;
        let new_tokens = (elapsed_us * self.rate) as u64;

        if new_tokens > 0 {
            self.tokens = (self.tokens + new_tokens).min(self.capacity);
            self.last_update = now;
        }
    }

    /// Consume tokens for sending `bytes` worth of data
    ///
    /// Returns true if successful, false if insufficient tokens
    pub fn consume(&mut self, bytes: usize, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= bytes as u64 {
            self.tokens -= bytes as u64;
            true
        } else {
            false
        }
    }

    /// Get time to wait before `bytes` will be available
    ///
    /// Requests larger than the burst size are treated as a full bucket.
    pub fn time_to_available(&mut self, bytes: usize, now: Instant) -> Duration {
        self.refill(now);

        let bytes = (bytes as u64).min(self.capacity);
        if self.tokens >= bytes || self.rate <= 0.0 {
            return Duration::ZERO;
        }

        let needed = bytes - self.tokens;
        Duration::from_micros((needed as f64 / self.rate).ceil() as u64)
    }

    /// Wait for `bytes` worth of tokens, then consume them
    pub fn acquire(&mut self, bytes: usize) {
        loop {
            let now = Instant::now();
            let wait = self.time_to_available(bytes, now);
            if wait.is_zero() {
                let take = (bytes as u64).min(self.tokens);
                self.tokens -= take;
                return;
            }
            std::thread::sleep(wait);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ntp_epoch() {
        let unix_epoch = ntp_from_system(UNIX_EPOCH);
        assert_eq!(unix_epoch >> 32, NTP_UNIX_OFFSET);
        assert_eq!(unix_epoch & 0xFFFF_FFFF, 0);

        let half = ntp_from_system(UNIX_EPOCH + Duration::from_millis(1500));
        assert_eq!(half >> 32, NTP_UNIX_OFFSET + 1);
        assert_eq!(half & 0xFFFF_FFFF, 1 << 31);
        assert_eq!(ntp_to_unix_micros(half), 1_500_000);
    }

    #[test]
    fn test_ntp_now_is_recent() {
        let secs = ntp_now() >> 32;
        // After 2020-01-01
        assert!(secs > NTP_UNIX_OFFSET + 1_577_836_800);
    }

    #[test]
    fn test_clock() {
        let clock = Clock::new();
        let start = Instant::now();
        let sent = clock.micros_at(start);
        let rtt = clock.elapsed_since_us(sent, start + Duration::from_millis(30));
        assert_eq!(rtt, Duration::from_millis(30));
        assert_eq!(clock.elapsed_since_us(u64::MAX, start), Duration::ZERO);
    }

    #[test]
    fn test_timer() {
        let start = Instant::now();
        let mut timer = Timer::new(Duration::from_millis(10), start);
        assert!(!timer.expired(start));
        assert_eq!(timer.time_until_expiration(start), Duration::from_millis(10));

        let later = start + Duration::from_millis(12);
        assert_eq!(timer.try_fire(later), Some(Duration::from_millis(12)));
        assert_eq!(timer.try_fire(later), None);
    }

    #[test]
    fn test_rate_limiter() {
        let start = Instant::now();
        // 1 MB/s = 1 byte per microsecond
        let mut limiter = RateLimiter::new(8_000_000, 1000, start);

        assert!(limiter.consume(500, start));
        assert!(limiter.consume(500, start));
        assert!(!limiter.consume(100, start));

        assert!(limiter.consume(100, start + Duration::from_micros(100)));
    }

    #[test]
    fn test_rate_limiter_time_to_available() {
        let start = Instant::now();
        // 1 Mbps, 100 byte burst
        let mut limiter = RateLimiter::new(1_000_000, 100, start);
        limiter.consume(100, start);

        assert_eq!(
            limiter.time_to_available(100, start),
            Duration::from_micros(800)
        );
        assert_eq!(
            limiter.time_to_available(1_000_000, start),
            Duration::from_micros(800)
        );
    }

    proptest! {
        #[test]
        fn prop_rate_limiter_never_exceeds_budget(
            rate_bps in 8_000u64..100_000_000,
            burst in 1_000u64..100_000,
            steps in prop::collection::vec((0u64..10_000, 1usize..2_000), 1..200),
        ) {
            let start = Instant::now();
            let mut limiter = RateLimiter::new(rate_bps, burst, start);
            let mut elapsed_us = 0u64;
            let mut admitted = 0u64;
            for (advance_us, bytes) in steps {
                elapsed_us += advance_us;
                if limiter.consume(bytes, start + Duration::from_micros(elapsed_us)) {
                    admitted += bytes as u64;
                }
            }
            let budget = burst as f64 + elapsed_us as f64 * rate_bps as f64 / 8_000_000.0;
            prop_assert!(admitted as f64 <= budget + 1.0);
        }
    }
}
