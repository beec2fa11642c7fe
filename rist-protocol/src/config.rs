//! Peer configuration
//!
//! [`PeerConfig`] carries every per-peer tunable. The default values live in
//! one immutable instance built on first use; `PeerConfig::default()` clones
//! it.

use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Limit for short strings (cname, secret, interface, credentials)
pub const RIST_MAX_STRING_SHORT: usize = 128;

/// Limit for long strings (addresses)
pub const RIST_MAX_STRING_LONG: usize = 256;

/// Default virtual source port
pub const DEFAULT_VIRT_SRC_PORT: u16 = 1971;

/// Default virtual destination port
pub const DEFAULT_VIRT_DST_PORT: u16 = 1968;

/// Protocol profile chosen at context creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    /// Virtual ports omitted, no out-of-band channel
    Simple,
    #[default]
    Main,
    /// Not supported
    Advanced,
}

impl Profile {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Profile::Simple),
            1 => Some(Profile::Main),
            2 => Some(Profile::Advanced),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Profile::Simple => "simple",
            Profile::Main => "main",
            Profile::Advanced => "advanced",
        }
    }
}

/// Loss recovery mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryMode {
    Unconfigured,
    /// No retransmissions; gaps are released after the reorder delay
    Disabled,
    /// Recovery window expressed in milliseconds
    #[default]
    Time,
}

/// Which timestamp delivered blocks carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimingMode {
    /// Timestamp assigned by the sender
    #[default]
    Source,
    /// Time the packet arrived
    Arrival,
    /// Time the block is handed to the application
    Rtc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressFamily {
    #[default]
    Inet,
    Inet6,
}

/// Congestion control mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CongestionMode {
    /// No shaping; every NACK is honoured up to the retry limit
    Off,
    #[default]
    Normal,
    /// Faster ramp-down on loss spikes and earlier first NACK
    Aggressive,
}

impl CongestionMode {
    /// Delay before a fresh gap is NACKed
    ///
    /// Normal waits for the larger of one RTT or the reorder delay.
    /// Aggressive halves both.
    pub fn nack_delay(self, rtt: Duration, reorder_delay: Duration) -> Duration {
        match self {
            CongestionMode::Aggressive => (rtt / 2).max(reorder_delay / 2),
            CongestionMode::Off | CongestionMode::Normal => rtt.max(reorder_delay),
        }
    }
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} is {len} bytes, limit is {max}")]
    StringTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("Username and password must be set together")]
    NullCredentials,

    #[error("{min_field} ({min}) exceeds {max_field} ({max})")]
    InvalidRange {
        min_field: &'static str,
        min: u32,
        max_field: &'static str,
        max: u32,
    },

    #[error("Unsupported key size {0} (expected 128 or 256)")]
    InvalidKeySize(u32),
}

/// Configuration of one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub address_family: AddressFamily,
    /// `host:port`; a listening peer binds it instead of connecting
    pub address: String,
    /// Multicast / bind interface name
    pub miface: String,
    pub physical_port: u16,
    pub initiate_conn: bool,
    pub virt_src_port: u16,
    pub virt_dst_port: u16,

    pub recovery_mode: RecoveryMode,
    /// Overall bandwidth cap (kbps)
    pub recovery_maxbitrate: u32,
    /// Retransmission bandwidth cap (kbps), 0 for uncapped
    pub recovery_maxbitrate_return: u32,
    pub recovery_length_min: u32,
    pub recovery_length_max: u32,
    pub recovery_reorder_buffer: u32,
    pub recovery_rtt_min: u32,
    pub recovery_rtt_max: u32,

    /// 0 duplicates, otherwise a share of the traffic
    pub weight: u32,

    pub secret: String,
    /// 0, 128 or 256; 0 with a secret means 128
    pub key_size: u32,
    /// Packets per key, 0 never rotates
    pub key_rotation: u32,

    pub compression: bool,
    pub cname: String,
    pub congestion_control: CongestionMode,
    pub min_retries: u32,
    pub max_retries: u32,
    pub session_timeout: u32,
    pub keepalive_interval: u32,
    pub timing_mode: TimingMode,

    pub srp_username: String,
    pub srp_password: String,
}

impl PeerConfig {
    /// The process-wide default configuration
    pub fn defaults() -> &'static PeerConfig {
        static DEFAULTS: OnceLock<PeerConfig> = OnceLock::new();
        DEFAULTS.get_or_init(|| PeerConfig {
            address_family: AddressFamily::Inet,
            address: String::new(),
            miface: String::new(),
            physical_port: 0,
            initiate_conn: true,
            virt_src_port: DEFAULT_VIRT_SRC_PORT,
            virt_dst_port: DEFAULT_VIRT_DST_PORT,
            recovery_mode: RecoveryMode::Time,
            recovery_maxbitrate: 100_000,
            recovery_maxbitrate_return: 0,
            recovery_length_min: 1000,
            recovery_length_max: 1000,
            recovery_reorder_buffer: 25,
            recovery_rtt_min: 50,
            recovery_rtt_max: 500,
            weight: 0,
            secret: String::new(),
            key_size: 0,
            key_rotation: 0,
            compression: false,
            cname: String::new(),
            congestion_control: CongestionMode::Normal,
            min_retries: 6,
            max_retries: 20,
            session_timeout: 2000,
            keepalive_interval: 1000,
            timing_mode: TimingMode::Source,
            srp_username: String::new(),
            srp_password: String::new(),
        })
    }

    /// Default configuration for `address`
    pub fn new(address: impl Into<String>) -> Self {
        PeerConfig {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Check string limits, credential pairing and min/max pairs
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_len("address", &self.address, RIST_MAX_STRING_LONG)?;
        for (field, value) in [
            ("miface", &self.miface),
            ("secret", &self.secret),
            ("cname", &self.cname),
            ("srp_username", &self.srp_username),
            ("srp_password", &self.srp_password),
        ] {
            check_len(field, value, RIST_MAX_STRING_SHORT)?;
        }

        if self.srp_username.is_empty() != self.srp_password.is_empty() {
            return Err(ConfigError::NullCredentials);
        }

        check_range(
            ("recovery_length_min", self.recovery_length_min),
            ("recovery_length_max", self.recovery_length_max),
        )?;
        check_range(
            ("recovery_rtt_min", self.recovery_rtt_min),
            ("recovery_rtt_max", self.recovery_rtt_max),
        )?;
        check_range(
            ("min_retries", self.min_retries),
            ("max_retries", self.max_retries),
        )?;

        match self.key_size {
            0 | 128 | 256 => Ok(()),
            other => Err(ConfigError::InvalidKeySize(other)),
        }
    }

    /// Key size in effect, or `None` when encryption is off
    pub fn effective_key_size(&self) -> Option<u32> {
        if self.secret.is_empty() {
            None
        } else if self.key_size == 0 {
            Some(128)
        } else {
            Some(self.key_size)
        }
    }

    pub fn recovery_length_min(&self) -> Duration {
        Duration::from_millis(self.recovery_length_min as u64)
    }

    pub fn recovery_length_max(&self) -> Duration {
        Duration::from_millis(self.recovery_length_max as u64)
    }

    pub fn reorder_buffer(&self) -> Duration {
        Duration::from_millis(self.recovery_reorder_buffer as u64)
    }

    pub fn rtt_min(&self) -> Duration {
        Duration::from_millis(self.recovery_rtt_min as u64)
    }

    pub fn rtt_max(&self) -> Duration {
        Duration::from_millis(self.recovery_rtt_max as u64)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout as u64)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval as u64)
    }

    /// Bytes the recovery cache may hold: max bitrate over the longest window
    pub fn recovery_byte_cap(&self) -> u64 {
        self.recovery_maxbitrate as u64 * 1000 / 8 * self.recovery_length_max as u64 / 1000
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self::defaults().clone()
    }
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), ConfigError> {
    if value.len() >= max {
        return Err(ConfigError::StringTooLong {
            field,
            len: value.len(),
            max,
        });
    }
    Ok(())
}

fn check_range(min: (&'static str, u32), max: (&'static str, u32)) -> Result<(), ConfigError> {
    if min.1 > max.1 {
        return Err(ConfigError::InvalidRange {
            min_field: min.0,
            min: min.1,
            max_field: max.0,
            max: max.1,
        });
    }
    Ok(())
}
