//! Configuration file support for RIST CLI tools

use rist::{parse_address, PeerConfig, Profile};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Profile name as written in config files and on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileName {
    Simple,
    #[default]
    Main,
    Advanced,
}

impl From<ProfileName> for Profile {
    fn from(name: ProfileName) -> Self {
        match name {
            ProfileName::Simple => Profile::Simple,
            ProfileName::Main => Profile::Main,
            ProfileName::Advanced => Profile::Advanced,
        }
    }
}

impl std::str::FromStr for ProfileName {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "0" | "simple" => Ok(ProfileName::Simple),
            "1" | "main" => Ok(ProfileName::Main),
            "2" | "advanced" => Ok(ProfileName::Advanced),
            other => Err(ConfigError::Invalid(format!("unknown profile '{other}'"))),
        }
    }
}

/// Sender configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Input source: file path, "-" for stdin, or a udp:// URL
    #[serde(default = "default_stdio")]
    pub input: String,
    /// rist:// peer URLs
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default)]
    pub profile: ProfileName,
    /// Statistics interval in milliseconds, 0 disables
    #[serde(default = "default_stats_interval")]
    pub stats_interval_ms: u64,
    /// Bytes per data block when reading a byte stream
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

/// Receiver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Output: file path, "-" for stdout, or a udp:// / rtp:// URL
    #[serde(default = "default_stdio")]
    pub output: String,
    /// rist:// peer URLs
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default)]
    pub profile: ProfileName,
    #[serde(default = "default_stats_interval")]
    pub stats_interval_ms: u64,
    /// Output FIFO size, rounded up to a power of two
    #[serde(default = "default_fifo_size")]
    pub fifo_size: usize,
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            input: default_stdio(),
            peers: Vec::new(),
            profile: ProfileName::default(),
            stats_interval_ms: default_stats_interval(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            output: default_stdio(),
            peers: Vec::new(),
            profile: ProfileName::default(),
            stats_interval_ms: default_stats_interval(),
            fifo_size: default_fifo_size(),
        }
    }
}

fn default_stdio() -> String {
    "-".to_string()
}

fn default_stats_interval() -> u64 {
    1000
}

fn default_chunk_size() -> usize {
    1316
}

fn default_fifo_size() -> usize {
    rist::DEFAULT_FIFO_SIZE
}

/// Combined configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub sender: Option<SenderConfig>,
    pub receiver: Option<ReceiverConfig>,
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Create example sender configuration
    pub fn example_sender() -> Self {
        Config {
            sender: Some(SenderConfig {
                input: "udp://@239.0.0.1:5000".to_string(),
                peers: vec![
                    "rist://192.168.1.10:8000?weight=1".to_string(),
                    "rist://192.168.2.10:8000?weight=3".to_string(),
                ],
                profile: ProfileName::Main,
                stats_interval_ms: 1000,
                chunk_size: default_chunk_size(),
            }),
            receiver: None,
        }
    }

    /// Create example receiver configuration
    pub fn example_receiver() -> Self {
        Config {
            sender: None,
            receiver: Some(ReceiverConfig {
                output: "udp://127.0.0.1:6000".to_string(),
                peers: vec!["rist://@0.0.0.0:8000?buffer=1000".to_string()],
                profile: ProfileName::Main,
                stats_interval_ms: 1000,
                fifo_size: default_fifo_size(),
            }),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Peer URL '{url}': {source}")]
    Url {
        url: String,
        source: rist::protocol::UrlError,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Parse every peer URL, failing on the first bad one
pub fn parse_peers(urls: &[String]) -> Result<Vec<PeerConfig>, ConfigError> {
    if urls.is_empty() {
        return Err(ConfigError::Invalid("at least one peer URL is required".into()));
    }
    urls.iter()
        .map(|url| {
            parse_address(url).map_err(|source| ConfigError::Url {
                url: url.clone(),
                source,
            })
        })
        .collect()
}

fn interval(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl SenderConfig {
    /// Statistics interval, `None` when disabled
    pub fn stats_interval(&self) -> Option<Duration> {
        interval(self.stats_interval_ms)
    }
}

impl ReceiverConfig {
    /// Statistics interval, `None` when disabled
    pub fn stats_interval(&self) -> Option<Duration> {
        interval(self.stats_interval_ms)
    }
}
