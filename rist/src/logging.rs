//! Log levels and per-context logging settings
//!
//! The library logs through `tracing` and never installs a subscriber.
//! Each context owns a span tagged with its role and flow id; worker
//! threads enter it so every event they emit carries that context.

use tracing::level_filters::LevelFilter;
use tracing::Level;

/// RIST log levels (syslog numbering)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LogLevel {
    Disable,
    Error,
    Warn,
    Notice,
    #[default]
    Info,
    Debug,
    Simulate,
}

impl LogLevel {
    pub fn as_i32(self) -> i32 {
        match self {
            LogLevel::Disable => -1,
            LogLevel::Error => 3,
            LogLevel::Warn => 4,
            LogLevel::Notice => 5,
            LogLevel::Info => 6,
            LogLevel::Debug => 7,
            LogLevel::Simulate => 100,
        }
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            -1 => Some(LogLevel::Disable),
            3 => Some(LogLevel::Error),
            4 => Some(LogLevel::Warn),
            5 => Some(LogLevel::Notice),
            6 => Some(LogLevel::Info),
            7 => Some(LogLevel::Debug),
            100 => Some(LogLevel::Simulate),
            _ => None,
        }
    }

    /// Matching `tracing` level; `None` when logging is disabled
    pub fn as_tracing_level(self) -> Option<Level> {
        match self {
            LogLevel::Disable => None,
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Warn => Some(Level::WARN),
            LogLevel::Notice | LogLevel::Info => Some(Level::INFO),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Simulate => Some(Level::TRACE),
        }
    }

    pub fn as_level_filter(self) -> LevelFilter {
        match self.as_tracing_level() {
            Some(level) => LevelFilter::from_level(level),
            None => LevelFilter::OFF,
        }
    }
}

/// Logging settings passed at context creation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoggingSettings {
    pub level: LogLevel,
}

impl LoggingSettings {
    pub fn new(level: LogLevel) -> Self {
        LoggingSettings { level }
    }

    /// Whether events at `level` pass these settings
    pub fn enabled(&self, level: LogLevel) -> bool {
        self.level != LogLevel::Disable && level != LogLevel::Disable && level <= self.level
    }
}
