//! Session errors and RIST error codes

use crate::context::Role;
use rist_bonding::GroupError;
use rist_crypto::CryptoError;
use rist_io::SocketError;
use rist_protocol::{ConfigError, UrlError};
use thiserror::Error;

/// Errors returned by context operations
#[derive(Error, Debug)]
pub enum RistError {
    #[error("Resource allocation failed: {0}")]
    Malloc(String),

    #[error("Unknown or missing peer")]
    NullPeer,

    #[error("String too long: {0}")]
    InvalidStringLength(String),

    #[error("Unsupported profile: {0}")]
    InvalidProfile(&'static str),

    #[error("Missing callback: {0}")]
    MissingCallback(&'static str),

    #[error("Username and password must be set together")]
    NullCredentials,

    #[error("Context has been destroyed")]
    Destroyed,

    #[error("Operation not available on a {0} context")]
    WrongRole(Role),

    #[error("Context is not running")]
    NotRunning,

    #[error("Context is already running")]
    AlreadyRunning,

    #[error("Delivery mode conflict: {0}")]
    DeliveryMode(&'static str),

    #[error("Invalid data block: {0}")]
    InvalidBlock(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Flow id {0} is already in use")]
    FlowIdInUse(u32),

    #[error("Invalid configuration: {0}")]
    Config(ConfigError),

    #[error(transparent)]
    Url(#[from] UrlError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl RistError {
    /// Negative RIST error code
    pub fn code(&self) -> i32 {
        match self {
            RistError::Malloc(_) => -1,
            RistError::NullPeer => -2,
            RistError::InvalidStringLength(_) => -3,
            RistError::InvalidProfile(_) => -4,
            RistError::MissingCallback(_) => -5,
            RistError::NullCredentials => -6,
            _ => -1,
        }
    }
}

impl From<ConfigError> for RistError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::StringTooLong { .. } => RistError::InvalidStringLength(err.to_string()),
            ConfigError::NullCredentials => RistError::NullCredentials,
            other => RistError::Config(other),
        }
    }
}

impl From<SocketError> for RistError {
    fn from(err: SocketError) -> Self {
        RistError::Malloc(err.to_string())
    }
}

impl From<GroupError> for RistError {
    fn from(err: GroupError) -> Self {
        match err {
            GroupError::MemberNotFound(_) | GroupError::NoMembers => RistError::NullPeer,
            other => RistError::Malloc(other.to_string()),
        }
    }
}

/// Result type for context operations
pub type Result<T> = std::result::Result<T, RistError>;
