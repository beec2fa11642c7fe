//! Cipher backend interface
//!
//! The session layer seals payloads per peer through [`PacketCipher`] and
//! never sees key material. Sealed payloads start with the 32-bit key epoch
//! (big endian) so the receiver can follow key rotation without signalling,
//! followed by the 96-bit nonce the packet was sealed with.

use bytes::Bytes;
use thiserror::Error;

/// Length of the epoch field on a sealed payload
pub const EPOCH_LEN: usize = 4;

/// Length of the explicit nonce following the epoch
pub const EXPLICIT_NONCE_LEN: usize = 12;

/// Epoch plus nonce, in front of the ciphertext
pub const SEALED_PREFIX_LEN: usize = EPOCH_LEN + EXPLICIT_NONCE_LEN;

/// Encryption errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Unsupported key size {0} (expected 128 or 256)")]
    UnsupportedKeySize(u32),

    #[error("Empty secret")]
    EmptySecret,

    #[error("Sealed payload too short: {0} bytes")]
    Truncated(usize),

    #[error("Key setup failed")]
    InvalidKey,

    #[error("System random source unavailable")]
    RandomSource,

    #[error("Encryption failed")]
    Seal,

    #[error("Decryption failed (wrong secret or corrupted payload)")]
    Open,
}

/// AES key size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySize {
    Aes128,
    Aes256,
}

impl KeySize {
    /// Parse a key size in bits
    pub fn from_bits(bits: u32) -> Result<Self, CryptoError> {
        match bits {
            128 => Ok(KeySize::Aes128),
            256 => Ok(KeySize::Aes256),
            other => Err(CryptoError::UnsupportedKeySize(other)),
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            KeySize::Aes128 => 128,
            KeySize::Aes256 => 256,
        }
    }

    pub fn key_len(self) -> usize {
        self.bits() as usize / 8
    }
}

/// Seals and opens data payloads
pub trait PacketCipher: Send + Sync {
    /// Encrypt `payload` of packet `seq` in `flow_id`
    fn seal(&self, flow_id: u32, seq: u32, payload: &[u8]) -> Result<Bytes, CryptoError>;

    /// Decrypt a payload produced by [`PacketCipher::seal`]
    fn open(&self, flow_id: u32, seq: u32, sealed: &[u8]) -> Result<Bytes, CryptoError>;

    /// Bytes added to every payload
    fn overhead(&self) -> usize;

    fn key_size(&self) -> KeySize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_size() {
        assert_eq!(KeySize::from_bits(128), Ok(KeySize::Aes128));
        assert_eq!(KeySize::from_bits(256).map(KeySize::key_len), Ok(32));
        assert_eq!(
            KeySize::from_bits(192),
            Err(CryptoError::UnsupportedKeySize(192))
        );
    }
}
