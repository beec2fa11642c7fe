//! RIST Encryption
//!
//! This crate provides payload encryption for RIST peers that share a
//! secret, behind a pluggable backend trait. The bundled backend is AES-GCM
//! (128 or 256 bit) via the ring library, with PBKDF2 key derivation and
//! periodic key rotation.

pub mod backend;
pub mod ring_impl;

pub use backend::{
    CryptoError, KeySize, PacketCipher, EPOCH_LEN, EXPLICIT_NONCE_LEN, SEALED_PREFIX_LEN,
};
pub use ring_impl::{derive_key, AesGcmCipher, TAG_LEN};
