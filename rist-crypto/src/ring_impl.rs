//! AES-GCM backend using ring
//!
//! Keys are derived from the shared secret with PBKDF2-HMAC-SHA256, one key
//! per epoch. The sender moves to the next epoch every `rotation` sealed
//! packets.
//!
//! Nonces are explicit: each cipher starts from a random 96-bit value and
//! counts up in the low 64 bits for every sealed packet, so a repeated
//! sequence number or a restarted sender never reuses one. The nonce travels
//! after the epoch; flow id and sequence number are bound as associated data.

use crate::backend::{CryptoError, KeySize, PacketCipher, EPOCH_LEN, SEALED_PREFIX_LEN};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, AES_256_GCM, NONCE_LEN};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::Arc;

const PBKDF2_ROUNDS: NonZeroU32 = match NonZeroU32::new(1000) {
    Some(n) => n,
    None => unreachable!(),
};

const SALT_PREFIX: &[u8] = b"rist-psk";

/// Epoch keys kept for opening packets that straddle a rotation
const KEY_CACHE_SIZE: usize = 4;

/// GCM tag length
pub const TAG_LEN: usize = 16;

/// Derive the raw key for `epoch`
pub fn derive_key(secret: &str, key_size: KeySize, epoch: u32) -> Vec<u8> {
    let mut salt = Vec::with_capacity(SALT_PREFIX.len() + 4);
    salt.extend_from_slice(SALT_PREFIX);
    salt.extend_from_slice(&epoch.to_be_bytes());

    let mut key = vec![0u8; key_size.key_len()];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        PBKDF2_ROUNDS,
        &salt,
        secret.as_bytes(),
        &mut key,
    );
    key
}

/// Derived keys by epoch, newest kept
struct KeyCache {
    secret: String,
    key_size: KeySize,
    keys: Mutex<BTreeMap<u32, Arc<LessSafeKey>>>,
}

impl KeyCache {
    fn new(secret: String, key_size: KeySize) -> Self {
        KeyCache {
            secret,
            key_size,
            keys: Mutex::new(BTreeMap::new()),
        }
    }

    fn get(&self, epoch: u32) -> Result<Arc<LessSafeKey>, CryptoError> {
        let mut keys = self.keys.lock();
        if let Some(key) = keys.get(&epoch) {
            return Ok(Arc::clone(key));
        }

        let algorithm = match self.key_size {
            KeySize::Aes128 => &AES_128_GCM,
            KeySize::Aes256 => &AES_256_GCM,
        };
        let raw = derive_key(&self.secret, self.key_size, epoch);
        let unbound = UnboundKey::new(algorithm, &raw).map_err(|_| CryptoError::InvalidKey)?;
        let key = Arc::new(LessSafeKey::new(unbound));

        keys.insert(epoch, Arc::clone(&key));
        while keys.len() > KEY_CACHE_SIZE {
            let Some(&oldest) = keys.keys().next() else {
                break;
            };
            keys.remove(&oldest);
        }
        Ok(key)
    }
}

#[derive(Debug)]
struct SealState {
    epoch: u32,
    sealed_in_epoch: u32,
    /// Fixed random high bits of the nonce
    nonce_prefix: [u8; 4],
    counter: u64,
}

impl SealState {
    fn random() -> Result<Self, CryptoError> {
        let mut seed = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut seed)
            .map_err(|_| CryptoError::RandomSource)?;
        let mut nonce_prefix = [0u8; 4];
        nonce_prefix.copy_from_slice(&seed[..4]);
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&seed[4..]);
        Ok(SealState {
            epoch: 0,
            sealed_in_epoch: 0,
            nonce_prefix,
            counter: u64::from_be_bytes(counter),
        })
    }

    fn next_nonce(&mut self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..4].copy_from_slice(&self.nonce_prefix);
        nonce[4..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter = self.counter.wrapping_add(1);
        nonce
    }
}

/// AES-GCM packet cipher
pub struct AesGcmCipher {
    keys: KeyCache,
    rotation: u32,
    state: Mutex<SealState>,
}

impl AesGcmCipher {
    /// Create a cipher for `secret`
    ///
    /// `rotation` is the number of packets sealed per key; 0 never rotates.
    pub fn new(secret: &str, key_size: KeySize, rotation: u32) -> Result<Self, CryptoError> {
        if secret.is_empty() {
            return Err(CryptoError::EmptySecret);
        }
        Ok(AesGcmCipher {
            keys: KeyCache::new(secret.to_string(), key_size),
            rotation,
            state: Mutex::new(SealState::random()?),
        })
    }

    /// Epoch the next sealed packet will use
    pub fn current_epoch(&self) -> u32 {
        self.state.lock().epoch
    }

    /// Epoch and nonce for the next sealed packet
    fn next_seal(&self) -> (u32, [u8; NONCE_LEN]) {
        let mut state = self.state.lock();
        if self.rotation > 0 && state.sealed_in_epoch >= self.rotation {
            state.epoch = state.epoch.wrapping_add(1);
            state.sealed_in_epoch = 0;
        }
        state.sealed_in_epoch += 1;
        (state.epoch, state.next_nonce())
    }
}

fn aad(flow_id: u32, seq: u32) -> [u8; 8] {
    let mut bytes = [0u8; 8];
    bytes[0..4].copy_from_slice(&flow_id.to_be_bytes());
    bytes[4..8].copy_from_slice(&seq.to_be_bytes());
    bytes
}

impl PacketCipher for AesGcmCipher {
    fn seal(&self, flow_id: u32, seq: u32, payload: &[u8]) -> Result<Bytes, CryptoError> {
        let (epoch, nonce) = self.next_seal();
        let key = self.keys.get(epoch)?;

        let mut in_out = payload.to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce),
            Aad::from(aad(flow_id, seq)),
            &mut in_out,
        )
        .map_err(|_| CryptoError::Seal)?;

        let mut out = BytesMut::with_capacity(SEALED_PREFIX_LEN + in_out.len());
        out.put_u32(epoch);
        out.put_slice(&nonce);
        out.put_slice(&in_out);
        Ok(out.freeze())
    }

    fn open(&self, flow_id: u32, seq: u32, sealed: &[u8]) -> Result<Bytes, CryptoError> {
        if sealed.len() < SEALED_PREFIX_LEN + TAG_LEN {
            return Err(CryptoError::Truncated(sealed.len()));
        }
        let mut epoch = [0u8; EPOCH_LEN];
        epoch.copy_from_slice(&sealed[..EPOCH_LEN]);
        let key = self.keys.get(u32::from_be_bytes(epoch))?;
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&sealed[EPOCH_LEN..SEALED_PREFIX_LEN]);

        let mut in_out = sealed[SEALED_PREFIX_LEN..].to_vec();
        let plain_len = key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(aad(flow_id, seq)),
                &mut in_out,
            )
            .map_err(|_| CryptoError::Open)?
            .len();
        in_out.truncate(plain_len);
        Ok(Bytes::from(in_out))
    }

    fn overhead(&self) -> usize {
        SEALED_PREFIX_LEN + TAG_LEN
    }

    fn key_size(&self) -> KeySize {
        self.keys.key_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_seal_open() {
        let cipher = AesGcmCipher::new("correct horse", KeySize::Aes128, 0).unwrap();
        let sealed = cipher.seal(7, 42, b"payload").unwrap();
        assert_eq!(sealed.len(), 7 + cipher.overhead());
        assert_ne!(&sealed[SEALED_PREFIX_LEN..SEALED_PREFIX_LEN + 7], b"payload");

        let peer = AesGcmCipher::new("correct horse", KeySize::Aes128, 0).unwrap();
        assert_eq!(peer.open(7, 42, &sealed).unwrap().as_ref(), b"payload");
    }

    #[test]
    fn test_wrong_secret_or_seq_fails() {
        let cipher = AesGcmCipher::new("one", KeySize::Aes256, 0).unwrap();
        let sealed = cipher.seal(1, 1, b"data").unwrap();

        let other = AesGcmCipher::new("two", KeySize::Aes256, 0).unwrap();
        assert_eq!(other.open(1, 1, &sealed), Err(CryptoError::Open));
        assert_eq!(cipher.open(1, 2, &sealed), Err(CryptoError::Open));
        assert_eq!(cipher.open(1, 1, &sealed[..10]), Err(CryptoError::Truncated(10)));
    }

    #[test]
    fn test_key_rotation() {
        let sender = AesGcmCipher::new("rotating", KeySize::Aes128, 2).unwrap();
        let receiver = AesGcmCipher::new("rotating", KeySize::Aes128, 2).unwrap();

        let mut epochs = Vec::new();
        for seq in 0..5u32 {
            let sealed = sender.seal(9, seq, &seq.to_be_bytes()).unwrap();
            epochs.push(u32::from_be_bytes([sealed[0], sealed[1], sealed[2], sealed[3]]));
            assert_eq!(receiver.open(9, seq, &sealed).unwrap().as_ref(), seq.to_be_bytes());
        }
        assert_eq!(epochs, vec![0, 0, 1, 1, 2]);
    }

    #[test]
    fn test_repeated_seq_gets_fresh_nonce() {
        let cipher = AesGcmCipher::new("shared", KeySize::Aes128, 0).unwrap();
        let first = cipher.seal(3, 100, b"first block").unwrap();
        let second = cipher.seal(3, 100, b"other block").unwrap();
        assert_ne!(
            &first[EPOCH_LEN..SEALED_PREFIX_LEN],
            &second[EPOCH_LEN..SEALED_PREFIX_LEN]
        );

        let peer = AesGcmCipher::new("shared", KeySize::Aes128, 0).unwrap();
        assert_eq!(peer.open(3, 100, &first).unwrap().as_ref(), b"first block");
        assert_eq!(peer.open(3, 100, &second).unwrap().as_ref(), b"other block");
    }

    #[test]
    fn test_restarted_sender_uses_new_nonces() {
        let before = AesGcmCipher::new("shared", KeySize::Aes256, 0).unwrap();
        let after = AesGcmCipher::new("shared", KeySize::Aes256, 0).unwrap();
        let a = before.seal(8, 1, b"x").unwrap();
        let b = after.seal(8, 1, b"x").unwrap();
        assert_eq!(&a[..EPOCH_LEN], &b[..EPOCH_LEN]);
        assert_ne!(&a[EPOCH_LEN..SEALED_PREFIX_LEN], &b[EPOCH_LEN..SEALED_PREFIX_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_nonce_fails() {
        let cipher = AesGcmCipher::new("shared", KeySize::Aes128, 0).unwrap();
        let mut sealed = cipher.seal(1, 1, b"data").unwrap().to_vec();
        sealed[EPOCH_LEN] ^= 0x01;
        assert_eq!(cipher.open(1, 1, &sealed), Err(CryptoError::Open));
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(matches!(
            AesGcmCipher::new("", KeySize::Aes128, 0),
            Err(CryptoError::EmptySecret)
        ));
    }

    #[test]
    fn test_derived_keys_differ_per_epoch() {
        let a = derive_key("s", KeySize::Aes256, 0);
        let b = derive_key("s", KeySize::Aes256, 1);
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_any_flipped_byte_is_rejected(
            payload in prop::collection::vec(any::<u8>(), 1..512),
            flow_id in any::<u32>(),
            seq in any::<u32>(),
            flip in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let sender = AesGcmCipher::new("secret", KeySize::Aes128, 0).unwrap();
            let receiver = AesGcmCipher::new("secret", KeySize::Aes128, 0).unwrap();
            let sealed = sender.seal(flow_id, seq, &payload).unwrap();
            let opened = receiver.open(flow_id, seq, &sealed).unwrap();
            prop_assert_eq!(opened.as_ref(), &payload[..]);

            let mut corrupted = sealed.to_vec();
            corrupted[flip.index(sealed.len())] ^= 1 << bit;
            prop_assert!(receiver.open(flow_id, seq, &corrupted).is_err());
        }
    }
}
