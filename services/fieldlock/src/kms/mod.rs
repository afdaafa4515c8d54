//! Master-key custody and device-key cryptography.
//!
//! Per-device AES-128 keys are stored envelope-encrypted under a process-wide
//! 32-byte master key: `nonce(12) || aes256gcm_ciphertext_and_tag`. The master
//! key is loaded once at startup and sits behind a read lock so a future
//! rotation path can take the write side.

use std::path::Path;
use std::sync::{Arc, RwLock};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use anyhow::{anyhow, bail, Result};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use thiserror::Error;
use tracing::warn;
use zeroize::Zeroizing;

pub const MASTER_KEY_LEN: usize = 32;
pub const DEVICE_KEY_LEN: usize = 16;
pub const DEVICE_MAC_LEN: usize = 16;
const NONCE_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KmsError {
    /// The stored blob is truncated, was tampered with, or the master key
    /// cannot initialize the cipher.
    #[error("stored device key is corrupted")]
    KeyCorrupted,
    #[error("device key must be 32 lowercase hex characters")]
    InvalidDeviceKey,
}

#[derive(Clone)]
pub struct Kms {
    master_key: Arc<RwLock<Zeroizing<[u8; MASTER_KEY_LEN]>>>,
}

impl Kms {
    /// Load the master key from `path`.
    ///
    /// Files shorter than 32 bytes are zero-padded with a warning. A missing
    /// file yields an ephemeral random key in debug mode; release deployments
    /// refuse to start, since every wrapped device key would become
    /// undecryptable on restart.
    ///
    /// # Errors
    /// Returns an error when the key file is absent in release mode.
    pub fn init(path: &Path, release_mode: bool) -> Result<Self> {
        let key = match std::fs::read(path) {
            Ok(bytes) => {
                let bytes = Zeroizing::new(bytes);
                if bytes.len() < MASTER_KEY_LEN {
                    warn!(
                        path = %path.display(),
                        len = bytes.len(),
                        "master key file shorter than 32 bytes, zero-padding"
                    );
                }
                let mut key = Zeroizing::new([0u8; MASTER_KEY_LEN]);
                let n = bytes.len().min(MASTER_KEY_LEN);
                key[..n].copy_from_slice(&bytes[..n]);
                key
            }
            Err(err) => {
                if release_mode {
                    bail!(
                        "master key file {} is not readable ({err}); refusing to start in release mode",
                        path.display()
                    );
                }
                warn!(
                    path = %path.display(),
                    "master key file not found, generating ephemeral key (development only)"
                );
                let mut key = Zeroizing::new([0u8; MASTER_KEY_LEN]);
                OsRng.fill_bytes(&mut key[..]);
                key
            }
        };
        Ok(Self {
            master_key: Arc::new(RwLock::new(key)),
        })
    }

    /// Build a KMS around an explicit key. Used by tests and the ephemeral path.
    #[must_use]
    pub fn from_key(key: [u8; MASTER_KEY_LEN]) -> Self {
        Self {
            master_key: Arc::new(RwLock::new(Zeroizing::new(key))),
        }
    }

    /// Encrypt a plaintext device key under the master key.
    ///
    /// # Errors
    /// Returns an error if the cipher rejects the input or the key lock is
    /// poisoned.
    pub fn wrap(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let guard = self
            .master_key
            .read()
            .map_err(|_| anyhow!("master key lock poisoned"))?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&guard[..]));

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|_| anyhow!("envelope encryption failed"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt an envelope-encrypted device key.
    ///
    /// The plaintext comes back in a [`Zeroizing`] buffer so it is wiped on
    /// every exit path of the caller, unwinds included.
    ///
    /// # Errors
    /// Returns [`KmsError::KeyCorrupted`] on truncated input or failed
    /// authentication.
    pub fn unwrap(&self, opaque: &[u8]) -> Result<Zeroizing<Vec<u8>>, KmsError> {
        if opaque.len() < NONCE_LEN {
            return Err(KmsError::KeyCorrupted);
        }
        let guard = self.master_key.read().map_err(|_| KmsError::KeyCorrupted)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&guard[..]));

        let (nonce, ciphertext) = opaque.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| KmsError::KeyCorrupted)
    }
}

/// MAC over `data` with a device key: HMAC-SHA-256 truncated to the leading
/// 16 bytes. This is the exact value the lock firmware recomputes, as a
/// portable substitute for AES-128-CMAC.
///
/// # Errors
/// Returns an error if the key cannot initialize HMAC.
pub fn device_mac(device_key: &[u8], data: &[u8]) -> Result<[u8; DEVICE_MAC_LEN]> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(device_key)
        .map_err(|err| anyhow!("device key rejected by hmac: {err}"))?;
    mac.update(data);
    let full = mac.finalize().into_bytes();
    let mut out = [0u8; DEVICE_MAC_LEN];
    out.copy_from_slice(&full[..DEVICE_MAC_LEN]);
    Ok(out)
}

/// Parse an operator-supplied device key: exactly 32 lowercase hex characters
/// (AES-128). The decoded bytes are zeroed when dropped.
///
/// # Errors
/// Returns [`KmsError::InvalidDeviceKey`] on wrong length or stray characters.
pub fn parse_device_key(hex_key: &str) -> Result<Zeroizing<[u8; DEVICE_KEY_LEN]>, KmsError> {
    if hex_key.len() != DEVICE_KEY_LEN * 2
        || !hex_key
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    {
        return Err(KmsError::InvalidDeviceKey);
    }
    let bytes = Zeroizing::new(hex::decode(hex_key).map_err(|_| KmsError::InvalidDeviceKey)?);
    let mut key = Zeroizing::new([0u8; DEVICE_KEY_LEN]);
    key.copy_from_slice(&bytes);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kms() -> Kms {
        Kms::from_key([7u8; MASTER_KEY_LEN])
    }

    #[test]
    fn wrap_unwrap_round_trip() {
        let kms = kms();
        let key = [0xab_u8; DEVICE_KEY_LEN];
        let wrapped = kms.wrap(&key).expect("wrap");
        assert_eq!(wrapped.len(), NONCE_LEN + DEVICE_KEY_LEN + 16);
        let plain = kms.unwrap(&wrapped).expect("unwrap");
        assert_eq!(plain.as_slice(), key.as_slice());
    }

    #[test]
    fn wrapping_is_randomized() {
        let kms = kms();
        let key = [0u8; DEVICE_KEY_LEN];
        let first = kms.wrap(&key).expect("wrap");
        let second = kms.wrap(&key).expect("wrap");
        assert_ne!(first, second);
    }

    #[test]
    fn any_bit_flip_fails_authentication() {
        let kms = kms();
        let wrapped = kms.wrap(&[0x5a_u8; DEVICE_KEY_LEN]).expect("wrap");
        for byte in 0..wrapped.len() {
            for bit in 0..8 {
                let mut tampered = wrapped.clone();
                tampered[byte] ^= 1 << bit;
                assert_eq!(
                    kms.unwrap(&tampered).unwrap_err(),
                    KmsError::KeyCorrupted,
                    "byte {byte} bit {bit}"
                );
            }
        }
    }

    #[test]
    fn truncated_blob_is_corrupted() {
        let kms = kms();
        assert_eq!(kms.unwrap(&[0u8; 11]).unwrap_err(), KmsError::KeyCorrupted);
        assert_eq!(kms.unwrap(&[]).unwrap_err(), KmsError::KeyCorrupted);
    }

    #[test]
    fn wrong_master_key_cannot_unwrap() {
        let wrapped = kms().wrap(&[1u8; DEVICE_KEY_LEN]).expect("wrap");
        let other = Kms::from_key([8u8; MASTER_KEY_LEN]);
        assert_eq!(other.unwrap(&wrapped).unwrap_err(), KmsError::KeyCorrupted);
    }

    #[test]
    fn device_mac_is_truncated_hmac() {
        let key = b"0123456789abcdef";
        let data = b"challenge-bytes";
        let mac = device_mac(key, data).expect("mac");

        let mut full = <Hmac<Sha256> as Mac>::new_from_slice(key).expect("hmac");
        full.update(data);
        let full = full.finalize().into_bytes();

        assert_eq!(mac.len(), DEVICE_MAC_LEN);
        assert_eq!(&mac[..], &full[..DEVICE_MAC_LEN]);
    }

    #[test]
    fn parse_device_key_accepts_lowercase_hex() {
        let key = parse_device_key("0123456789abcdef0123456789abcdef").expect("parse");
        assert_eq!(key[0], 0x01);
        assert_eq!(key[15], 0xef);
    }

    #[test]
    fn parse_device_key_rejects_bad_input() {
        assert_eq!(
            parse_device_key("0123").unwrap_err(),
            KmsError::InvalidDeviceKey
        );
        assert_eq!(
            parse_device_key("0123456789ABCDEF0123456789ABCDEF").unwrap_err(),
            KmsError::InvalidDeviceKey
        );
        assert_eq!(
            parse_device_key("0123456789abcdex0123456789abcdef").unwrap_err(),
            KmsError::InvalidDeviceKey
        );
    }
}
