//! Envelope encryption for secret material at rest.
//!
//! AES-256-GCM with a fresh 12-byte random nonce per seal. Every sealed
//! record carries the key version it was sealed under, so key rotation can
//! be added later without rewriting stored rows.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use thiserror::Error;

/// Version tag written alongside every ciphertext.
pub const CURRENT_KEY_VERSION: u32 = 1;

/// AES-256-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("DECRYPT_FAILED: ciphertext authentication failed")]
    DecryptFailed,
    #[error("DECRYPT_FAILED: unknown key version {0}")]
    UnknownKeyVersion(u32),
    #[error("encryption key must be 32 bytes (64 hex characters)")]
    InvalidKey,
    #[error("failed to seal plaintext")]
    SealFailed,
}

/// Output of [`EnvelopeCipher::seal`].
#[derive(Debug, Clone)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub key_version: u32,
}

/// Process-wide secret cipher, constructed once at startup from the
/// configured 32-byte key.
#[derive(Clone)]
pub struct EnvelopeCipher {
    cipher: Aes256Gcm,
    key_version: u32,
}

impl EnvelopeCipher {
    /// Build a cipher from a 64-character hex-encoded 32-byte key.
    pub fn from_hex(hex_key: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex_key.trim()).map_err(|_| CryptoError::InvalidKey)?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self::from_key_bytes(&key))
    }

    pub fn from_key_bytes(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
            key_version: CURRENT_KEY_VERSION,
        }
    }

    pub fn key_version(&self) -> u32 {
        self.key_version
    }

    /// Encrypt `plaintext` under a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Sealed, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::SealFailed)?;

        Ok(Sealed {
            ciphertext,
            nonce: nonce_bytes.to_vec(),
            key_version: self.key_version,
        })
    }

    /// Decrypt and authenticate. Fails closed: a tag mismatch, a malformed
    /// nonce, or a key version this process does not hold all surface as
    /// [`CryptoError`] — never as garbage plaintext.
    pub fn open(
        &self,
        ciphertext: &[u8],
        nonce: &[u8],
        key_version: u32,
    ) -> Result<Vec<u8>, CryptoError> {
        if key_version != self.key_version {
            return Err(CryptoError::UnknownKeyVersion(key_version));
        }
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::DecryptFailed);
        }

        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> EnvelopeCipher {
        EnvelopeCipher::from_key_bytes(&[7u8; 32])
    }

    #[test]
    fn seal_open_round_trip() {
        let cipher = test_cipher();
        let sealed = cipher.seal(b"hunter2").expect("seal");

        let plaintext = cipher
            .open(&sealed.ciphertext, &sealed.nonce, sealed.key_version)
            .expect("open");
        assert_eq!(plaintext, b"hunter2");
    }

    #[test]
    fn round_trips_large_binary_values() {
        let cipher = test_cipher();
        let value: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
        let sealed = cipher.seal(&value).expect("seal");

        let plaintext = cipher
            .open(&sealed.ciphertext, &sealed.nonce, sealed.key_version)
            .expect("open");
        assert_eq!(plaintext, value);
    }

    #[test]
    fn nonces_are_unique_per_seal() {
        let cipher = test_cipher();
        let a = cipher.seal(b"same").expect("seal a");
        let b = cipher.seal(b"same").expect("seal b");

        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn tampered_ciphertext_fails_closed() {
        let cipher = test_cipher();
        let mut sealed = cipher.seal(b"secret").expect("seal");
        sealed.ciphertext[0] ^= 0xff;

        let err = cipher
            .open(&sealed.ciphertext, &sealed.nonce, sealed.key_version)
            .expect_err("tampered ciphertext must not decrypt");
        assert_eq!(err, CryptoError::DecryptFailed);
    }

    #[test]
    fn tampered_nonce_fails_closed() {
        let cipher = test_cipher();
        let mut sealed = cipher.seal(b"secret").expect("seal");
        sealed.nonce[3] ^= 0x01;

        let err = cipher
            .open(&sealed.ciphertext, &sealed.nonce, sealed.key_version)
            .expect_err("tampered nonce must not decrypt");
        assert_eq!(err, CryptoError::DecryptFailed);
    }

    #[test]
    fn unknown_key_version_is_rejected() {
        let cipher = test_cipher();
        let sealed = cipher.seal(b"secret").expect("seal");

        let err = cipher
            .open(&sealed.ciphertext, &sealed.nonce, 99)
            .expect_err("unknown key version must not decrypt");
        assert_eq!(err, CryptoError::UnknownKeyVersion(99));
    }

    #[test]
    fn wrong_key_fails_closed() {
        let sealed = test_cipher().seal(b"secret").expect("seal");
        let other = EnvelopeCipher::from_key_bytes(&[8u8; 32]);

        let err = other
            .open(&sealed.ciphertext, &sealed.nonce, sealed.key_version)
            .expect_err("wrong key must not decrypt");
        assert_eq!(err, CryptoError::DecryptFailed);
    }

    #[test]
    fn from_hex_rejects_short_keys() {
        assert!(EnvelopeCipher::from_hex("abcd").is_err());
        assert!(EnvelopeCipher::from_hex("not hex at all").is_err());
        assert!(EnvelopeCipher::from_hex(&"ab".repeat(32)).is_ok());
    }
}
