//! AES-256-GCM envelope encryption for secrets at rest.
//!
//! Every secret is encrypted separately with a fresh random nonce and stored
//! as a three-part envelope (ciphertext, nonce, tag), each field base64.
//! The master key must be 32 bytes (256 bits) and comes from an environment
//! variable; it is held in memory only.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::error::VaultError;

/// Size of the master key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes
const TAG_SIZE: usize = 16;

/// Process-wide master key, validated once at construction.
///
/// An explicitly-owned handle rather than a module-level singleton, so tests
/// can run with distinct keys and the key's lifetime is visible at the
/// call sites that hold it.
#[derive(Clone)]
pub struct MasterKey([u8; KEY_SIZE]);

impl MasterKey {
    /// Decodes and validates a base64-encoded master key.
    ///
    /// # Returns
    /// * `Ok(MasterKey)` - Key decoded to exactly 32 bytes
    /// * `Err(InvalidMasterKey)` - Invalid base64 or wrong length (fatal,
    ///   non-retryable configuration error)
    pub fn from_base64(key_base64: &str) -> Result<Self, VaultError> {
        let key_bytes = BASE64
            .decode(key_base64)
            .map_err(|_| VaultError::InvalidMasterKey("not valid base64".to_string()))?;

        if key_bytes.len() != KEY_SIZE {
            return Err(VaultError::InvalidMasterKey(format!(
                "must decode to {} bytes (256 bits), got {}",
                KEY_SIZE,
                key_bytes.len()
            )));
        }

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&key_bytes);
        Ok(Self(key))
    }

    /// Reads the master key from an environment variable.
    ///
    /// Absence is the same fatal error as a malformed key.
    pub fn from_env(var: &str) -> Result<Self, VaultError> {
        let raw = std::env::var(var)
            .map_err(|_| VaultError::InvalidMasterKey(format!("{} is not set", var)))?;
        Self::from_base64(&raw)
    }
}

// Never print key material, even in debug output.
impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MasterKey(..)")
    }
}

/// Three-part encrypted envelope stored in place of a plaintext secret.
///
/// All fields are base64-encoded for storage. The nonce is unique per
/// encryption call; the tag is the fixed 16-byte GCM authentication tag.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub ciphertext: String,
    pub nonce: String,
    pub tag: String,
}

/// Authenticated encryption of opaque byte payloads under a master key.
pub struct EnvelopeCipher {
    key: MasterKey,
}

impl EnvelopeCipher {
    pub fn new(key: MasterKey) -> Self {
        Self { key }
    }

    /// Encrypts a payload with a fresh random nonce.
    ///
    /// The AEAD output is split into ciphertext and the trailing 16-byte
    /// authentication tag so each part can be stored in its own column.
    ///
    /// # Security
    /// - Nonce comes from `OsRng` and is never reused
    /// - Plaintext and key material are never logged
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Envelope, VaultError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key.0)
            .map_err(|_| VaultError::EncryptionFailed)?;

        let nonce_bytes = Aes256Gcm::generate_nonce(&mut OsRng);

        let mut combined = cipher
            .encrypt(&nonce_bytes, plaintext)
            .map_err(|_| VaultError::EncryptionFailed)?;

        // aes-gcm appends the tag to the ciphertext; split it off
        let tag_bytes = combined.split_off(combined.len() - TAG_SIZE);

        Ok(Envelope {
            ciphertext: BASE64.encode(&combined),
            nonce: BASE64.encode(nonce_bytes),
            tag: BASE64.encode(&tag_bytes),
        })
    }

    /// Decrypts an envelope.
    ///
    /// Every failure mode (bad base64, wrong nonce length, tampered
    /// ciphertext or tag, wrong key) collapses to the single generic
    /// `DecryptionFailed` so callers cannot distinguish why decryption
    /// failed.
    pub fn decrypt(&self, envelope: &Envelope) -> Result<Vec<u8>, VaultError> {
        let mut ciphertext = BASE64
            .decode(&envelope.ciphertext)
            .map_err(|_| VaultError::DecryptionFailed)?;
        let nonce_bytes = BASE64
            .decode(&envelope.nonce)
            .map_err(|_| VaultError::DecryptionFailed)?;
        let tag_bytes = BASE64
            .decode(&envelope.tag)
            .map_err(|_| VaultError::DecryptionFailed)?;

        if nonce_bytes.len() != NONCE_SIZE || tag_bytes.len() != TAG_SIZE {
            return Err(VaultError::DecryptionFailed);
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key.0)
            .map_err(|_| VaultError::DecryptionFailed)?;

        // Recombine ciphertext || tag for the AEAD API
        ciphertext.extend_from_slice(&tag_bytes);

        let nonce = Nonce::from_slice(&nonce_bytes);
        cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| VaultError::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn test_cipher() -> EnvelopeCipher {
        EnvelopeCipher::new(MasterKey::from_base64(&BASE64.encode([7u8; 32])).unwrap())
    }

    #[test]
    fn test_master_key_validation() {
        // Valid 32-byte key
        assert!(MasterKey::from_base64(&BASE64.encode([0u8; 32])).is_ok());

        // Too short
        assert!(matches!(
            MasterKey::from_base64(&BASE64.encode([0u8; 16])),
            Err(VaultError::InvalidMasterKey(_))
        ));

        // Too long
        assert!(matches!(
            MasterKey::from_base64(&BASE64.encode([0u8; 64])),
            Err(VaultError::InvalidMasterKey(_))
        ));

        // Invalid base64
        assert!(matches!(
            MasterKey::from_base64("not-valid-base64!@#$"),
            Err(VaultError::InvalidMasterKey(_))
        ));
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let cipher = test_cipher();
        let plaintext = b"my-secret-access-token-12345";

        let envelope = cipher.encrypt(plaintext).expect("Encryption failed");
        assert_ne!(envelope.ciphertext.as_bytes(), plaintext.as_slice());

        let decrypted = cipher.decrypt(&envelope).expect("Decryption failed");
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_roundtrip_empty_and_binary_payloads() {
        let cipher = test_cipher();
        for payload in [&b""[..], &[0u8, 255, 1, 254, 128][..]] {
            let envelope = cipher.encrypt(payload).unwrap();
            assert_eq!(cipher.decrypt(&envelope).unwrap(), payload);
        }
    }

    #[test]
    fn test_nonce_uniqueness() {
        let cipher = test_cipher();
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let envelope = cipher.encrypt(b"same-plaintext").unwrap();
            assert!(seen.insert(envelope.nonce), "nonce reused");
        }
    }

    #[test]
    fn test_tag_is_sixteen_bytes() {
        let cipher = test_cipher();
        let envelope = cipher.encrypt(b"secret").unwrap();
        assert_eq!(BASE64.decode(&envelope.tag).unwrap().len(), TAG_SIZE);
        assert_eq!(BASE64.decode(&envelope.nonce).unwrap().len(), NONCE_SIZE);
    }

    #[test]
    fn test_wrong_key_fails() {
        let cipher1 = test_cipher();
        let cipher2 =
            EnvelopeCipher::new(MasterKey::from_base64(&BASE64.encode([9u8; 32])).unwrap());

        let envelope = cipher1.encrypt(b"secret").unwrap();
        assert_eq!(cipher2.decrypt(&envelope), Err(VaultError::DecryptionFailed));
    }

    #[test]
    fn test_single_bit_tamper_detected() {
        let cipher = test_cipher();
        let envelope = cipher.encrypt(b"secret payload").unwrap();

        // Flip one bit in every byte position of ciphertext and tag
        for field in ["ciphertext", "tag"] {
            let original = match field {
                "ciphertext" => BASE64.decode(&envelope.ciphertext).unwrap(),
                _ => BASE64.decode(&envelope.tag).unwrap(),
            };
            for i in 0..original.len() {
                let mut tampered_bytes = original.clone();
                tampered_bytes[i] ^= 0x01;
                let mut tampered = envelope.clone();
                match field {
                    "ciphertext" => tampered.ciphertext = BASE64.encode(&tampered_bytes),
                    _ => tampered.tag = BASE64.encode(&tampered_bytes),
                }
                assert_eq!(
                    cipher.decrypt(&tampered),
                    Err(VaultError::DecryptionFailed),
                    "bit flip in {} byte {} not detected",
                    field,
                    i
                );
            }
        }
    }

    #[test]
    fn test_malformed_nonce_is_generic_failure() {
        let cipher = test_cipher();
        let mut envelope = cipher.encrypt(b"secret").unwrap();

        envelope.nonce = BASE64.encode([0u8; 8]);
        assert_eq!(cipher.decrypt(&envelope), Err(VaultError::DecryptionFailed));

        envelope.nonce = "not base64!".to_string();
        assert_eq!(cipher.decrypt(&envelope), Err(VaultError::DecryptionFailed));
    }
}
