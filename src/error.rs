//! Error taxonomy for the credential subsystem.
//!
//! A closed enum so callers can pattern-match on the failure kind
//! (re-auth vs transient vs fatal config) instead of string-matching
//! error messages. `NotFound` is deliberately absent: a missing record
//! is a valid state and surfaces as `Ok(None)`.

/// Errors produced by the envelope cipher, credential store, and
/// token lifecycle manager.
#[derive(Debug, Clone, PartialEq)]
pub enum VaultError {
    /// Master key is missing, not valid base64, or not 32 bytes once
    /// decoded. Fatal configuration error - refuse to start.
    InvalidMasterKey(String),
    /// AEAD encryption failed.
    EncryptionFailed,
    /// Decryption failed. Deliberately non-distinguishing: tampered
    /// ciphertext, wrong key, and malformed nonce all produce this
    /// same variant so the failure mode cannot be probed.
    DecryptionFailed,
    /// The refresh token was rejected by the provider (or the record
    /// has no refresh token). The user must re-authorize the
    /// integration; retrying will not help.
    ReauthRequired,
    /// Network failure, timeout, or provider 5xx during refresh.
    /// Retryable by the caller with backoff; never auto-retried here
    /// because refresh tokens may be single-use.
    RefreshTransient(String),
    /// Underlying database failure.
    Storage(String),
}

impl std::fmt::Display for VaultError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VaultError::InvalidMasterKey(msg) => write!(f, "Invalid master key: {}", msg),
            VaultError::EncryptionFailed => write!(f, "Encryption failed"),
            VaultError::DecryptionFailed => write!(f, "Decryption failed"),
            VaultError::ReauthRequired => write!(f, "Integration requires re-authorization"),
            VaultError::RefreshTransient(msg) => write!(f, "Token refresh failed: {}", msg),
            VaultError::Storage(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl std::error::Error for VaultError {}

impl From<rusqlite::Error> for VaultError {
    fn from(e: rusqlite::Error) -> Self {
        VaultError::Storage(e.to_string())
    }
}
