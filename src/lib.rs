// Envelope encryption (AES-256-GCM) for secrets at rest
pub mod envelope;

// Encrypted credential records keyed by tenant scope + integration
pub mod store;

// Token freshness, provider refresh, and race-safe commits
pub mod lifecycle;

// Inbound webhook signature verification
pub mod webhook;

// Configuration
pub mod config;

// Closed error taxonomy
pub mod error;

pub use config::VaultConfig;
pub use envelope::{Envelope, EnvelopeCipher, MasterKey};
pub use error::VaultError;
pub use lifecycle::{OAuthRefresher, RefreshError, RefreshedToken, TokenManager, TokenRefresher, TokenState};
pub use store::{CredentialRecord, CredentialStore, Scope};
pub use webhook::{RejectReason, VerifiedEvent};
