//! Token lifecycle management: freshness decisions, provider refresh, and
//! race-safe commits.
//!
//! The manager is the only consumer-facing surface for tokens. A request
//! handler asks for a usable token; the manager reads the store, decrypts,
//! checks expiry against a safety margin, and - if stale - drives the
//! provider refresh and commits the result through a conditional write.
//!
//! # Refresh race
//! Refresh tokens issued by many providers are single-use. Two concurrent
//! callers can both observe a stale record and both refresh; a plain upsert
//! would then let the losing response clobber the winning one. Every refresh
//! therefore commits via `compare_and_put` against the `updated_at` read
//! before the provider call. On conflict the just-fetched token is discarded
//! and the record re-read - the provider is never called a second time.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::VaultConfig;
use crate::error::VaultError;
use crate::store::{CredentialStore, Scope};

pub mod oauth;

pub use oauth::OAuthRefresher;

/// Logical view of a decrypted credential payload.
///
/// Serialized as JSON inside the envelope. Absent `expires_at` means the
/// token never expires (static API keys).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TokenState {
    /// Token presented to the provider API
    pub access_token: String,

    /// Token used to obtain new access tokens (absent for API keys)
    #[serde(default)]
    pub refresh_token: Option<String>,

    /// When the access token expires (UTC); None = non-expiring
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    /// Token type as issued by the provider, usually "bearer"
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// Provider-granted scopes, space-separated (opaque here)
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl TokenState {
    /// True if the token is usable without a refresh: no expiry, or expiry
    /// beyond `now + safety_margin`. A token expiring exactly at the margin
    /// is already stale - it could expire mid-flight at the provider.
    pub fn is_fresh(&self, now: DateTime<Utc>, safety_margin: Duration) -> bool {
        match self.expires_at {
            None => true,
            Some(expires_at) => expires_at > now + safety_margin,
        }
    }
}

/// Successful provider refresh response.
#[derive(Clone, Debug, Deserialize)]
pub struct RefreshedToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// Why a provider refresh failed.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshError {
    /// The provider rejected the refresh token (revoked, consumed,
    /// or expired grant). The user must reconnect the integration.
    Denied(String),
    /// Network failure or provider 5xx; retryable by the caller.
    Transient(String),
}

impl std::fmt::Display for RefreshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefreshError::Denied(msg) => write!(f, "Refresh denied: {}", msg),
            RefreshError::Transient(msg) => write!(f, "Refresh failed: {}", msg),
        }
    }
}

impl std::error::Error for RefreshError {}

/// Provider-specific refresh collaborator.
///
/// Implementations exchange a refresh token for a new access token; the
/// manager treats them as opaque. See [`OAuthRefresher`] for the standard
/// `grant_type=refresh_token` implementation.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, RefreshError>;
}

/// Drives the Fresh / Stale / Refreshing / NeedsReauth state machine for
/// each (tenant, integration) credential.
pub struct TokenManager {
    store: Arc<CredentialStore>,
    safety_margin: Duration,
    refresh_timeout: std::time::Duration,
}

impl TokenManager {
    pub fn new(
        store: Arc<CredentialStore>,
        safety_margin: Duration,
        refresh_timeout: std::time::Duration,
    ) -> Self {
        Self {
            store,
            safety_margin,
            refresh_timeout,
        }
    }

    pub fn from_config(store: Arc<CredentialStore>, config: &VaultConfig) -> Self {
        Self::new(
            store,
            Duration::seconds(config.safety_margin_secs),
            std::time::Duration::from_secs(config.refresh_timeout_secs),
        )
    }

    /// Encrypts and stores a credential (initial submission or manual
    /// replacement). Upsert: an existing record is overwritten.
    pub fn store_credential(
        &self,
        scope: &Scope,
        integration_name: &str,
        state: &TokenState,
    ) -> Result<(), VaultError> {
        let payload = encode_state(state)?;
        self.store.put(scope, integration_name, &payload)
    }

    /// Hard-deletes a credential on explicit revocation. Idempotent.
    pub fn revoke(&self, scope: &Scope, integration_name: &str) -> Result<(), VaultError> {
        info!(scope = %scope, integration = %integration_name, "Revoking credential");
        self.store.delete(scope, integration_name)
    }

    /// Returns a usable token for (tenant, integration), refreshing it
    /// through `refresher` first if it is stale.
    ///
    /// # Returns
    /// * `Ok(Some(state))` - Token is fresh (possibly just refreshed)
    /// * `Ok(None)` - No credential stored for this key
    /// * `Err(ReauthRequired)` - No refresh token, or the provider rejected
    ///   it; the application should prompt the user to reconnect
    /// * `Err(RefreshTransient)` - Network/5xx/timeout; the caller may retry
    ///   with backoff (the manager never retries the provider itself)
    pub async fn get_usable_token(
        &self,
        scope: &Scope,
        integration_name: &str,
        refresher: &dyn TokenRefresher,
    ) -> Result<Option<TokenState>, VaultError> {
        let record = match self.store.get(scope, integration_name)? {
            Some(r) => r,
            None => return Ok(None),
        };

        let state = decode_state(&self.store.decrypt(&record)?)?;

        let now = Utc::now();
        if state.is_fresh(now, self.safety_margin) {
            return Ok(Some(state));
        }

        // Stale. Without a refresh token the only way forward is the user
        // re-authorizing the integration.
        let refresh_token = match &state.refresh_token {
            Some(t) => t.clone(),
            None => {
                warn!(
                    scope = %scope,
                    integration = %integration_name,
                    "Token expired and no refresh token stored"
                );
                return Err(VaultError::ReauthRequired);
            }
        };

        info!(
            scope = %scope,
            integration = %integration_name,
            "Access token stale, refreshing"
        );

        // Bounded provider call. A timeout aborts the attempt before the
        // commit step, so the record is never left partially updated.
        let refreshed =
            match tokio::time::timeout(self.refresh_timeout, refresher.refresh(&refresh_token))
                .await
            {
                Err(_) => {
                    warn!(
                        scope = %scope,
                        integration = %integration_name,
                        "Token refresh timed out"
                    );
                    return Err(VaultError::RefreshTransient(
                        "provider refresh timed out".to_string(),
                    ));
                }
                Ok(Err(RefreshError::Denied(msg))) => {
                    warn!(
                        scope = %scope,
                        integration = %integration_name,
                        reason = %msg,
                        "Provider rejected refresh token"
                    );
                    return Err(VaultError::ReauthRequired);
                }
                Ok(Err(RefreshError::Transient(msg))) => {
                    return Err(VaultError::RefreshTransient(msg));
                }
                Ok(Ok(r)) => r,
            };

        // Keep the previous refresh token if the provider did not rotate it
        let new_state = TokenState {
            access_token: refreshed.access_token,
            refresh_token: refreshed.refresh_token.or(Some(refresh_token)),
            expires_at: refreshed.expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
            token_type: state.token_type.clone(),
            scope: state.scope.clone(),
        };

        let committed = self.store.compare_and_put(
            scope,
            integration_name,
            &encode_state(&new_state)?,
            &record.updated_at,
        )?;

        if committed {
            info!(
                scope = %scope,
                integration = %integration_name,
                "Refreshed token committed"
            );
            return Ok(Some(new_state));
        }

        // Lost the conditional write: another caller refreshed concurrently.
        // Discard our response (its refresh token lineage is already dead)
        // and trust the committed record instead.
        info!(
            scope = %scope,
            integration = %integration_name,
            "Concurrent refresh won the commit, re-reading"
        );

        let current = match self.store.get(scope, integration_name)? {
            Some(r) => r,
            // Revoked between the conflict and the re-read
            None => return Ok(None),
        };

        let current_state = decode_state(&self.store.decrypt(&current)?)?;
        if current_state.is_fresh(Utc::now(), self.safety_margin) {
            Ok(Some(current_state))
        } else {
            // The winning writer committed something already stale; let the
            // caller retry rather than spending another refresh token here.
            Err(VaultError::RefreshTransient(
                "concurrent refresh left a stale token".to_string(),
            ))
        }
    }
}

fn encode_state(state: &TokenState) -> Result<Vec<u8>, VaultError> {
    serde_json::to_vec(state)
        .map_err(|_| VaultError::Storage("failed to serialize token state".to_string()))
}

fn decode_state(payload: &[u8]) -> Result<TokenState, VaultError> {
    serde_json::from_slice(payload)
        .map_err(|_| VaultError::Storage("credential payload is not valid token state".to_string()))
}
