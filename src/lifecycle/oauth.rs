//! Standard OAuth 2.0 refresh-token grant, usable for any provider whose
//! token endpoint follows RFC 6749.

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::debug;

use super::{RefreshError, RefreshedToken, TokenRefresher};

/// Refreshes tokens by POSTing `grant_type=refresh_token` to a provider
/// token endpoint.
///
/// HTTP 4xx responses mean the grant itself was rejected (consumed or
/// revoked refresh token) and map to [`RefreshError::Denied`]; network
/// failures and 5xx responses map to [`RefreshError::Transient`] so the
/// caller can retry with backoff.
pub struct OAuthRefresher {
    http_client: reqwest::Client,
    token_url: String,
    client_id: Option<String>,
    client_secret: Option<String>,
}

impl OAuthRefresher {
    pub fn new(token_url: String) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            token_url,
            client_id: None,
            client_secret: None,
        }
    }

    /// Attaches client credentials for providers that require them on the
    /// refresh grant.
    pub fn with_client_credentials(mut self, client_id: String, client_secret: String) -> Self {
        self.client_id = Some(client_id);
        self.client_secret = Some(client_secret);
        self
    }
}

#[async_trait]
impl TokenRefresher for OAuthRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, RefreshError> {
        let mut form: HashMap<&str, &str> = HashMap::new();
        form.insert("grant_type", "refresh_token");
        form.insert("refresh_token", refresh_token);
        if let Some(client_id) = &self.client_id {
            form.insert("client_id", client_id.as_str());
        }
        if let Some(client_secret) = &self.client_secret {
            form.insert("client_secret", client_secret.as_str());
        }

        debug!(token_url = %self.token_url, "Sending token refresh request");

        let response = self
            .http_client
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| RefreshError::Transient(format!("refresh request failed: {}", e)))?;

        let status = response.status();
        if status.is_client_error() {
            // Provider error text stays internal; the grant is dead either way
            let body = response.text().await.unwrap_or_default();
            return Err(RefreshError::Denied(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }
        if !status.is_success() {
            return Err(RefreshError::Transient(format!(
                "token endpoint returned {}",
                status
            )));
        }

        response
            .json::<RefreshedToken>()
            .await
            .map_err(|e| RefreshError::Transient(format!("invalid token response: {}", e)))
    }
}
