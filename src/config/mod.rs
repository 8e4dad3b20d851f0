//! Vault configuration.
//!
//! Defaults work out of the box; a TOML file and `CREDVAULT_*` environment
//! variables override them. The master key is deliberately not part of this
//! struct - it is environment-only (`CREDVAULT_MASTER_KEY`) so it can never
//! end up in a checked-in config file. See [`crate::envelope::MasterKey`].

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Environment variable holding the base64-encoded 32-byte master key.
pub const MASTER_KEY_ENV: &str = "CREDVAULT_MASTER_KEY";

/// Complete vault configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfig {
    /// Path to the SQLite credentials database
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Seconds before `expires_at` at which a token is already treated as
    /// expired, so it cannot expire mid-flight at the provider
    #[serde(default = "default_safety_margin")]
    pub safety_margin_secs: i64,

    /// Upper bound on the outbound provider refresh call
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_secs: u64,

    /// Replay window for inbound webhook timestamps
    #[serde(default = "default_webhook_tolerance")]
    pub webhook_tolerance_secs: i64,
}

fn default_db_path() -> String {
    "credentials.db".to_string()
}

fn default_safety_margin() -> i64 {
    60
}

fn default_refresh_timeout() -> u64 {
    10
}

fn default_webhook_tolerance() -> i64 {
    300
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            safety_margin_secs: default_safety_margin(),
            refresh_timeout_secs: default_refresh_timeout(),
            webhook_tolerance_secs: default_webhook_tolerance(),
        }
    }
}

impl VaultConfig {
    /// Loads configuration from a TOML file, then applies env overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;
        let mut cfg: Self = toml::from_str(&raw).context("Failed to parse config file")?;
        cfg.apply_env();
        Ok(cfg)
    }

    /// Builds from defaults plus env overrides, for deployments with no
    /// config file.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    /// Applies `CREDVAULT_*` environment overrides, ignoring unparseable
    /// values.
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("CREDVAULT_DB_PATH") {
            self.db_path = v;
        }
        if let Ok(v) = std::env::var("CREDVAULT_SAFETY_MARGIN_SECS") {
            if let Ok(n) = v.parse::<i64>() {
                self.safety_margin_secs = n;
            }
        }
        if let Ok(v) = std::env::var("CREDVAULT_REFRESH_TIMEOUT_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.refresh_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("CREDVAULT_WEBHOOK_TOLERANCE_SECS") {
            if let Ok(n) = v.parse::<i64>() {
                self.webhook_tolerance_secs = n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = VaultConfig::default();
        assert_eq!(cfg.db_path, "credentials.db");
        assert_eq!(cfg.safety_margin_secs, 60);
        assert_eq!(cfg.refresh_timeout_secs, 10);
        assert_eq!(cfg.webhook_tolerance_secs, 300);
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let cfg: VaultConfig = toml::from_str(
            r#"
            db_path = "/var/lib/credvault/creds.db"
            safety_margin_secs = 120
            "#,
        )
        .unwrap();

        assert_eq!(cfg.db_path, "/var/lib/credvault/creds.db");
        assert_eq!(cfg.safety_margin_secs, 120);
        assert_eq!(cfg.refresh_timeout_secs, 10);
        assert_eq!(cfg.webhook_tolerance_secs, 300);
    }

    #[test]
    fn test_empty_toml_is_all_defaults() {
        let cfg: VaultConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.safety_margin_secs, VaultConfig::default().safety_margin_secs);
    }
}
