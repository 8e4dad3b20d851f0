//! Encrypted credential record storage using SQLite.
//!
//! Persists envelopes keyed by tenant scope + integration name. All secrets
//! are encrypted before they reach the database; plaintext never touches
//! disk.
//!
//! # Schema
//! ```sql
//! CREATE TABLE credentials (
//!     id INTEGER PRIMARY KEY,
//!     scope_user_id TEXT,
//!     scope_org_id TEXT,
//!     integration_name TEXT NOT NULL,
//!     ciphertext TEXT NOT NULL,
//!     nonce TEXT NOT NULL,
//!     tag TEXT NOT NULL,
//!     created_at TEXT NOT NULL,         -- ISO 8601 timestamp
//!     updated_at TEXT NOT NULL,         -- ISO 8601 timestamp, CAS token
//!     CHECK ((scope_user_id IS NULL) <> (scope_org_id IS NULL))
//! );
//! ```
//!
//! # Tenant isolation
//! Every operation takes a [`Scope`]; there is no code path that queries
//! without one, so cross-tenant reads are impossible by construction rather
//! than by a forgettable WHERE clause.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::envelope::{Envelope, EnvelopeCipher};
use crate::error::VaultError;

/// Tenant boundary a credential belongs to.
///
/// Exactly one of user or organization, enforced by the type rather than by
/// two nullable columns the application has to keep mutually exclusive.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    User(String),
    Organization(String),
}

impl Scope {
    /// Splits into the (scope_user_id, scope_org_id) column pair.
    fn columns(&self) -> (Option<&str>, Option<&str>) {
        match self {
            Scope::User(id) => (Some(id.as_str()), None),
            Scope::Organization(id) => (None, Some(id.as_str())),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::User(id) => write!(f, "user:{}", id),
            Scope::Organization(id) => write!(f, "org:{}", id),
        }
    }
}

/// A stored credential: the envelope plus the metadata the lifecycle
/// manager needs. `updated_at` doubles as the compare-and-swap token.
#[derive(Clone, Debug)]
pub struct CredentialRecord {
    pub envelope: Envelope,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Encrypted credential storage backed by SQLite.
///
/// # Concurrency
/// - Connection is wrapped in Mutex for safe concurrent access
/// - Plain `put` is last-write-wins; refresh commits must go through
///   [`compare_and_put`](CredentialStore::compare_and_put)
pub struct CredentialStore {
    conn: Mutex<Connection>,
    cipher: Arc<EnvelopeCipher>,
}

impl CredentialStore {
    /// Creates or opens a credential store.
    ///
    /// # Arguments
    /// * `db_path` - Path to SQLite database file (or `:memory:`)
    /// * `cipher` - Envelope cipher holding the validated master key
    pub fn new<P: AsRef<Path>>(db_path: P, cipher: Arc<EnvelopeCipher>) -> Result<Self, VaultError> {
        let conn = Connection::open(db_path)?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id INTEGER PRIMARY KEY,
                scope_user_id TEXT,
                scope_org_id TEXT,
                integration_name TEXT NOT NULL,
                ciphertext TEXT NOT NULL,
                nonce TEXT NOT NULL,
                tag TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK ((scope_user_id IS NULL) <> (scope_org_id IS NULL))
            )
            "#,
            [],
        )?;

        // Natural upsert key: one record per (tenant, integration). The
        // scope kind is part of the key so a user and an organization
        // sharing an id stay distinct tenants.
        conn.execute(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_scope_integration
            ON credentials(COALESCE('u:' || scope_user_id, 'o:' || scope_org_id), integration_name)
            "#,
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    /// Encrypts and stores a credential payload (upsert).
    ///
    /// Last-write-wins: concurrent `put`s for the same key resolve in the
    /// store's native upsert order. The refresh path must not use this -
    /// it goes through `compare_and_put`.
    pub fn put(&self, scope: &Scope, integration_name: &str, plaintext: &[u8]) -> Result<(), VaultError> {
        let envelope = self.cipher.encrypt(plaintext)?;
        let (user_id, org_id) = scope.columns();
        let now = Utc::now().to_rfc3339();

        self.conn.lock().unwrap().execute(
            r#"
            INSERT INTO credentials (
                scope_user_id, scope_org_id, integration_name,
                ciphertext, nonce, tag, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(COALESCE('u:' || scope_user_id, 'o:' || scope_org_id), integration_name)
            DO UPDATE SET
                ciphertext = excluded.ciphertext,
                nonce = excluded.nonce,
                tag = excluded.tag,
                updated_at = excluded.updated_at
            "#,
            params![
                user_id,
                org_id,
                integration_name,
                envelope.ciphertext,
                envelope.nonce,
                envelope.tag,
                now,
                now,
            ],
        )?;

        debug!(scope = %scope, integration = %integration_name, "Stored credential");
        Ok(())
    }

    /// Retrieves the stored envelope and metadata for a tenant/integration.
    ///
    /// # Returns
    /// * `Ok(Some(record))` - Record found (envelope still encrypted)
    /// * `Ok(None)` - No credential for this key; a valid state, not an error
    pub fn get(
        &self,
        scope: &Scope,
        integration_name: &str,
    ) -> Result<Option<CredentialRecord>, VaultError> {
        let (user_id, org_id) = scope.columns();
        let conn = self.conn.lock().unwrap();

        let row = conn
            .query_row(
                r#"
                SELECT ciphertext, nonce, tag, created_at, updated_at
                FROM credentials
                WHERE scope_user_id IS ?1 AND scope_org_id IS ?2
                  AND integration_name = ?3
                "#,
                params![user_id, org_id, integration_name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((ciphertext, nonce, tag, created_at, updated_at)) => {
                let created_at = parse_timestamp(&created_at)?;
                let updated_at = parse_timestamp(&updated_at)?;
                Ok(Some(CredentialRecord {
                    envelope: Envelope { ciphertext, nonce, tag },
                    created_at,
                    updated_at,
                }))
            }
            None => Ok(None),
        }
    }

    /// Conditionally replaces a credential: the write succeeds only if the
    /// record's `updated_at` is unchanged since the caller read it.
    ///
    /// # Returns
    /// * `Ok(true)` - Committed
    /// * `Ok(false)` - Conflict: another writer got there first; the caller
    ///   must discard its payload and re-read
    pub fn compare_and_put(
        &self,
        scope: &Scope,
        integration_name: &str,
        plaintext: &[u8],
        expected_updated_at: &DateTime<Utc>,
    ) -> Result<bool, VaultError> {
        let envelope = self.cipher.encrypt(plaintext)?;
        let (user_id, org_id) = scope.columns();
        let now = Utc::now().to_rfc3339();

        let rows_affected = self.conn.lock().unwrap().execute(
            r#"
            UPDATE credentials
            SET ciphertext = ?1, nonce = ?2, tag = ?3, updated_at = ?4
            WHERE scope_user_id IS ?5 AND scope_org_id IS ?6
              AND integration_name = ?7
              AND updated_at = ?8
            "#,
            params![
                envelope.ciphertext,
                envelope.nonce,
                envelope.tag,
                now,
                user_id,
                org_id,
                integration_name,
                expected_updated_at.to_rfc3339(),
            ],
        )?;

        if rows_affected == 0 {
            debug!(
                scope = %scope,
                integration = %integration_name,
                "Conditional write lost the race"
            );
        }
        Ok(rows_affected > 0)
    }

    /// Deletes a credential. Idempotent: deleting a missing record is Ok.
    pub fn delete(&self, scope: &Scope, integration_name: &str) -> Result<(), VaultError> {
        let (user_id, org_id) = scope.columns();
        self.conn.lock().unwrap().execute(
            r#"
            DELETE FROM credentials
            WHERE scope_user_id IS ?1 AND scope_org_id IS ?2
              AND integration_name = ?3
            "#,
            params![user_id, org_id, integration_name],
        )?;
        Ok(())
    }

    /// Lists the integration names with stored credentials for a tenant.
    pub fn list(&self, scope: &Scope) -> Result<Vec<String>, VaultError> {
        let (user_id, org_id) = scope.columns();
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT integration_name FROM credentials
            WHERE scope_user_id IS ?1 AND scope_org_id IS ?2
            ORDER BY integration_name
            "#,
        )?;

        let names = stmt
            .query_map(params![user_id, org_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        Ok(names)
    }

    /// Decrypts a fetched record's envelope.
    pub fn decrypt(&self, record: &CredentialRecord) -> Result<Vec<u8>, VaultError> {
        self.cipher.decrypt(&record.envelope)
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, VaultError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| VaultError::Storage(format!("bad timestamp in credentials row: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MasterKey;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    fn create_test_store() -> CredentialStore {
        let key = MasterKey::from_base64(&BASE64.encode([0u8; 32])).unwrap();
        let cipher = Arc::new(EnvelopeCipher::new(key));
        CredentialStore::new(":memory:", cipher).expect("Failed to create test store")
    }

    #[test]
    fn test_put_and_get_roundtrip() {
        let store = create_test_store();
        let scope = Scope::User("u1".to_string());

        store.put(&scope, "hubspot", b"secret-token").unwrap();

        let record = store.get(&scope, "hubspot").unwrap().expect("not found");
        assert_eq!(store.decrypt(&record).unwrap(), b"secret-token");
        assert_eq!(record.created_at, record.updated_at);
    }

    #[test]
    fn test_get_nonexistent() {
        let store = create_test_store();
        let scope = Scope::User("u1".to_string());
        assert!(store.get(&scope, "hubspot").unwrap().is_none());
    }

    #[test]
    fn test_envelope_not_plaintext_at_rest() {
        let store = create_test_store();
        let scope = Scope::User("u1".to_string());

        store.put(&scope, "hubspot", b"super-secret").unwrap();

        let record = store.get(&scope, "hubspot").unwrap().unwrap();
        assert!(!record.envelope.ciphertext.contains("super-secret"));
    }

    #[test]
    fn test_put_overwrites() {
        let store = create_test_store();
        let scope = Scope::User("u1".to_string());

        store.put(&scope, "hubspot", b"first").unwrap();
        let first = store.get(&scope, "hubspot").unwrap().unwrap();

        store.put(&scope, "hubspot", b"second").unwrap();
        let second = store.get(&scope, "hubspot").unwrap().unwrap();

        assert_eq!(store.decrypt(&second).unwrap(), b"second");
        // created_at survives the upsert
        assert_eq!(first.created_at, second.created_at);
    }

    #[test]
    fn test_tenant_isolation_between_users() {
        let store = create_test_store();
        let user_a = Scope::User("A".to_string());
        let user_b = Scope::User("B".to_string());

        store.put(&user_a, "hubspot", b"token-a").unwrap();

        assert!(store.get(&user_b, "hubspot").unwrap().is_none());
        assert!(store.get(&user_a, "hubspot").unwrap().is_some());
    }

    #[test]
    fn test_tenant_isolation_user_vs_org_with_same_id() {
        let store = create_test_store();
        let user = Scope::User("acme".to_string());
        let org = Scope::Organization("acme".to_string());

        store.put(&user, "stripe", b"user-token").unwrap();

        // Same id, different scope kind
        assert!(store.get(&org, "stripe").unwrap().is_none());

        // Both scopes hold their own record for the same integration
        store.put(&org, "stripe", b"org-token").unwrap();

        let user_record = store.get(&user, "stripe").unwrap().unwrap();
        assert_eq!(store.decrypt(&user_record).unwrap(), b"user-token");

        let org_record = store.get(&org, "stripe").unwrap().unwrap();
        assert_eq!(store.decrypt(&org_record).unwrap(), b"org-token");

        // Overwriting one leaves the other untouched
        store.put(&org, "stripe", b"org-token-2").unwrap();
        let user_record = store.get(&user, "stripe").unwrap().unwrap();
        assert_eq!(store.decrypt(&user_record).unwrap(), b"user-token");

        // Deleting one scope's record does not touch the other's
        store.delete(&user, "stripe").unwrap();
        assert!(store.get(&user, "stripe").unwrap().is_none());
        assert!(store.get(&org, "stripe").unwrap().is_some());
    }

    #[test]
    fn test_delete_idempotent() {
        let store = create_test_store();
        let scope = Scope::Organization("o1".to_string());

        store.put(&scope, "slack", b"token").unwrap();
        store.delete(&scope, "slack").unwrap();
        assert!(store.get(&scope, "slack").unwrap().is_none());

        // Deleting again is not an error
        store.delete(&scope, "slack").unwrap();
    }

    #[test]
    fn test_compare_and_put_succeeds_when_unchanged() {
        let store = create_test_store();
        let scope = Scope::User("u1".to_string());

        store.put(&scope, "hubspot", b"old").unwrap();
        let record = store.get(&scope, "hubspot").unwrap().unwrap();

        let committed = store
            .compare_and_put(&scope, "hubspot", b"new", &record.updated_at)
            .unwrap();
        assert!(committed);

        let after = store.get(&scope, "hubspot").unwrap().unwrap();
        assert_eq!(store.decrypt(&after).unwrap(), b"new");
    }

    #[test]
    fn test_compare_and_put_conflicts_after_concurrent_write() {
        let store = create_test_store();
        let scope = Scope::User("u1".to_string());

        store.put(&scope, "hubspot", b"old").unwrap();
        let stale_read = store.get(&scope, "hubspot").unwrap().unwrap();

        // Another writer commits in between
        std::thread::sleep(std::time::Duration::from_millis(2));
        store.put(&scope, "hubspot", b"interleaved").unwrap();

        let committed = store
            .compare_and_put(&scope, "hubspot", b"stale-response", &stale_read.updated_at)
            .unwrap();
        assert!(!committed, "stale write must not commit");

        let after = store.get(&scope, "hubspot").unwrap().unwrap();
        assert_eq!(store.decrypt(&after).unwrap(), b"interleaved");
    }

    #[test]
    fn test_list_by_scope() {
        let store = create_test_store();
        let user = Scope::User("u1".to_string());
        let org = Scope::Organization("o1".to_string());

        store.put(&user, "hubspot", b"t").unwrap();
        store.put(&user, "gmail", b"t").unwrap();
        store.put(&org, "stripe", b"t").unwrap();

        assert_eq!(store.list(&user).unwrap(), vec!["gmail", "hubspot"]);
        assert_eq!(store.list(&org).unwrap(), vec!["stripe"]);
        assert!(store.list(&Scope::User("u2".to_string())).unwrap().is_empty());
    }
}
