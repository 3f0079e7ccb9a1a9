//! Secrets table with transparent envelope encryption. Plaintext leaves
//! this module only via `get_secret` and `materialize_secrets`.

use std::collections::HashMap;
use std::str::FromStr;

use rusqlite::{OptionalExtension, Row, params};

use moor_shared::models::now_iso;
use moor_shared::models::secret::{SecretKind, SecretMetadata};

use super::{Store, StoreError};

fn row_to_metadata(row: &Row<'_>) -> rusqlite::Result<SecretMetadata> {
    let kind: String = row.get("kind")?;
    Ok(SecretMetadata {
        id: row.get("id")?,
        name: row.get("name")?,
        env_var_name: row.get("env_var_name")?,
        kind: SecretKind::from_str(&kind).unwrap_or(SecretKind::EnvVar),
        enabled: row.get("enabled")?,
        key_version: row.get("key_version")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

impl Store {
    /// Insert or replace a secret, re-encrypting under the current key.
    #[allow(clippy::too_many_arguments)]
    pub fn put_secret(
        &self,
        id: &str,
        name: &str,
        env_var_name: &str,
        kind: SecretKind,
        value: &[u8],
        enabled: bool,
    ) -> Result<SecretMetadata, StoreError> {
        let sealed = self.cipher().seal(value)?;
        let now = now_iso();

        let conn = self.conn();
        let created_at: Option<String> = conn
            .query_row(
                "SELECT created_at FROM secrets WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let created_at = created_at.unwrap_or_else(|| now.clone());

        conn.execute(
            "INSERT OR REPLACE INTO secrets
                 (id, name, env_var_name, kind, ciphertext, nonce, key_version, enabled,
                  created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                id,
                name,
                env_var_name,
                kind.as_str(),
                sealed.ciphertext,
                sealed.nonce,
                sealed.key_version,
                enabled,
                created_at,
                now,
            ],
        )?;

        Ok(SecretMetadata {
            id: id.to_string(),
            name: name.to_string(),
            env_var_name: env_var_name.to_string(),
            kind,
            enabled,
            key_version: sealed.key_version,
            created_at,
            updated_at: now,
        })
    }

    /// Decrypt one secret. Fails with not-found or a crypto error; never
    /// yields unauthenticated plaintext.
    pub fn get_secret(&self, id: &str) -> Result<(SecretMetadata, Vec<u8>), StoreError> {
        let (metadata, ciphertext, nonce) = {
            let conn = self.conn();
            conn.query_row(
                "SELECT id, name, env_var_name, kind, ciphertext, nonce, key_version, enabled,
                        created_at, updated_at
                 FROM secrets WHERE id = ?1",
                params![id],
                |row| {
                    let metadata = row_to_metadata(row)?;
                    let ciphertext: Vec<u8> = row.get("ciphertext")?;
                    let nonce: Vec<u8> = row.get("nonce")?;
                    Ok((metadata, ciphertext, nonce))
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("secret {id}")))?
        };

        let plaintext = self
            .cipher()
            .open(&ciphertext, &nonce, metadata.key_version)?;
        Ok((metadata, plaintext))
    }

    /// Metadata only; plaintext never appears in listings.
    pub fn list_secrets(&self) -> Result<Vec<SecretMetadata>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, env_var_name, kind, ciphertext, nonce, key_version, enabled,
                    created_at, updated_at
             FROM secrets ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_metadata)?;

        let mut secrets = Vec::new();
        for row in rows {
            secrets.push(row?);
        }
        Ok(secrets)
    }

    /// Idempotent delete.
    pub fn delete_secret(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute("DELETE FROM secrets WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Build the env block injected into a sandbox: enabled secrets only,
    /// optionally restricted by kind.
    pub fn materialize_secrets(
        &self,
        kinds: Option<&[SecretKind]>,
    ) -> Result<HashMap<String, String>, StoreError> {
        let rows = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT env_var_name, kind, ciphertext, nonce, key_version
                 FROM secrets WHERE enabled = 1",
            )?;
            let rows = stmt.query_map([], |row| {
                let env_var: String = row.get(0)?;
                let kind: String = row.get(1)?;
                let ciphertext: Vec<u8> = row.get(2)?;
                let nonce: Vec<u8> = row.get(3)?;
                let key_version: u32 = row.get(4)?;
                Ok((env_var, kind, ciphertext, nonce, key_version))
            })?;

            let mut collected = Vec::new();
            for row in rows {
                collected.push(row?);
            }
            collected
        };

        let mut env = HashMap::new();
        for (env_var, kind, ciphertext, nonce, key_version) in rows {
            if let Some(kinds) = kinds {
                let Ok(kind) = SecretKind::from_str(&kind) else {
                    continue;
                };
                if !kinds.contains(&kind) {
                    continue;
                }
            }
            let plaintext = self.cipher().open(&ciphertext, &nonce, key_version)?;
            env.insert(env_var, String::from_utf8_lossy(&plaintext).into_owned());
        }
        Ok(env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;

    #[test]
    fn put_get_round_trip() {
        let store = test_store();
        store
            .put_secret(
                "anthropic_api_key",
                "Anthropic",
                "ANTHROPIC_API_KEY",
                SecretKind::AiProvider,
                b"sk-ant-123",
                true,
            )
            .expect("put");

        let (metadata, plaintext) = store.get_secret("anthropic_api_key").expect("get");
        assert_eq!(plaintext, b"sk-ant-123");
        assert_eq!(metadata.kind, SecretKind::AiProvider);
        assert_eq!(metadata.key_version, 1);
    }

    #[test]
    fn put_replaces_on_id_conflict_and_keeps_created_at() {
        let store = test_store();
        let first = store
            .put_secret("k", "one", "K", SecretKind::EnvVar, b"v1", true)
            .expect("put");
        let second = store
            .put_secret("k", "two", "K", SecretKind::EnvVar, b"v2", false)
            .expect("replace");

        assert_eq!(first.created_at, second.created_at);
        let (metadata, plaintext) = store.get_secret("k").expect("get");
        assert_eq!(plaintext, b"v2");
        assert_eq!(metadata.name, "two");
        assert!(!metadata.enabled);
        assert_eq!(store.list_secrets().expect("list").len(), 1);
    }

    #[test]
    fn get_missing_is_not_found_and_delete_is_idempotent() {
        let store = test_store();
        assert!(matches!(
            store.get_secret("ghost"),
            Err(StoreError::NotFound(_))
        ));
        store.delete_secret("ghost").expect("idempotent delete");
    }

    #[test]
    fn tampered_row_fails_decryption() {
        let store = test_store();
        store
            .put_secret("k", "k", "K", SecretKind::EnvVar, b"value", true)
            .expect("put");
        store
            .conn()
            .execute("UPDATE secrets SET nonce = x'000000000000000000000000'", [])
            .expect("tamper");

        assert!(matches!(
            store.get_secret("k"),
            Err(StoreError::Crypto(_))
        ));
    }

    #[test]
    fn materialize_filters_disabled_and_by_kind() {
        let store = test_store();
        store
            .put_secret("a", "a", "API_KEY", SecretKind::AiProvider, b"aaa", true)
            .expect("put");
        store
            .put_secret("b", "b", "EXTRA", SecretKind::EnvVar, b"bbb", true)
            .expect("put");
        store
            .put_secret("c", "c", "DISABLED", SecretKind::EnvVar, b"ccc", false)
            .expect("put");
        store
            .put_secret("d", "d", "GH", SecretKind::SandboxProvider, b"ddd", true)
            .expect("put");

        let env = store
            .materialize_secrets(Some(&[SecretKind::AiProvider, SecretKind::EnvVar]))
            .expect("materialize");
        assert_eq!(env.len(), 2);
        assert_eq!(env.get("API_KEY").map(String::as_str), Some("aaa"));
        assert_eq!(env.get("EXTRA").map(String::as_str), Some("bbb"));
        assert!(!env.contains_key("DISABLED"));
        assert!(!env.contains_key("GH"));

        let all = store.materialize_secrets(None).expect("materialize all");
        assert_eq!(all.len(), 3);
    }
}
