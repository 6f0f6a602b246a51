//! Encrypted-storage plugin over SQLite.
//!
//! Each collection row carries a key-check value: a fixed canary sealed
//! under the collection key at create time. `set_encryption_key` verifies
//! a candidate key by opening the canary; a wrong key is accepted as a
//! call but leaves the collection locked, which is how the daemon detects
//! it. Payloads are sealed per secret with the collection key.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::debug;
use zeroize::Zeroizing;

use secretsd_core::error::{Error, SecretsResult};
use secretsd_core::plugin::{EncryptedStoragePlugin, PluginMetadata, StorageType};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS EsCollections (
    CollectionName TEXT NOT NULL PRIMARY KEY,
    KeyCheck       BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS EsSecrets (
    CollectionName   TEXT NOT NULL,
    HashedSecretName TEXT NOT NULL,
    Ciphertext       BLOB NOT NULL,
    PRIMARY KEY (CollectionName, HashedSecretName),
    FOREIGN KEY (CollectionName) REFERENCES EsCollections (CollectionName)
);";

const NONCE_LEN: usize = 24;
const KEY_CONDITIONING_LABEL: &[u8] = b"secretsd:encrypted-sqlite-key";
const KEY_CHECK_CANARY: &[u8] = b"secretsd:encrypted-sqlite-canary";

/// Encrypted-storage plugin with per-collection lock state.
pub struct EncryptedSqlitePlugin {
    name: String,
    test_mode: bool,
    conn: Mutex<Connection>,
    /// Applied collection keys; presence means unlocked.
    unlocked: HashMap<String, Zeroizing<Vec<u8>>>,
}

impl EncryptedSqlitePlugin {
    /// Opens (or creates) the plugin database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialised.
    pub fn open(name: &str, path: &Path, test_mode: bool) -> SecretsResult<Self> {
        let conn = Connection::open(path).map_err(map_err)?;
        Self::initialise(name, test_mode, conn)
    }

    /// In-memory variant for tests.
    pub fn open_in_memory(name: &str) -> SecretsResult<Self> {
        let conn = Connection::open_in_memory().map_err(map_err)?;
        Self::initialise(name, true, conn)
    }

    fn initialise(name: &str, test_mode: bool, conn: Connection) -> SecretsResult<Self> {
        conn.execute_batch(SCHEMA).map_err(map_err)?;
        Ok(Self {
            name: name.to_string(),
            test_mode,
            conn: Mutex::new(conn),
            unlocked: HashMap::new(),
        })
    }

    fn lock(&self) -> SecretsResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::PluginOperation("encrypted storage mutex poisoned".to_string()))
    }

    fn conditioned_key(key: &[u8]) -> Key {
        let mut hasher = Sha256::new();
        hasher.update(KEY_CONDITIONING_LABEL);
        hasher.update(key);
        Key::from(<[u8; 32]>::from(hasher.finalize()))
    }

    fn seal(key: &[u8], aad: &[u8], plaintext: &[u8]) -> SecretsResult<Vec<u8>> {
        let cipher = XChaCha20Poly1305::new(&Self::conditioned_key(key));
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|err| Error::PluginOperation(format!("encryption failed: {err}")))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open_sealed(key: &[u8], aad: &[u8], sealed: &[u8]) -> SecretsResult<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(Error::PluginDecryption("sealed payload too short".to_string()));
        }
        let (nonce, payload) = sealed.split_at(NONCE_LEN);
        let cipher = XChaCha20Poly1305::new(&Self::conditioned_key(key));
        cipher
            .decrypt(XNonce::from_slice(nonce), Payload { msg: payload, aad })
            .map_err(|_| Error::PluginDecryption("payload failed authentication".to_string()))
    }

    fn key_check_value(collection_name: &str, key: &[u8]) -> SecretsResult<Vec<u8>> {
        Self::seal(key, collection_name.as_bytes(), KEY_CHECK_CANARY)
    }

    fn key_matches(collection_name: &str, key: &[u8], key_check: &[u8]) -> bool {
        Self::open_sealed(key, collection_name.as_bytes(), key_check)
            .map_or(false, |canary| canary == KEY_CHECK_CANARY)
    }

    fn stored_key_check(&self, collection_name: &str) -> SecretsResult<Option<Vec<u8>>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT KeyCheck FROM EsCollections WHERE CollectionName = ?1",
            params![collection_name],
            |r| r.get(0),
        )
        .optional()
        .map_err(map_err)
    }

    /// Verifies `key` against the stored key check, creating the
    /// collection row keyed by `key` if it does not exist yet (how
    /// standalone secrets first arrive).
    fn verify_or_establish(&self, collection_name: &str, key: &[u8]) -> SecretsResult<()> {
        match self.stored_key_check(collection_name)? {
            Some(key_check) => {
                if Self::key_matches(collection_name, key, &key_check) {
                    Ok(())
                } else {
                    Err(Error::IncorrectAuthenticationKey(format!(
                        "the authentication key entered for collection {collection_name} was incorrect"
                    )))
                }
            }
            None => {
                let key_check = Self::key_check_value(collection_name, key)?;
                let conn = self.lock()?;
                conn.execute(
                    "INSERT INTO EsCollections (CollectionName, KeyCheck) VALUES (?1, ?2)",
                    params![collection_name, key_check],
                )
                .map_err(map_err)?;
                Ok(())
            }
        }
    }
}

impl PluginMetadata for EncryptedSqlitePlugin {
    fn name(&self) -> &str {
        &self.name
    }
    fn is_test_plugin(&self) -> bool {
        self.test_mode
    }
}

impl EncryptedStoragePlugin for EncryptedSqlitePlugin {
    fn storage_type(&self) -> StorageType {
        StorageType::Database
    }

    fn block_size(&self) -> usize {
        1
    }

    fn create_collection(&mut self, collection_name: &str, key: &[u8]) -> SecretsResult<()> {
        let key_check = Self::key_check_value(collection_name, key)?;
        {
            let conn = self.lock()?;
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO EsCollections (CollectionName, KeyCheck) VALUES (?1, ?2)",
                    params![collection_name, key_check],
                )
                .map_err(map_err)?;
            if inserted == 0 {
                return Err(Error::CollectionAlreadyExists(collection_name.to_string()));
            }
        }
        self.unlocked
            .insert(collection_name.to_string(), Zeroizing::new(key.to_vec()));
        Ok(())
    }

    fn remove_collection(&mut self, collection_name: &str) -> SecretsResult<()> {
        {
            let mut conn = self.lock()?;
            let tx = conn.transaction().map_err(map_err)?;
            tx.execute(
                "DELETE FROM EsSecrets WHERE CollectionName = ?1",
                params![collection_name],
            )
            .map_err(map_err)?;
            tx.execute(
                "DELETE FROM EsCollections WHERE CollectionName = ?1",
                params![collection_name],
            )
            .map_err(map_err)?;
            tx.commit().map_err(map_err)?;
        }
        self.unlocked.remove(collection_name);
        Ok(())
    }

    fn is_locked(&self, collection_name: &str) -> SecretsResult<bool> {
        Ok(!self.unlocked.contains_key(collection_name))
    }

    fn set_encryption_key(&mut self, collection_name: &str, key: &[u8]) -> SecretsResult<()> {
        if key.is_empty() {
            self.unlocked.remove(collection_name);
            return Ok(());
        }
        let Some(key_check) = self.stored_key_check(collection_name)? else {
            return Err(Error::InvalidCollection(format!(
                "no such collection: {collection_name}"
            )));
        };
        if Self::key_matches(collection_name, key, &key_check) {
            self.unlocked
                .insert(collection_name.to_string(), Zeroizing::new(key.to_vec()));
        } else {
            // Wrong key: the call succeeds, the collection stays locked.
            debug!(collection = collection_name, "rejected collection key; staying locked");
            self.unlocked.remove(collection_name);
        }
        Ok(())
    }

    fn set_secret(
        &mut self,
        collection_name: &str,
        hashed_secret_name: &str,
        secret: &[u8],
    ) -> SecretsResult<()> {
        let Some(key) = self.unlocked.get(collection_name) else {
            return Err(Error::CollectionIsLocked(format!(
                "collection {collection_name} is locked"
            )));
        };
        let aad = secret_aad(collection_name, hashed_secret_name);
        let sealed = Self::seal(key, &aad, secret)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO EsSecrets (CollectionName, HashedSecretName, Ciphertext)
             VALUES (?1, ?2, ?3)",
            params![collection_name, hashed_secret_name, sealed],
        )
        .map_err(map_err)?;
        Ok(())
    }

    fn set_secret_with_key(
        &mut self,
        collection_name: &str,
        hashed_secret_name: &str,
        secret: &[u8],
        key: &[u8],
    ) -> SecretsResult<()> {
        self.verify_or_establish(collection_name, key)?;
        let aad = secret_aad(collection_name, hashed_secret_name);
        let sealed = Self::seal(key, &aad, secret)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO EsSecrets (CollectionName, HashedSecretName, Ciphertext)
             VALUES (?1, ?2, ?3)",
            params![collection_name, hashed_secret_name, sealed],
        )
        .map_err(map_err)?;
        Ok(())
    }

    fn get_secret(&self, collection_name: &str, hashed_secret_name: &str) -> SecretsResult<Vec<u8>> {
        let Some(key) = self.unlocked.get(collection_name) else {
            return Err(Error::CollectionIsLocked(format!(
                "collection {collection_name} is locked"
            )));
        };
        let sealed: Option<Vec<u8>> = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT Ciphertext FROM EsSecrets
                 WHERE CollectionName = ?1 AND HashedSecretName = ?2",
                params![collection_name, hashed_secret_name],
                |r| r.get(0),
            )
            .optional()
            .map_err(map_err)?
        };
        let sealed =
            sealed.ok_or_else(|| Error::InvalidSecret("nonexistent secret name given".to_string()))?;
        Self::open_sealed(key, &secret_aad(collection_name, hashed_secret_name), &sealed)
    }

    fn access_secret(
        &mut self,
        collection_name: &str,
        hashed_secret_name: &str,
        key: &[u8],
    ) -> SecretsResult<Vec<u8>> {
        let Some(key_check) = self.stored_key_check(collection_name)? else {
            return Err(Error::InvalidCollection(format!(
                "no such collection: {collection_name}"
            )));
        };
        if !Self::key_matches(collection_name, key, &key_check) {
            return Err(Error::IncorrectAuthenticationKey(format!(
                "the authentication key entered for collection {collection_name} was incorrect"
            )));
        }
        let sealed: Option<Vec<u8>> = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT Ciphertext FROM EsSecrets
                 WHERE CollectionName = ?1 AND HashedSecretName = ?2",
                params![collection_name, hashed_secret_name],
                |r| r.get(0),
            )
            .optional()
            .map_err(map_err)?
        };
        let sealed =
            sealed.ok_or_else(|| Error::InvalidSecret("nonexistent secret name given".to_string()))?;
        Self::open_sealed(key, &secret_aad(collection_name, hashed_secret_name), &sealed)
    }

    fn remove_secret(
        &mut self,
        collection_name: &str,
        hashed_secret_name: &str,
    ) -> SecretsResult<()> {
        if !self.unlocked.contains_key(collection_name) {
            return Err(Error::CollectionIsLocked(format!(
                "collection {collection_name} is locked"
            )));
        }
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM EsSecrets WHERE CollectionName = ?1 AND HashedSecretName = ?2",
            params![collection_name, hashed_secret_name],
        )
        .map_err(map_err)?;
        Ok(())
    }
}

fn secret_aad(collection_name: &str, hashed_secret_name: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(collection_name.len() + 1 + hashed_secret_name.len());
    aad.extend_from_slice(collection_name.as_bytes());
    aad.push(0);
    aad.extend_from_slice(hashed_secret_name.as_bytes());
    aad
}

fn map_err(err: rusqlite::Error) -> Error {
    Error::PluginOperation(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_unlocks_and_round_trips() {
        let mut plugin = EncryptedSqlitePlugin::open_in_memory("enc").expect("open");
        plugin.create_collection("vault", b"key").expect("create");
        assert!(!plugin.is_locked("vault").expect("lock state"));

        plugin.set_secret("vault", "hh", b"payload").expect("set");
        assert_eq!(plugin.get_secret("vault", "hh").expect("get"), b"payload");
    }

    #[test]
    fn test_wrong_key_leaves_collection_locked() {
        let mut plugin = EncryptedSqlitePlugin::open_in_memory("enc").expect("open");
        plugin.create_collection("vault", b"right").expect("create");
        plugin.set_encryption_key("vault", &[]).expect("relock");
        assert!(plugin.is_locked("vault").expect("lock state"));

        plugin.set_encryption_key("vault", b"wrong").expect("apply");
        assert!(plugin.is_locked("vault").expect("lock state"));

        plugin.set_encryption_key("vault", b"right").expect("apply");
        assert!(!plugin.is_locked("vault").expect("lock state"));
        assert!(plugin.get_secret("vault", "absent").is_err());
    }

    #[test]
    fn test_keyed_access_does_not_change_lock_state() {
        let mut plugin = EncryptedSqlitePlugin::open_in_memory("enc").expect("open");
        plugin
            .set_secret_with_key("standalone", "hh", b"material", b"dlk")
            .expect("set");
        assert!(plugin.is_locked("standalone").expect("lock state"));
        assert_eq!(
            plugin.access_secret("standalone", "hh", b"dlk").expect("access"),
            b"material"
        );
        assert!(plugin.is_locked("standalone").expect("lock state"));
        assert!(plugin.access_secret("standalone", "hh", b"wrong").is_err());
    }

    #[test]
    fn test_lock_state_survives_via_key_check_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("enc.db");
        {
            let mut plugin = EncryptedSqlitePlugin::open("enc", &path, true).expect("open");
            plugin.create_collection("vault", b"key").expect("create");
            plugin.set_secret("vault", "hh", b"payload").expect("set");
        }
        // A fresh process sees the collection locked until the key is
        // re-applied.
        let mut plugin = EncryptedSqlitePlugin::open("enc", &path, true).expect("reopen");
        assert!(plugin.is_locked("vault").expect("lock state"));
        plugin.set_encryption_key("vault", b"key").expect("apply");
        assert!(!plugin.is_locked("vault").expect("lock state"));
        assert_eq!(plugin.get_secret("vault", "hh").expect("get"), b"payload");
    }
}
