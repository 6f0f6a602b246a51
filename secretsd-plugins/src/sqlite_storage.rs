//! File-backed storage plugin over SQLite.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use secretsd_core::error::{Error, SecretsResult};
use secretsd_core::plugin::{
    EncryptionPlugin, PluginMetadata, ReencryptionTarget, StoragePlugin, StorageType,
};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS OwnedCollections (
    CollectionName TEXT NOT NULL PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS OwnedSecrets (
    CollectionName   TEXT NOT NULL,
    HashedSecretName TEXT NOT NULL,
    Secret           BLOB NOT NULL,
    PRIMARY KEY (CollectionName, HashedSecretName),
    FOREIGN KEY (CollectionName) REFERENCES OwnedCollections (CollectionName)
);";

/// Storage plugin persisting opaque payloads in one SQLite database.
///
/// Payload confidentiality is the daemon's concern; rows here hold
/// ciphertext produced by an encryption plugin.
pub struct SqliteStoragePlugin {
    name: String,
    test_mode: bool,
    conn: Mutex<Connection>,
}

impl SqliteStoragePlugin {
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
        })
    }

    fn lock(&self) -> SecretsResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::PluginOperation("storage plugin mutex poisoned".to_string()))
    }
}

impl PluginMetadata for SqliteStoragePlugin {
    fn name(&self) -> &str {
        &self.name
    }
    fn is_test_plugin(&self) -> bool {
        self.test_mode
    }
}

impl StoragePlugin for SqliteStoragePlugin {
    fn storage_type(&self) -> StorageType {
        StorageType::Database
    }

    fn create_collection(&mut self, collection_name: &str) -> SecretsResult<()> {
        let conn = self.lock()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO OwnedCollections (CollectionName) VALUES (?1)",
                params![collection_name],
            )
            .map_err(map_err)?;
        if inserted == 0 {
            return Err(Error::CollectionAlreadyExists(collection_name.to_string()));
        }
        debug!(collection = collection_name, "created plugin-side collection");
        Ok(())
    }

    fn remove_collection(&mut self, collection_name: &str) -> SecretsResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(map_err)?;
        tx.execute(
            "DELETE FROM OwnedSecrets WHERE CollectionName = ?1",
            params![collection_name],
        )
        .map_err(map_err)?;
        tx.execute(
            "DELETE FROM OwnedCollections WHERE CollectionName = ?1",
            params![collection_name],
        )
        .map_err(map_err)?;
        tx.commit().map_err(map_err)
    }

    fn set_secret(
        &mut self,
        collection_name: &str,
        hashed_secret_name: &str,
        secret: &[u8],
    ) -> SecretsResult<()> {
        let conn = self.lock()?;
        let known: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM OwnedCollections WHERE CollectionName = ?1",
                params![collection_name],
                |r| r.get(0),
            )
            .map_err(map_err)?;
        if known == 0 {
            return Err(Error::InvalidCollection(format!(
                "no such collection: {collection_name}"
            )));
        }
        conn.execute(
            "INSERT OR REPLACE INTO OwnedSecrets (CollectionName, HashedSecretName, Secret)
             VALUES (?1, ?2, ?3)",
            params![collection_name, hashed_secret_name, secret],
        )
        .map_err(map_err)?;
        Ok(())
    }

    fn get_secret(&self, collection_name: &str, hashed_secret_name: &str) -> SecretsResult<Vec<u8>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT Secret FROM OwnedSecrets WHERE CollectionName = ?1 AND HashedSecretName = ?2",
            params![collection_name, hashed_secret_name],
            |r| r.get(0),
        )
        .optional()
        .map_err(map_err)?
        .ok_or_else(|| Error::InvalidSecret("nonexistent secret name given".to_string()))
    }

    fn remove_secret(
        &mut self,
        collection_name: &str,
        hashed_secret_name: &str,
    ) -> SecretsResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM OwnedSecrets WHERE CollectionName = ?1 AND HashedSecretName = ?2",
            params![collection_name, hashed_secret_name],
        )
        .map_err(map_err)?;
        Ok(())
    }

    fn reencrypt_secrets(
        &mut self,
        target: ReencryptionTarget<'_>,
        old_key: &[u8],
        new_key: &[u8],
        encryption: &dyn EncryptionPlugin,
    ) -> SecretsResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(map_err)?;
        let rows: Vec<(String, String, Vec<u8>)> = {
            let (sql, bound): (&str, Vec<String>) = match target {
                ReencryptionTarget::Collection(collection_name) => (
                    "SELECT CollectionName, HashedSecretName, Secret FROM OwnedSecrets
                     WHERE CollectionName = ?1",
                    vec![collection_name.to_string()],
                ),
                ReencryptionTarget::StandaloneSecrets(_) => (
                    "SELECT CollectionName, HashedSecretName, Secret FROM OwnedSecrets",
                    Vec::new(),
                ),
            };
            let mut stmt = tx.prepare(sql).map_err(map_err)?;
            let mapped = stmt
                .query_map(rusqlite::params_from_iter(bound.iter()), |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?))
                })
                .map_err(map_err)?;
            mapped
                .collect::<Result<Vec<_>, _>>()
                .map_err(map_err)?
        };
        for (collection_name, hashed_secret_name, payload) in rows {
            if let ReencryptionTarget::StandaloneSecrets(hashed_names) = target {
                if !hashed_names.contains(&hashed_secret_name) {
                    continue;
                }
            }
            let plain = encryption.decrypt_secret(&payload, old_key)?;
            let reencrypted = encryption.encrypt_secret(&plain, new_key)?;
            tx.execute(
                "UPDATE OwnedSecrets SET Secret = ?3
                 WHERE CollectionName = ?1 AND HashedSecretName = ?2",
                params![collection_name, hashed_secret_name, reencrypted],
            )
            .map_err(map_err)?;
        }
        tx.commit().map_err(map_err)
    }
}

fn map_err(err: rusqlite::Error) -> Error {
    Error::PluginOperation(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aead_encryption::AeadEncryptionPlugin;

    #[test]
    fn test_collection_and_secret_round_trip() {
        let mut plugin = SqliteStoragePlugin::open_in_memory("store").expect("open");
        plugin.create_collection("vault").expect("create");
        assert!(plugin.create_collection("vault").is_err());

        plugin.set_secret("vault", "aaaa", b"ciphertext").expect("set");
        assert_eq!(plugin.get_secret("vault", "aaaa").expect("get"), b"ciphertext");

        plugin.set_secret("vault", "aaaa", b"replaced").expect("replace");
        assert_eq!(plugin.get_secret("vault", "aaaa").expect("get"), b"replaced");

        plugin.remove_secret("vault", "aaaa").expect("remove");
        assert!(plugin.get_secret("vault", "aaaa").is_err());
    }

    #[test]
    fn test_remove_collection_drops_secrets() {
        let mut plugin = SqliteStoragePlugin::open_in_memory("store").expect("open");
        plugin.create_collection("vault").expect("create");
        plugin.set_secret("vault", "aaaa", b"x").expect("set");
        plugin.remove_collection("vault").expect("remove");
        assert!(plugin.get_secret("vault", "aaaa").is_err());
        plugin.create_collection("vault").expect("recreate");
    }

    #[test]
    fn test_set_requires_collection() {
        let mut plugin = SqliteStoragePlugin::open_in_memory("store").expect("open");
        assert!(plugin.set_secret("ghost", "aaaa", b"x").is_err());
    }

    #[test]
    fn test_reencrypt_collection() {
        let mut plugin = SqliteStoragePlugin::open_in_memory("store").expect("open");
        let encryption = AeadEncryptionPlugin::new("crypt", true);
        plugin.create_collection("vault").expect("create");
        let sealed = encryption.encrypt_secret(b"payload", b"old").expect("encrypt");
        plugin.set_secret("vault", "aaaa", &sealed).expect("set");

        plugin
            .reencrypt_secrets(ReencryptionTarget::Collection("vault"), b"old", b"new", &encryption)
            .expect("reencrypt");

        let stored = plugin.get_secret("vault", "aaaa").expect("get");
        assert_eq!(encryption.decrypt_secret(&stored, b"new").expect("decrypt"), b"payload");
        assert!(encryption.decrypt_secret(&stored, b"old").is_err());
    }
}
