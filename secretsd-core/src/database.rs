//! Transactional metadata store.
//!
//! The master database tracks which collections and secrets exist and with
//! which lock attributes; the ciphertext payloads themselves live in plugin
//! storage. Three tables carry the daemon's durable state (`Collections`,
//! `Secrets`, `KeyEntries`) plus a `Quarantine` table marking rows whose
//! compensating delete failed, swept at startup.
//!
//! Every mutating operation runs inside a transaction that commits on
//! success and rolls back on drop; a single mutex serialises all access.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use crate::error::{map_query_err, map_tx_err, Error, SecretsResult};
use crate::types::{AccessControlMode, UnlockSemantic, RESERVED_COLLECTION_NAME};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS Collections (
    CollectionName           TEXT NOT NULL PRIMARY KEY,
    ApplicationId            TEXT NOT NULL,
    UsesDeviceLockKey        INTEGER NOT NULL,
    StoragePluginName        TEXT NOT NULL,
    EncryptionPluginName     TEXT NOT NULL,
    AuthenticationPluginName TEXT NOT NULL,
    UnlockSemantic           INTEGER NOT NULL,
    CustomLockTimeoutMs      INTEGER NOT NULL,
    AccessControlMode        INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS Secrets (
    CollectionName           TEXT NOT NULL,
    SecretName               TEXT NOT NULL,
    ApplicationId            TEXT NOT NULL,
    UsesDeviceLockKey        INTEGER NOT NULL,
    StoragePluginName        TEXT NOT NULL,
    EncryptionPluginName     TEXT NOT NULL,
    AuthenticationPluginName TEXT NOT NULL,
    UnlockSemantic           INTEGER NOT NULL,
    CustomLockTimeoutMs      INTEGER NOT NULL,
    AccessControlMode        INTEGER NOT NULL,
    PRIMARY KEY (CollectionName, SecretName),
    FOREIGN KEY (CollectionName) REFERENCES Collections (CollectionName)
);

CREATE TABLE IF NOT EXISTS KeyEntries (
    CollectionName    TEXT NOT NULL,
    KeyName           TEXT NOT NULL,
    CryptoPluginName  TEXT NOT NULL,
    StoragePluginName TEXT NOT NULL,
    PRIMARY KEY (CollectionName, KeyName)
);

CREATE TABLE IF NOT EXISTS Quarantine (
    RowKind        INTEGER NOT NULL,
    CollectionName TEXT NOT NULL,
    SecretName     TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (RowKind, CollectionName, SecretName)
);";

/// Master row of a collection.
#[derive(Debug, Clone)]
pub struct CollectionRow {
    pub name: String,
    pub application_id: String,
    pub uses_device_lock_key: bool,
    pub storage_plugin: String,
    pub encryption_plugin: String,
    pub authentication_plugin: String,
    pub unlock_semantic: UnlockSemantic,
    pub custom_lock_timeout_ms: u64,
    pub access_control: AccessControlMode,
}

/// Master row of a secret, keyed by (collection, hashed secret name).
#[derive(Debug, Clone)]
pub struct SecretRow {
    pub collection_name: String,
    pub hashed_secret_name: String,
    pub application_id: String,
    pub uses_device_lock_key: bool,
    pub storage_plugin: String,
    pub encryption_plugin: String,
    pub authentication_plugin: String,
    pub unlock_semantic: UnlockSemantic,
    pub custom_lock_timeout_ms: u64,
    pub access_control: AccessControlMode,
}

/// Identifier of a crypto key entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntryIdentifier {
    pub key_name: String,
    pub collection_name: String,
}

/// Which master table a quarantined row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuarantineKind {
    Collection,
    Secret,
}

impl QuarantineKind {
    fn as_code(self) -> i64 {
        match self {
            QuarantineKind::Collection => 0,
            QuarantineKind::Secret => 1,
        }
    }

    fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(QuarantineKind::Collection),
            1 => Some(QuarantineKind::Secret),
            _ => None,
        }
    }
}

/// A master row marked dirty by a failed compensating delete.
#[derive(Debug, Clone)]
pub struct QuarantinedRow {
    pub kind: QuarantineKind,
    pub collection_name: String,
    pub hashed_secret_name: String,
}

/// The metadata store.
pub struct SecretsDatabase {
    conn: Mutex<Connection>,
}

impl SecretsDatabase {
    /// Opens (or creates) the store at `path` and ensures the schema and
    /// the reserved collection row.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialised.
    pub fn open(path: &Path) -> SecretsResult<Self> {
        let conn = Connection::open(path).map_err(|err| map_query_err(&err))?;
        Self::initialise(conn)
    }

    /// Opens an in-memory store. Used by tests; state dies with the value.
    pub fn open_in_memory() -> SecretsResult<Self> {
        let conn = Connection::open_in_memory().map_err(|err| map_query_err(&err))?;
        Self::initialise(conn)
    }

    fn initialise(conn: Connection) -> SecretsResult<Self> {
        conn.execute_batch(SCHEMA).map_err(|err| map_query_err(&err))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.insert_reserved_collection()?;
        Ok(db)
    }

    // The reserved row is notional: it exists only so secret rows in the
    // reserved collection satisfy the foreign-key invariant.
    fn insert_reserved_collection(&self) -> SecretsResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(|err| map_tx_err(&err))?;
        tx.execute(
            "INSERT OR IGNORE INTO Collections (
                CollectionName, ApplicationId, UsesDeviceLockKey,
                StoragePluginName, EncryptionPluginName, AuthenticationPluginName,
                UnlockSemantic, CustomLockTimeoutMs, AccessControlMode
             ) VALUES (?1, ?1, 0, ?1, ?1, ?1, 0, 0, 0)",
            params![RESERVED_COLLECTION_NAME],
        )
        .map_err(|err| map_query_err(&err))?;
        tx.commit().map_err(|err| map_tx_err(&err))
    }

    fn lock(&self) -> SecretsResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::DatabaseTransaction("database mutex poisoned".to_string()))
    }

    // ── Collections ─────────────────────────────────────────────────────

    /// Looks up a collection row by name.
    pub fn collection(&self, name: &str) -> SecretsResult<Option<CollectionRow>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT CollectionName, ApplicationId, UsesDeviceLockKey,
                    StoragePluginName, EncryptionPluginName, AuthenticationPluginName,
                    UnlockSemantic, CustomLockTimeoutMs, AccessControlMode
             FROM Collections WHERE CollectionName = ?1",
            params![name],
            map_collection_row,
        )
        .optional()
        .map_err(|err| map_query_err(&err))?
        .transpose()
    }

    /// Inserts a collection row, verifying absence in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns `CollectionAlreadyExists` when a row with the name is
    /// present, or a database error.
    pub fn insert_collection(&self, row: &CollectionRow) -> SecretsResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(|err| map_tx_err(&err))?;
        let count: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM Collections WHERE CollectionName = ?1",
                params![row.name],
                |r| r.get(0),
            )
            .map_err(|err| map_query_err(&err))?;
        if count > 0 {
            return Err(Error::CollectionAlreadyExists(row.name.clone()));
        }
        tx.execute(
            "INSERT INTO Collections (
                CollectionName, ApplicationId, UsesDeviceLockKey,
                StoragePluginName, EncryptionPluginName, AuthenticationPluginName,
                UnlockSemantic, CustomLockTimeoutMs, AccessControlMode
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                row.name,
                row.application_id,
                row.uses_device_lock_key as i64,
                row.storage_plugin,
                row.encryption_plugin,
                row.authentication_plugin,
                row.unlock_semantic.as_code(),
                row.custom_lock_timeout_ms as i64,
                row.access_control.as_code(),
            ],
        )
        .map_err(|err| map_query_err(&err))?;
        tx.commit().map_err(|err| map_tx_err(&err))
    }

    /// Deletes a collection row and its secret rows.
    pub fn delete_collection(&self, name: &str) -> SecretsResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(|err| map_tx_err(&err))?;
        tx.execute("DELETE FROM Secrets WHERE CollectionName = ?1", params![name])
            .map_err(|err| map_query_err(&err))?;
        tx.execute("DELETE FROM Collections WHERE CollectionName = ?1", params![name])
            .map_err(|err| map_query_err(&err))?;
        tx.commit().map_err(|err| map_tx_err(&err))
    }

    // ── Secrets ─────────────────────────────────────────────────────────

    /// Looks up a secret row by (collection, hashed name).
    pub fn secret(
        &self,
        collection_name: &str,
        hashed_secret_name: &str,
    ) -> SecretsResult<Option<SecretRow>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT CollectionName, SecretName, ApplicationId, UsesDeviceLockKey,
                    StoragePluginName, EncryptionPluginName, AuthenticationPluginName,
                    UnlockSemantic, CustomLockTimeoutMs, AccessControlMode
             FROM Secrets WHERE CollectionName = ?1 AND SecretName = ?2",
            params![collection_name, hashed_secret_name],
            map_secret_row,
        )
        .optional()
        .map_err(|err| map_query_err(&err))?
        .transpose()
    }

    /// Inserts a new secret row.
    pub fn insert_secret(&self, row: &SecretRow) -> SecretsResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(|err| map_tx_err(&err))?;
        tx.execute(
            "INSERT INTO Secrets (
                CollectionName, SecretName, ApplicationId, UsesDeviceLockKey,
                StoragePluginName, EncryptionPluginName, AuthenticationPluginName,
                UnlockSemantic, CustomLockTimeoutMs, AccessControlMode
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                row.collection_name,
                row.hashed_secret_name,
                row.application_id,
                row.uses_device_lock_key as i64,
                row.storage_plugin,
                row.encryption_plugin,
                row.authentication_plugin,
                row.unlock_semantic.as_code(),
                row.custom_lock_timeout_ms as i64,
                row.access_control.as_code(),
            ],
        )
        .map_err(|err| map_query_err(&err))?;
        tx.commit().map_err(|err| map_tx_err(&err))
    }

    /// Updates an existing secret row's attributes.
    pub fn update_secret(&self, row: &SecretRow) -> SecretsResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(|err| map_tx_err(&err))?;
        tx.execute(
            "UPDATE Secrets SET
                ApplicationId = ?3, UsesDeviceLockKey = ?4,
                StoragePluginName = ?5, EncryptionPluginName = ?6,
                AuthenticationPluginName = ?7, UnlockSemantic = ?8,
                CustomLockTimeoutMs = ?9, AccessControlMode = ?10
             WHERE CollectionName = ?1 AND SecretName = ?2",
            params![
                row.collection_name,
                row.hashed_secret_name,
                row.application_id,
                row.uses_device_lock_key as i64,
                row.storage_plugin,
                row.encryption_plugin,
                row.authentication_plugin,
                row.unlock_semantic.as_code(),
                row.custom_lock_timeout_ms as i64,
                row.access_control.as_code(),
            ],
        )
        .map_err(|err| map_query_err(&err))?;
        tx.commit().map_err(|err| map_tx_err(&err))
    }

    /// Deletes a secret row.
    pub fn delete_secret(
        &self,
        collection_name: &str,
        hashed_secret_name: &str,
    ) -> SecretsResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(|err| map_tx_err(&err))?;
        tx.execute(
            "DELETE FROM Secrets WHERE CollectionName = ?1 AND SecretName = ?2",
            params![collection_name, hashed_secret_name],
        )
        .map_err(|err| map_query_err(&err))?;
        tx.commit().map_err(|err| map_tx_err(&err))
    }

    /// Collections whose unlock semantic relocks on a device-lock event.
    pub fn collections_relocking_on_device_lock(&self) -> SecretsResult<Vec<CollectionRow>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT CollectionName, ApplicationId, UsesDeviceLockKey,
                        StoragePluginName, EncryptionPluginName, AuthenticationPluginName,
                        UnlockSemantic, CustomLockTimeoutMs, AccessControlMode
                 FROM Collections WHERE UnlockSemantic IN (?1, ?2)",
            )
            .map_err(|err| map_query_err(&err))?;
        let rows = stmt
            .query_map(
                params![
                    UnlockSemantic::DeviceLockRelock.as_code(),
                    UnlockSemantic::CustomLockDeviceLockRelock.as_code()
                ],
                map_collection_row,
            )
            .map_err(|err| map_query_err(&err))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|err| map_query_err(&err))??);
        }
        Ok(out)
    }

    // ── Key entries (crypto shim) ───────────────────────────────────────

    /// Lists all key entry identifiers.
    pub fn key_entry_identifiers(&self) -> SecretsResult<Vec<KeyEntryIdentifier>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT KeyName, CollectionName FROM KeyEntries")
            .map_err(|err| map_query_err(&err))?;
        let rows = stmt
            .query_map([], |r| {
                Ok(KeyEntryIdentifier {
                    key_name: r.get(0)?,
                    collection_name: r.get(1)?,
                })
            })
            .map_err(|err| map_query_err(&err))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|err| map_query_err(&err))
    }

    /// Looks up the plugin pair recorded for a key entry.
    pub fn key_entry(
        &self,
        identifier: &KeyEntryIdentifier,
    ) -> SecretsResult<Option<(String, String)>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT CryptoPluginName, StoragePluginName FROM KeyEntries
             WHERE KeyName = ?1 AND CollectionName = ?2",
            params![identifier.key_name, identifier.collection_name],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|err| map_query_err(&err))
    }

    /// Inserts a key entry row.
    pub fn add_key_entry(
        &self,
        identifier: &KeyEntryIdentifier,
        crypto_plugin: &str,
        storage_plugin: &str,
    ) -> SecretsResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(|err| map_tx_err(&err))?;
        tx.execute(
            "INSERT INTO KeyEntries (CollectionName, KeyName, CryptoPluginName, StoragePluginName)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                identifier.collection_name,
                identifier.key_name,
                crypto_plugin,
                storage_plugin
            ],
        )
        .map_err(|err| map_query_err(&err))?;
        tx.commit().map_err(|err| map_tx_err(&err))
    }

    /// Removes a key entry row.
    pub fn remove_key_entry(&self, identifier: &KeyEntryIdentifier) -> SecretsResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(|err| map_tx_err(&err))?;
        tx.execute(
            "DELETE FROM KeyEntries WHERE CollectionName = ?1 AND KeyName = ?2",
            params![identifier.collection_name, identifier.key_name],
        )
        .map_err(|err| map_query_err(&err))?;
        tx.commit().map_err(|err| map_tx_err(&err))
    }

    // ── Quarantine ──────────────────────────────────────────────────────

    /// Records a master row whose compensating delete failed. Best effort;
    /// failure to record is logged, never surfaced.
    pub fn quarantine(&self, kind: QuarantineKind, collection_name: &str, hashed_secret_name: &str) {
        let result = (|| -> SecretsResult<()> {
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR IGNORE INTO Quarantine (RowKind, CollectionName, SecretName)
                 VALUES (?1, ?2, ?3)",
                params![kind.as_code(), collection_name, hashed_secret_name],
            )
            .map_err(|err| map_query_err(&err))?;
            Ok(())
        })();
        if let Err(err) = result {
            warn!(collection = collection_name, %err, "failed to quarantine dirty row");
        }
    }

    /// Lists quarantined rows.
    pub fn quarantined_rows(&self) -> SecretsResult<Vec<QuarantinedRow>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT RowKind, CollectionName, SecretName FROM Quarantine")
            .map_err(|err| map_query_err(&err))?;
        let rows = stmt
            .query_map([], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?))
            })
            .map_err(|err| map_query_err(&err))?;
        let mut out = Vec::new();
        for row in rows {
            let (code, collection_name, hashed_secret_name) =
                row.map_err(|err| map_query_err(&err))?;
            if let Some(kind) = QuarantineKind::from_code(code) {
                out.push(QuarantinedRow {
                    kind,
                    collection_name,
                    hashed_secret_name,
                });
            }
        }
        Ok(out)
    }

    /// Drops a quarantine marker once the row has been cleaned up.
    pub fn clear_quarantine(&self, row: &QuarantinedRow) -> SecretsResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM Quarantine WHERE RowKind = ?1 AND CollectionName = ?2 AND SecretName = ?3",
            params![row.kind.as_code(), row.collection_name, row.hashed_secret_name],
        )
        .map_err(|err| map_query_err(&err))?;
        Ok(())
    }

}

fn map_collection_row(
    r: &rusqlite::Row<'_>,
) -> Result<SecretsResult<CollectionRow>, rusqlite::Error> {
    let name: String = r.get(0)?;
    let application_id: String = r.get(1)?;
    let uses_device_lock_key: i64 = r.get(2)?;
    let storage_plugin: String = r.get(3)?;
    let encryption_plugin: String = r.get(4)?;
    let authentication_plugin: String = r.get(5)?;
    let unlock_code: i64 = r.get(6)?;
    let timeout: i64 = r.get(7)?;
    let access_code: i64 = r.get(8)?;
    Ok(UnlockSemantic::from_code(unlock_code).and_then(|unlock_semantic| {
        AccessControlMode::from_code(access_code).map(|access_control| CollectionRow {
            name,
            application_id,
            uses_device_lock_key: uses_device_lock_key > 0,
            storage_plugin,
            encryption_plugin,
            authentication_plugin,
            unlock_semantic,
            custom_lock_timeout_ms: timeout.max(0) as u64,
            access_control,
        })
    }))
}

fn map_secret_row(r: &rusqlite::Row<'_>) -> Result<SecretsResult<SecretRow>, rusqlite::Error> {
    let collection_name: String = r.get(0)?;
    let hashed_secret_name: String = r.get(1)?;
    let application_id: String = r.get(2)?;
    let uses_device_lock_key: i64 = r.get(3)?;
    let storage_plugin: String = r.get(4)?;
    let encryption_plugin: String = r.get(5)?;
    let authentication_plugin: String = r.get(6)?;
    let unlock_code: i64 = r.get(7)?;
    let timeout: i64 = r.get(8)?;
    let access_code: i64 = r.get(9)?;
    Ok(UnlockSemantic::from_code(unlock_code).and_then(|unlock_semantic| {
        AccessControlMode::from_code(access_code).map(|access_control| SecretRow {
            collection_name,
            hashed_secret_name,
            application_id,
            uses_device_lock_key: uses_device_lock_key > 0,
            storage_plugin,
            encryption_plugin,
            authentication_plugin,
            unlock_semantic,
            custom_lock_timeout_ms: timeout.max(0) as u64,
            access_control,
        })
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_collection(name: &str) -> CollectionRow {
        CollectionRow {
            name: name.to_string(),
            application_id: "app-a".to_string(),
            uses_device_lock_key: true,
            storage_plugin: "store".to_string(),
            encryption_plugin: "crypt".to_string(),
            authentication_plugin: "device-lock".to_string(),
            unlock_semantic: UnlockSemantic::DeviceLockKeepUnlocked,
            custom_lock_timeout_ms: 0,
            access_control: AccessControlMode::OwnerOnly,
        }
    }

    #[test]
    fn test_reserved_collection_present_after_open() {
        let db = SecretsDatabase::open_in_memory().expect("open");
        let row = db
            .collection(RESERVED_COLLECTION_NAME)
            .expect("query")
            .expect("reserved row");
        assert_eq!(row.application_id, RESERVED_COLLECTION_NAME);
    }

    #[test]
    fn test_insert_collection_rejects_duplicate() {
        let db = SecretsDatabase::open_in_memory().expect("open");
        db.insert_collection(&sample_collection("vault")).expect("insert");
        match db.insert_collection(&sample_collection("vault")) {
            Err(Error::CollectionAlreadyExists(name)) => assert_eq!(name, "vault"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_collection_round_trip() {
        let db = SecretsDatabase::open_in_memory().expect("open");
        db.insert_collection(&sample_collection("vault")).expect("insert");
        let row = db.collection("vault").expect("query").expect("present");
        assert!(row.uses_device_lock_key);
        assert_eq!(row.storage_plugin, "store");
        db.delete_collection("vault").expect("delete");
        assert!(db.collection("vault").expect("query").is_none());
    }

    #[test]
    fn test_secret_round_trip_and_update() {
        let db = SecretsDatabase::open_in_memory().expect("open");
        db.insert_collection(&sample_collection("vault")).expect("insert");
        let mut secret = SecretRow {
            collection_name: "vault".to_string(),
            hashed_secret_name: "aaaa".to_string(),
            application_id: "app-a".to_string(),
            uses_device_lock_key: false,
            storage_plugin: "store".to_string(),
            encryption_plugin: "crypt".to_string(),
            authentication_plugin: "auth".to_string(),
            unlock_semantic: UnlockSemantic::CustomLockTimeoutRelock,
            custom_lock_timeout_ms: 50,
            access_control: AccessControlMode::OwnerOnly,
        };
        db.insert_secret(&secret).expect("insert secret");
        secret.custom_lock_timeout_ms = 75;
        db.update_secret(&secret).expect("update secret");
        let row = db.secret("vault", "aaaa").expect("query").expect("present");
        assert_eq!(row.custom_lock_timeout_ms, 75);
        assert_eq!(row.unlock_semantic, UnlockSemantic::CustomLockTimeoutRelock);
        db.delete_secret("vault", "aaaa").expect("delete");
        assert!(db.secret("vault", "aaaa").expect("query").is_none());
    }

    #[test]
    fn test_key_entries() {
        let db = SecretsDatabase::open_in_memory().expect("open");
        let ident = KeyEntryIdentifier {
            key_name: "signing".to_string(),
            collection_name: "vault".to_string(),
        };
        assert!(db.key_entry(&ident).expect("query").is_none());
        db.add_key_entry(&ident, "softcrypto", "store").expect("add");
        let (crypto, storage) = db.key_entry(&ident).expect("query").expect("present");
        assert_eq!(crypto, "softcrypto");
        assert_eq!(storage, "store");
        assert_eq!(db.key_entry_identifiers().expect("list"), vec![ident.clone()]);
        db.remove_key_entry(&ident).expect("remove");
        assert!(db.key_entry(&ident).expect("query").is_none());
    }

    #[test]
    fn test_quarantine_round_trip() {
        let db = SecretsDatabase::open_in_memory().expect("open");
        db.quarantine(QuarantineKind::Collection, "vault", "");
        let rows = db.quarantined_rows().expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].collection_name, "vault");
        db.clear_quarantine(&rows[0]).expect("clear");
        assert!(db.quarantined_rows().expect("list").is_empty());
    }
}
