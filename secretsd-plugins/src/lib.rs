//! Reference and test plugins for the secrets daemon.
//!
//! - [`memory`] — in-memory implementations of all four plugin contracts,
//!   for unit and integration testing of the daemon core
//! - [`sqlite_storage`] — file-backed storage plugin over SQLite
//! - [`aead_encryption`] — XChaCha20-Poly1305 encryption plugin
//! - [`encrypted_sqlite`] — encrypted-storage plugin with per-collection
//!   lock state over SQLite
//! - [`passphrase_auth`] — authentication plugins that derive keys from a
//!   configured passphrase

pub mod aead_encryption;
pub mod encrypted_sqlite;
pub mod memory;
pub mod passphrase_auth;
pub mod sqlite_storage;

pub use aead_encryption::AeadEncryptionPlugin;
pub use encrypted_sqlite::EncryptedSqlitePlugin;
pub use memory::{
    MemoryEncryptedStoragePlugin, MemoryEncryptionPlugin, MemoryStoragePlugin,
    TestAuthenticationPlugin,
};
pub use passphrase_auth::PassphraseAuthPlugin;
pub use sqlite_storage::SqliteStoragePlugin;
