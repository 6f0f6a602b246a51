//! Back-end plugin contracts.
//!
//! The daemon dispatches storage and encryption work to pluggable
//! back-ends behind four capability traits:
//!
//! - [`StoragePlugin`] — plain keyed byte storage, ciphertext supplied by
//!   the caller
//! - [`EncryptionPlugin`] — symmetric encrypt/decrypt under a caller key
//! - [`EncryptedStoragePlugin`] — storage that encrypts internally and
//!   tracks per-collection lock state
//! - [`AuthenticationPlugin`] — produces a per-entity authentication key
//!   through a user-interaction flow
//!
//! Every plugin self-reports a unique name and a test-mode bit; the
//! [`registry`](crate::plugin::PluginRegistry) refuses mismatched or
//! duplicate registrations.

mod registry;

pub use registry::PluginRegistry;

use tokio::sync::mpsc;
use zeroize::Zeroizing;

use crate::error::SecretsResult;
use crate::types::{Pid, RequestId};

/// How an authentication plugin obtains its key from the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationType {
    /// The flow runs inside the calling application's own UI.
    ApplicationSpecific,
    /// The flow is mediated by the system interaction service.
    System,
}

/// Backing medium a storage plugin keeps payloads in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    InMemory,
    File,
    Database,
}

/// Common self-description every plugin provides.
pub trait PluginMetadata {
    /// Unique plugin name.
    fn name(&self) -> &str;

    /// True for plugins only loadable into a test-mode daemon.
    fn is_test_plugin(&self) -> bool;
}

/// Which rows a re-encryption pass covers.
#[derive(Debug, Clone, Copy)]
pub enum ReencryptionTarget<'a> {
    /// Every secret in one collection.
    Collection(&'a str),
    /// The named standalone secrets (hashed names).
    StandaloneSecrets(&'a [String]),
}

/// Plain storage: keeps opaque byte payloads under (collection, hashed
/// secret name). Payload confidentiality is the caller's concern.
pub trait StoragePlugin: PluginMetadata {
    fn storage_type(&self) -> StorageType;

    /// Creates the plugin-side collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection already exists or storage fails.
    fn create_collection(&mut self, collection_name: &str) -> SecretsResult<()>;

    /// Removes the plugin-side collection and everything in it.
    fn remove_collection(&mut self, collection_name: &str) -> SecretsResult<()>;

    /// Stores (or replaces) a payload.
    fn set_secret(
        &mut self,
        collection_name: &str,
        hashed_secret_name: &str,
        secret: &[u8],
    ) -> SecretsResult<()>;

    /// Fetches a payload.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSecret` if no payload is stored under the name.
    fn get_secret(&self, collection_name: &str, hashed_secret_name: &str) -> SecretsResult<Vec<u8>>;

    /// Removes a payload. Removing an absent payload succeeds.
    fn remove_secret(&mut self, collection_name: &str, hashed_secret_name: &str)
        -> SecretsResult<()>;

    /// Re-encrypts stored payloads from `old_key` to `new_key` using
    /// `encryption`, atomically per target.
    fn reencrypt_secrets(
        &mut self,
        target: ReencryptionTarget<'_>,
        old_key: &[u8],
        new_key: &[u8],
        encryption: &dyn EncryptionPlugin,
    ) -> SecretsResult<()>;
}

/// Symmetric encryption of secret payloads under caller-supplied keys.
pub trait EncryptionPlugin: PluginMetadata {
    /// Cipher block size in bytes (1 for stream-oriented ciphers).
    fn block_size(&self) -> usize;

    fn encrypt_secret(&self, plaintext: &[u8], key: &[u8]) -> SecretsResult<Vec<u8>>;

    /// # Errors
    ///
    /// Returns `PluginDecryption` if the ciphertext fails authentication
    /// under `key`.
    fn decrypt_secret(&self, ciphertext: &[u8], key: &[u8]) -> SecretsResult<Vec<u8>>;
}

/// Storage that encrypts internally and tracks per-collection lock state.
///
/// A collection is *locked* until the correct encryption key has been
/// applied with [`set_encryption_key`](EncryptedStoragePlugin::set_encryption_key);
/// applying an empty key relocks it. Applying a wrong key succeeds as a
/// call but leaves the collection locked — the caller distinguishes the
/// two by re-checking [`is_locked`](EncryptedStoragePlugin::is_locked).
pub trait EncryptedStoragePlugin: PluginMetadata {
    fn storage_type(&self) -> StorageType;

    fn block_size(&self) -> usize;

    /// Creates a collection keyed by `key`; the collection starts
    /// unlocked.
    fn create_collection(&mut self, collection_name: &str, key: &[u8]) -> SecretsResult<()>;

    fn remove_collection(&mut self, collection_name: &str) -> SecretsResult<()>;

    fn is_locked(&self, collection_name: &str) -> SecretsResult<bool>;

    /// Applies (non-empty) or clears (empty) the collection encryption
    /// key. See the trait docs for wrong-key behaviour.
    fn set_encryption_key(&mut self, collection_name: &str, key: &[u8]) -> SecretsResult<()>;

    /// Stores a payload in an unlocked collection.
    fn set_secret(
        &mut self,
        collection_name: &str,
        hashed_secret_name: &str,
        secret: &[u8],
    ) -> SecretsResult<()>;

    /// Stores a payload under an explicit key without changing the
    /// collection's lock state (standalone-secret path).
    fn set_secret_with_key(
        &mut self,
        collection_name: &str,
        hashed_secret_name: &str,
        secret: &[u8],
        key: &[u8],
    ) -> SecretsResult<()>;

    /// Fetches a payload from an unlocked collection.
    fn get_secret(&self, collection_name: &str, hashed_secret_name: &str) -> SecretsResult<Vec<u8>>;

    /// Fetches a payload under an explicit key without changing the
    /// collection's lock state (standalone-secret path).
    fn access_secret(
        &mut self,
        collection_name: &str,
        hashed_secret_name: &str,
        key: &[u8],
    ) -> SecretsResult<Vec<u8>>;

    fn remove_secret(&mut self, collection_name: &str, hashed_secret_name: &str)
        -> SecretsResult<()>;
}

/// A user-interaction flow started by the processor.
#[derive(Debug, Clone)]
pub struct AuthenticationPrompt {
    pub caller_pid: Pid,
    pub request_id: RequestId,
    pub caller_application_id: String,
    /// Collection being unlocked; empty for standalone secrets.
    pub collection_name: String,
    /// Secret being addressed; empty for collection creation.
    pub secret_name: String,
    /// In-process UI service address; empty for system flows.
    pub ui_service_address: String,
}

/// Completion of an authentication flow, delivered on the auth channel.
pub struct AuthenticationCompleted {
    pub request_id: RequestId,
    pub result: SecretsResult<()>,
    pub authentication_key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for AuthenticationCompleted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticationCompleted")
            .field("request_id", &self.request_id)
            .field("result", &self.result)
            .field("authentication_key", &"[REDACTED]")
            .finish()
    }
}

/// Handle an authentication plugin uses to deliver completions back to the
/// daemon loop.
#[derive(Debug, Clone)]
pub struct AuthenticationSink {
    tx: mpsc::UnboundedSender<AuthenticationCompleted>,
}

impl AuthenticationSink {
    /// Creates a sink and the receiving end the daemon loop drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AuthenticationCompleted>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Delivers a completion. Best effort once the daemon is gone.
    pub fn complete(&self, completion: AuthenticationCompleted) {
        let _ = self.tx.send(completion);
    }
}

/// Produces per-entity authentication keys via user interaction.
pub trait AuthenticationPlugin: PluginMetadata {
    fn authentication_type(&self) -> AuthenticationType;

    /// Starts the interaction flow for `prompt`. The key (or failure)
    /// arrives later as an [`AuthenticationCompleted`] carrying the same
    /// request id.
    ///
    /// # Errors
    ///
    /// Returns an error if the flow cannot be started; no completion will
    /// be delivered in that case.
    fn begin_authentication(&mut self, prompt: AuthenticationPrompt) -> SecretsResult<()>;
}

// ── Info snapshots ──────────────────────────────────────────────────────

/// Immutable description of a storage plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePluginInfo {
    pub name: String,
    pub storage_type: StorageType,
}

/// Immutable description of an encryption plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionPluginInfo {
    pub name: String,
    pub block_size: usize,
}

/// Immutable description of an encrypted-storage plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedStoragePluginInfo {
    pub name: String,
    pub storage_type: StorageType,
    pub block_size: usize,
}

/// Immutable description of an authentication plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationPluginInfo {
    pub name: String,
    pub authentication_type: AuthenticationType,
}

/// The four info vectors returned by `GetPluginInfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginInfoReport {
    pub storage_plugins: Vec<StoragePluginInfo>,
    pub encryption_plugins: Vec<EncryptionPluginInfo>,
    pub encrypted_storage_plugins: Vec<EncryptedStoragePluginInfo>,
    pub authentication_plugins: Vec<AuthenticationPluginInfo>,
}
