//! In-memory implementations of the plugin contracts for testing.
//!
//! These implementations are NOT secure for production use. They exist to
//! exercise the daemon core's interaction with plugins without real
//! storage or cryptography, and all report the test-mode bit. Each plugin
//! is cheaply cloneable around shared state so a test can keep a handle
//! for inspection after registering a clone with the daemon.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use secretsd_core::error::{Error, SecretsResult};
use secretsd_core::plugin::{
    AuthenticationPlugin, AuthenticationPrompt, AuthenticationType, EncryptedStoragePlugin,
    EncryptionPlugin, PluginMetadata, ReencryptionTarget, StoragePlugin, StorageType,
};

// ── Storage ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryStorageState {
    collections: HashMap<String, HashMap<String, Vec<u8>>>,
    fail_collection_creates: bool,
}

/// In-memory storage plugin backed by nested `HashMap`s.
#[derive(Clone)]
pub struct MemoryStoragePlugin {
    name: String,
    state: Arc<Mutex<MemoryStorageState>>,
}

impl MemoryStoragePlugin {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(MemoryStorageState::default())),
        }
    }

    /// Makes subsequent `create_collection` calls fail, for exercising the
    /// daemon's compensation path.
    pub fn fail_collection_creates(&self, fail: bool) {
        self.state.lock().unwrap().fail_collection_creates = fail;
    }

    /// True if the plugin-side collection exists.
    pub fn contains_collection(&self, collection_name: &str) -> bool {
        self.state.lock().unwrap().collections.contains_key(collection_name)
    }

    /// Number of payloads stored in a collection.
    pub fn secret_count(&self, collection_name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .collections
            .get(collection_name)
            .map_or(0, HashMap::len)
    }
}

impl PluginMetadata for MemoryStoragePlugin {
    fn name(&self) -> &str {
        &self.name
    }
    fn is_test_plugin(&self) -> bool {
        true
    }
}

impl StoragePlugin for MemoryStoragePlugin {
    fn storage_type(&self) -> StorageType {
        StorageType::InMemory
    }

    fn create_collection(&mut self, collection_name: &str) -> SecretsResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_collection_creates {
            return Err(Error::PluginOperation("collection creation disabled".to_string()));
        }
        if state.collections.contains_key(collection_name) {
            return Err(Error::CollectionAlreadyExists(collection_name.to_string()));
        }
        state.collections.insert(collection_name.to_string(), HashMap::new());
        Ok(())
    }

    fn remove_collection(&mut self, collection_name: &str) -> SecretsResult<()> {
        self.state.lock().unwrap().collections.remove(collection_name);
        Ok(())
    }

    fn set_secret(
        &mut self,
        collection_name: &str,
        hashed_secret_name: &str,
        secret: &[u8],
    ) -> SecretsResult<()> {
        let mut state = self.state.lock().unwrap();
        let collection = state
            .collections
            .entry(collection_name.to_string())
            .or_default();
        collection.insert(hashed_secret_name.to_string(), secret.to_vec());
        Ok(())
    }

    fn get_secret(&self, collection_name: &str, hashed_secret_name: &str) -> SecretsResult<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .collections
            .get(collection_name)
            .and_then(|collection| collection.get(hashed_secret_name))
            .cloned()
            .ok_or_else(|| Error::InvalidSecret("nonexistent secret name given".to_string()))
    }

    fn remove_secret(
        &mut self,
        collection_name: &str,
        hashed_secret_name: &str,
    ) -> SecretsResult<()> {
        if let Some(collection) = self.state.lock().unwrap().collections.get_mut(collection_name) {
            collection.remove(hashed_secret_name);
        }
        Ok(())
    }

    fn reencrypt_secrets(
        &mut self,
        target: ReencryptionTarget<'_>,
        old_key: &[u8],
        new_key: &[u8],
        encryption: &dyn EncryptionPlugin,
    ) -> SecretsResult<()> {
        let mut state = self.state.lock().unwrap();
        match target {
            ReencryptionTarget::Collection(collection_name) => {
                let Some(collection) = state.collections.get_mut(collection_name) else {
                    return Ok(());
                };
                for payload in collection.values_mut() {
                    let plain = encryption.decrypt_secret(payload, old_key)?;
                    *payload = encryption.encrypt_secret(&plain, new_key)?;
                }
            }
            ReencryptionTarget::StandaloneSecrets(hashed_names) => {
                for collection in state.collections.values_mut() {
                    for hashed in hashed_names {
                        if let Some(payload) = collection.get_mut(hashed) {
                            let plain = encryption.decrypt_secret(payload, old_key)?;
                            *payload = encryption.encrypt_secret(&plain, new_key)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

// ── Encryption ──────────────────────────────────────────────────────────

/// In-memory encryption plugin using a hash-derived XOR keystream.
///
/// Deterministic and invertible, with no real security. Wrong keys do not
/// fail decryption, they just produce garbage — the daemon's plain-storage
/// path tolerates that.
#[derive(Clone)]
pub struct MemoryEncryptionPlugin {
    name: String,
}

impl MemoryEncryptionPlugin {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    fn keystream(key: &[u8], nonce: &[u8], len: usize) -> Vec<u8> {
        let mut keystream = Vec::with_capacity(len + 8);
        let mut counter = 0u64;
        while keystream.len() < len {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            nonce.hash(&mut hasher);
            counter.hash(&mut hasher);
            keystream.extend_from_slice(&hasher.finish().to_le_bytes());
            counter += 1;
        }
        keystream.truncate(len);
        keystream
    }
}

impl PluginMetadata for MemoryEncryptionPlugin {
    fn name(&self) -> &str {
        &self.name
    }
    fn is_test_plugin(&self) -> bool {
        true
    }
}

impl EncryptionPlugin for MemoryEncryptionPlugin {
    fn block_size(&self) -> usize {
        1
    }

    fn encrypt_secret(&self, plaintext: &[u8], key: &[u8]) -> SecretsResult<Vec<u8>> {
        let mut nonce = [0u8; 8];
        OsRng.fill_bytes(&mut nonce);
        let keystream = Self::keystream(key, &nonce, plaintext.len());
        let mut out = Vec::with_capacity(8 + plaintext.len());
        out.extend_from_slice(&nonce);
        out.extend(plaintext.iter().zip(keystream.iter()).map(|(p, k)| p ^ k));
        Ok(out)
    }

    fn decrypt_secret(&self, ciphertext: &[u8], key: &[u8]) -> SecretsResult<Vec<u8>> {
        if ciphertext.len() < 8 {
            return Err(Error::PluginDecryption("ciphertext too short".to_string()));
        }
        let (nonce, payload) = ciphertext.split_at(8);
        let keystream = Self::keystream(key, nonce, payload.len());
        Ok(payload.iter().zip(keystream.iter()).map(|(c, k)| c ^ k).collect())
    }
}

// ── Encrypted storage ───────────────────────────────────────────────────

struct MemoryEncryptedCollection {
    key_check: u64,
    /// Applied key while unlocked.
    key: Option<Zeroizing<Vec<u8>>>,
    secrets: HashMap<String, Vec<u8>>,
}

#[derive(Default)]
struct MemoryEncryptedState {
    collections: HashMap<String, MemoryEncryptedCollection>,
    fail_collection_creates: bool,
}

/// In-memory encrypted-storage plugin.
///
/// Payloads are stored in the clear behind the lock gate; only the lock
/// semantics are faithful. The key check is a plain hash — wrong keys are
/// detected, nothing is actually protected.
#[derive(Clone)]
pub struct MemoryEncryptedStoragePlugin {
    name: String,
    state: Arc<Mutex<MemoryEncryptedState>>,
}

impl MemoryEncryptedStoragePlugin {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(MemoryEncryptedState::default())),
        }
    }

    pub fn fail_collection_creates(&self, fail: bool) {
        self.state.lock().unwrap().fail_collection_creates = fail;
    }

    pub fn contains_collection(&self, collection_name: &str) -> bool {
        self.state.lock().unwrap().collections.contains_key(collection_name)
    }

    /// Lock state as seen from outside the daemon.
    pub fn locked(&self, collection_name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .collections
            .get(collection_name)
            .map_or(true, |collection| collection.key.is_none())
    }

    fn key_check(key: &[u8]) -> u64 {
        let mut hasher = DefaultHasher::new();
        b"memory-encrypted-storage-key-check".hash(&mut hasher);
        key.hash(&mut hasher);
        hasher.finish()
    }
}

impl PluginMetadata for MemoryEncryptedStoragePlugin {
    fn name(&self) -> &str {
        &self.name
    }
    fn is_test_plugin(&self) -> bool {
        true
    }
}

impl EncryptedStoragePlugin for MemoryEncryptedStoragePlugin {
    fn storage_type(&self) -> StorageType {
        StorageType::InMemory
    }

    fn block_size(&self) -> usize {
        1
    }

    fn create_collection(&mut self, collection_name: &str, key: &[u8]) -> SecretsResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_collection_creates {
            return Err(Error::PluginOperation("collection creation disabled".to_string()));
        }
        if state.collections.contains_key(collection_name) {
            return Err(Error::CollectionAlreadyExists(collection_name.to_string()));
        }
        state.collections.insert(
            collection_name.to_string(),
            MemoryEncryptedCollection {
                key_check: Self::key_check(key),
                key: Some(Zeroizing::new(key.to_vec())),
                secrets: HashMap::new(),
            },
        );
        Ok(())
    }

    fn remove_collection(&mut self, collection_name: &str) -> SecretsResult<()> {
        self.state.lock().unwrap().collections.remove(collection_name);
        Ok(())
    }

    fn is_locked(&self, collection_name: &str) -> SecretsResult<bool> {
        let state = self.state.lock().unwrap();
        let Some(collection) = state.collections.get(collection_name) else {
            // An absent collection has no applied key.
            return Ok(true);
        };
        Ok(collection.key.is_none())
    }

    fn set_encryption_key(&mut self, collection_name: &str, key: &[u8]) -> SecretsResult<()> {
        let mut state = self.state.lock().unwrap();
        let Some(collection) = state.collections.get_mut(collection_name) else {
            return Err(Error::InvalidCollection(format!(
                "no such collection: {collection_name}"
            )));
        };
        if key.is_empty() {
            collection.key = None;
        } else if collection.key_check == Self::key_check(key) {
            collection.key = Some(Zeroizing::new(key.to_vec()));
        } else {
            // A wrong key is accepted as a call; the collection simply
            // stays locked for the caller to observe.
            collection.key = None;
        }
        Ok(())
    }

    fn set_secret(
        &mut self,
        collection_name: &str,
        hashed_secret_name: &str,
        secret: &[u8],
    ) -> SecretsResult<()> {
        let mut state = self.state.lock().unwrap();
        let Some(collection) = state.collections.get_mut(collection_name) else {
            return Err(Error::InvalidCollection(format!(
                "no such collection: {collection_name}"
            )));
        };
        if collection.key.is_none() {
            return Err(Error::CollectionIsLocked(format!(
                "collection {collection_name} is locked"
            )));
        }
        collection
            .secrets
            .insert(hashed_secret_name.to_string(), secret.to_vec());
        Ok(())
    }

    fn set_secret_with_key(
        &mut self,
        collection_name: &str,
        hashed_secret_name: &str,
        secret: &[u8],
        key: &[u8],
    ) -> SecretsResult<()> {
        let mut state = self.state.lock().unwrap();
        // First keyed write to an unknown collection establishes it,
        // locked, keyed by the supplied key. Standalone secrets arrive
        // this way without a create_collection call.
        let collection = state
            .collections
            .entry(collection_name.to_string())
            .or_insert_with(|| MemoryEncryptedCollection {
                key_check: Self::key_check(key),
                key: None,
                secrets: HashMap::new(),
            });
        if collection.key_check != Self::key_check(key) {
            return Err(Error::IncorrectAuthenticationKey(format!(
                "the authentication key entered for collection {collection_name} was incorrect"
            )));
        }
        collection
            .secrets
            .insert(hashed_secret_name.to_string(), secret.to_vec());
        Ok(())
    }

    fn get_secret(&self, collection_name: &str, hashed_secret_name: &str) -> SecretsResult<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let Some(collection) = state.collections.get(collection_name) else {
            return Err(Error::InvalidCollection(format!(
                "no such collection: {collection_name}"
            )));
        };
        if collection.key.is_none() {
            return Err(Error::CollectionIsLocked(format!(
                "collection {collection_name} is locked"
            )));
        }
        collection
            .secrets
            .get(hashed_secret_name)
            .cloned()
            .ok_or_else(|| Error::InvalidSecret("nonexistent secret name given".to_string()))
    }

    fn access_secret(
        &mut self,
        collection_name: &str,
        hashed_secret_name: &str,
        key: &[u8],
    ) -> SecretsResult<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let Some(collection) = state.collections.get(collection_name) else {
            return Err(Error::InvalidCollection(format!(
                "no such collection: {collection_name}"
            )));
        };
        if collection.key_check != Self::key_check(key) {
            return Err(Error::IncorrectAuthenticationKey(format!(
                "the authentication key entered for collection {collection_name} was incorrect"
            )));
        }
        collection
            .secrets
            .get(hashed_secret_name)
            .cloned()
            .ok_or_else(|| Error::InvalidSecret("nonexistent secret name given".to_string()))
    }

    fn remove_secret(
        &mut self,
        collection_name: &str,
        hashed_secret_name: &str,
    ) -> SecretsResult<()> {
        let mut state = self.state.lock().unwrap();
        let Some(collection) = state.collections.get_mut(collection_name) else {
            return Err(Error::InvalidCollection(format!(
                "no such collection: {collection_name}"
            )));
        };
        if collection.key.is_none() {
            return Err(Error::CollectionIsLocked(format!(
                "collection {collection_name} is locked"
            )));
        }
        collection.secrets.remove(hashed_secret_name);
        Ok(())
    }
}

// ── Authentication ──────────────────────────────────────────────────────

#[derive(Default)]
struct TestAuthenticationState {
    prompts: Vec<AuthenticationPrompt>,
    fail_begin: bool,
}

/// Scripted authentication plugin.
///
/// Records every prompt and never completes on its own; the test resolves
/// flows by calling the service's `authentication_completed` with the
/// recorded request id.
#[derive(Clone)]
pub struct TestAuthenticationPlugin {
    name: String,
    authentication_type: AuthenticationType,
    state: Arc<Mutex<TestAuthenticationState>>,
}

impl TestAuthenticationPlugin {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            authentication_type: AuthenticationType::System,
            state: Arc::new(Mutex::new(TestAuthenticationState::default())),
        }
    }

    /// Variant reporting application-specific authentication.
    pub fn application_specific(name: &str) -> Self {
        Self {
            authentication_type: AuthenticationType::ApplicationSpecific,
            ..Self::new(name)
        }
    }

    /// Makes `begin_authentication` fail, for exercising the synchronous
    /// failure path.
    pub fn fail_begin(&self, fail: bool) {
        self.state.lock().unwrap().fail_begin = fail;
    }

    /// Prompts recorded so far.
    pub fn prompts(&self) -> Vec<AuthenticationPrompt> {
        self.state.lock().unwrap().prompts.clone()
    }
}

impl PluginMetadata for TestAuthenticationPlugin {
    fn name(&self) -> &str {
        &self.name
    }
    fn is_test_plugin(&self) -> bool {
        true
    }
}

impl AuthenticationPlugin for TestAuthenticationPlugin {
    fn authentication_type(&self) -> AuthenticationType {
        self.authentication_type
    }

    fn begin_authentication(&mut self, prompt: AuthenticationPrompt) -> SecretsResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_begin {
            return Err(Error::PluginOperation(
                "authentication flow could not be started".to_string(),
            ));
        }
        state.prompts.push(prompt);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage_round_trip() {
        let mut plugin = MemoryStoragePlugin::new("store");
        plugin.create_collection("vault").expect("create");
        plugin.set_secret("vault", "aaaa", b"payload").expect("set");
        assert_eq!(plugin.get_secret("vault", "aaaa").expect("get"), b"payload");
        plugin.remove_secret("vault", "aaaa").expect("remove");
        assert!(plugin.get_secret("vault", "aaaa").is_err());
    }

    #[test]
    fn test_memory_storage_duplicate_collection_rejected() {
        let mut plugin = MemoryStoragePlugin::new("store");
        plugin.create_collection("vault").expect("create");
        assert!(plugin.create_collection("vault").is_err());
    }

    #[test]
    fn test_memory_encryption_round_trip() {
        let plugin = MemoryEncryptionPlugin::new("crypt");
        let cipher = plugin.encrypt_secret(b"hello", b"key").expect("encrypt");
        assert_ne!(&cipher[8..], b"hello");
        assert_eq!(plugin.decrypt_secret(&cipher, b"key").expect("decrypt"), b"hello");
    }

    #[test]
    fn test_encrypted_storage_lock_cycle() {
        let mut plugin = MemoryEncryptedStoragePlugin::new("enc");
        plugin.create_collection("vault", b"right").expect("create");
        assert!(!plugin.is_locked("vault").expect("locked"));

        plugin.set_encryption_key("vault", &[]).expect("relock");
        assert!(plugin.is_locked("vault").expect("locked"));

        // A wrong key is accepted but leaves the collection locked.
        plugin.set_encryption_key("vault", b"wrong").expect("apply");
        assert!(plugin.is_locked("vault").expect("locked"));

        plugin.set_encryption_key("vault", b"right").expect("apply");
        assert!(!plugin.is_locked("vault").expect("locked"));
    }

    #[test]
    fn test_encrypted_storage_access_requires_key() {
        let mut plugin = MemoryEncryptedStoragePlugin::new("enc");
        plugin.create_collection("standalone", b"key").expect("create");
        plugin
            .set_secret_with_key("standalone", "hh", b"v", b"key")
            .expect("set");
        assert_eq!(plugin.access_secret("standalone", "hh", b"key").expect("access"), b"v");
        assert!(plugin.access_secret("standalone", "hh", b"other").is_err());
    }

    #[test]
    fn test_scripted_authentication_records_prompts() {
        let mut plugin = TestAuthenticationPlugin::new("auth");
        plugin
            .begin_authentication(AuthenticationPrompt {
                caller_pid: 1,
                request_id: 9,
                caller_application_id: "app".to_string(),
                collection_name: "vault".to_string(),
                secret_name: "pwd".to_string(),
                ui_service_address: String::new(),
            })
            .expect("begin");
        let prompts = plugin.prompts();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].request_id, 9);
    }
}
