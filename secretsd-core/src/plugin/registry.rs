//! Registry of loaded plugins.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::{Error, SecretsResult};

use super::{
    AuthenticationPlugin, AuthenticationPluginInfo, EncryptedStoragePlugin,
    EncryptedStoragePluginInfo, EncryptionPlugin, EncryptionPluginInfo, PluginInfoReport,
    PluginMetadata, StoragePlugin, StoragePluginInfo,
};

/// Holds the loaded plugins of each kind, keyed by name.
///
/// Registration enforces the load-time rules: the plugin's test-mode bit
/// must match the registry's, the name must be non-empty, and the name must
/// not collide with any already-loaded plugin of any kind.
pub struct PluginRegistry {
    test_mode: bool,
    storage: HashMap<String, Box<dyn StoragePlugin>>,
    encryption: HashMap<String, Box<dyn EncryptionPlugin>>,
    encrypted_storage: HashMap<String, Box<dyn EncryptedStoragePlugin>>,
    authentication: HashMap<String, Box<dyn AuthenticationPlugin>>,
}

impl PluginRegistry {
    pub fn new(test_mode: bool) -> Self {
        Self {
            test_mode,
            storage: HashMap::new(),
            encryption: HashMap::new(),
            encrypted_storage: HashMap::new(),
            authentication: HashMap::new(),
        }
    }

    fn check_admission(&self, plugin: &dyn PluginMetadata, kind: &str) -> SecretsResult<String> {
        let name = plugin.name().to_string();
        if plugin.is_test_plugin() != self.test_mode {
            warn!(plugin = %name, kind, "rejecting plugin due to test-mode mismatch");
            return Err(Error::InvalidExtensionPlugin(format!(
                "plugin {name} does not match the daemon's test mode"
            )));
        }
        if name.is_empty() {
            return Err(Error::InvalidExtensionPlugin(
                "plugin reported an empty name".to_string(),
            ));
        }
        if self.storage.contains_key(&name)
            || self.encryption.contains_key(&name)
            || self.encrypted_storage.contains_key(&name)
            || self.authentication.contains_key(&name)
        {
            warn!(plugin = %name, kind, "rejecting plugin with duplicate name");
            return Err(Error::InvalidExtensionPlugin(format!(
                "a plugin named {name} is already loaded"
            )));
        }
        debug!(plugin = %name, kind, "loaded plugin");
        Ok(name)
    }

    /// Registers a storage plugin.
    ///
    /// # Errors
    ///
    /// Returns `InvalidExtensionPlugin` on mode mismatch, empty name, or
    /// name collision with any loaded plugin.
    pub fn register_storage(&mut self, plugin: Box<dyn StoragePlugin>) -> SecretsResult<()> {
        let name = self.check_admission(plugin.as_ref(), "storage")?;
        self.storage.insert(name, plugin);
        Ok(())
    }

    pub fn register_encryption(&mut self, plugin: Box<dyn EncryptionPlugin>) -> SecretsResult<()> {
        let name = self.check_admission(plugin.as_ref(), "encryption")?;
        self.encryption.insert(name, plugin);
        Ok(())
    }

    pub fn register_encrypted_storage(
        &mut self,
        plugin: Box<dyn EncryptedStoragePlugin>,
    ) -> SecretsResult<()> {
        let name = self.check_admission(plugin.as_ref(), "encrypted-storage")?;
        self.encrypted_storage.insert(name, plugin);
        Ok(())
    }

    pub fn register_authentication(
        &mut self,
        plugin: Box<dyn AuthenticationPlugin>,
    ) -> SecretsResult<()> {
        let name = self.check_admission(plugin.as_ref(), "authentication")?;
        self.authentication.insert(name, plugin);
        Ok(())
    }

    // ── Lookups ─────────────────────────────────────────────────────────

    pub fn has_storage(&self, name: &str) -> bool {
        self.storage.contains_key(name)
    }

    pub fn has_encryption(&self, name: &str) -> bool {
        self.encryption.contains_key(name)
    }

    pub fn has_encrypted_storage(&self, name: &str) -> bool {
        self.encrypted_storage.contains_key(name)
    }

    pub fn has_authentication(&self, name: &str) -> bool {
        self.authentication.contains_key(name)
    }

    pub fn storage(&self, name: &str) -> Option<&dyn StoragePlugin> {
        self.storage.get(name).map(Box::as_ref)
    }

    pub fn storage_mut(&mut self, name: &str) -> Option<&mut (dyn StoragePlugin + 'static)> {
        self.storage.get_mut(name).map(Box::as_mut)
    }

    pub fn encryption(&self, name: &str) -> Option<&dyn EncryptionPlugin> {
        self.encryption.get(name).map(Box::as_ref)
    }

    pub fn encrypted_storage(&self, name: &str) -> Option<&dyn EncryptedStoragePlugin> {
        self.encrypted_storage.get(name).map(Box::as_ref)
    }

    pub fn encrypted_storage_mut(
        &mut self,
        name: &str,
    ) -> Option<&mut (dyn EncryptedStoragePlugin + 'static)> {
        self.encrypted_storage.get_mut(name).map(Box::as_mut)
    }

    pub fn authentication(&self, name: &str) -> Option<&dyn AuthenticationPlugin> {
        self.authentication.get(name).map(Box::as_ref)
    }

    pub fn authentication_mut(
        &mut self,
        name: &str,
    ) -> Option<&mut (dyn AuthenticationPlugin + 'static)> {
        self.authentication.get_mut(name).map(Box::as_mut)
    }

    /// Names of the loaded storage plugins.
    pub fn storage_plugin_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.storage.keys().cloned().collect();
        names.sort();
        names
    }

    /// Immutable info snapshot of everything loaded.
    pub fn plugin_info(&self) -> PluginInfoReport {
        let mut report = PluginInfoReport {
            storage_plugins: self
                .storage
                .values()
                .map(|p| StoragePluginInfo {
                    name: p.name().to_string(),
                    storage_type: p.storage_type(),
                })
                .collect(),
            encryption_plugins: self
                .encryption
                .values()
                .map(|p| EncryptionPluginInfo {
                    name: p.name().to_string(),
                    block_size: p.block_size(),
                })
                .collect(),
            encrypted_storage_plugins: self
                .encrypted_storage
                .values()
                .map(|p| EncryptedStoragePluginInfo {
                    name: p.name().to_string(),
                    storage_type: p.storage_type(),
                    block_size: p.block_size(),
                })
                .collect(),
            authentication_plugins: self
                .authentication
                .values()
                .map(|p| AuthenticationPluginInfo {
                    name: p.name().to_string(),
                    authentication_type: p.authentication_type(),
                })
                .collect(),
        };
        report.storage_plugins.sort_by(|a, b| a.name.cmp(&b.name));
        report.encryption_plugins.sort_by(|a, b| a.name.cmp(&b.name));
        report
            .encrypted_storage_plugins
            .sort_by(|a, b| a.name.cmp(&b.name));
        report
            .authentication_plugins
            .sort_by(|a, b| a.name.cmp(&b.name));
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{AuthenticationPrompt, AuthenticationType, ReencryptionTarget, StorageType};

    struct DummyStorage {
        name: String,
        test: bool,
    }

    impl PluginMetadata for DummyStorage {
        fn name(&self) -> &str {
            &self.name
        }
        fn is_test_plugin(&self) -> bool {
            self.test
        }
    }

    impl StoragePlugin for DummyStorage {
        fn storage_type(&self) -> StorageType {
            StorageType::InMemory
        }
        fn create_collection(&mut self, _collection_name: &str) -> SecretsResult<()> {
            Ok(())
        }
        fn remove_collection(&mut self, _collection_name: &str) -> SecretsResult<()> {
            Ok(())
        }
        fn set_secret(&mut self, _c: &str, _h: &str, _s: &[u8]) -> SecretsResult<()> {
            Ok(())
        }
        fn get_secret(&self, _c: &str, _h: &str) -> SecretsResult<Vec<u8>> {
            Ok(Vec::new())
        }
        fn remove_secret(&mut self, _c: &str, _h: &str) -> SecretsResult<()> {
            Ok(())
        }
        fn reencrypt_secrets(
            &mut self,
            _target: ReencryptionTarget<'_>,
            _old: &[u8],
            _new: &[u8],
            _encryption: &dyn EncryptionPlugin,
        ) -> SecretsResult<()> {
            Ok(())
        }
    }

    struct DummyAuth {
        name: String,
    }

    impl PluginMetadata for DummyAuth {
        fn name(&self) -> &str {
            &self.name
        }
        fn is_test_plugin(&self) -> bool {
            true
        }
    }

    impl AuthenticationPlugin for DummyAuth {
        fn authentication_type(&self) -> AuthenticationType {
            AuthenticationType::System
        }
        fn begin_authentication(&mut self, _prompt: AuthenticationPrompt) -> SecretsResult<()> {
            Ok(())
        }
    }

    fn storage(name: &str, test: bool) -> Box<dyn StoragePlugin> {
        Box::new(DummyStorage {
            name: name.to_string(),
            test,
        })
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = PluginRegistry::new(true);
        registry.register_storage(storage("store", true)).expect("register");
        assert!(registry.has_storage("store"));
        assert!(registry.storage("store").is_some());
        assert_eq!(registry.storage_plugin_names(), vec!["store".to_string()]);
    }

    #[test]
    fn test_test_mode_mismatch_rejected() {
        let mut registry = PluginRegistry::new(false);
        assert!(registry.register_storage(storage("store", true)).is_err());
        assert!(!registry.has_storage("store"));
    }

    #[test]
    fn test_duplicate_name_rejected_across_kinds() {
        let mut registry = PluginRegistry::new(true);
        registry
            .register_authentication(Box::new(DummyAuth {
                name: "shared".to_string(),
            }))
            .expect("register auth");
        assert!(registry.register_storage(storage("shared", true)).is_err());
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut registry = PluginRegistry::new(true);
        assert!(registry.register_storage(storage("", true)).is_err());
    }

    #[test]
    fn test_plugin_info_snapshot() {
        let mut registry = PluginRegistry::new(true);
        registry.register_storage(storage("b-store", true)).expect("register");
        registry.register_storage(storage("a-store", true)).expect("register");
        let report = registry.plugin_info();
        assert_eq!(report.storage_plugins.len(), 2);
        assert_eq!(report.storage_plugins[0].name, "a-store");
        assert!(report.authentication_plugins.is_empty());
    }
}
