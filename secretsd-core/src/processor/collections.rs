//! Collection lifecycle handlers.

use tracing::debug;
use zeroize::Zeroizing;

use crate::database::CollectionRow;
use crate::error::{Error, SecretsResult};
use crate::types::{
    is_reserved_collection_name, AccessControlMode, CustomLockUnlockSemantic,
    DeviceLockUnlockSemantic, Pid, RequestId, UserInteractionMode,
    DEVICE_LOCK_AUTHENTICATION_PLUGIN_NAME,
};

use super::{Continuation, HandlerOutcome, RequestProcessor};

impl RequestProcessor {
    /// Creates a collection protected by the device-lock key.
    pub(crate) fn create_device_lock_collection(
        &mut self,
        caller_pid: Pid,
        collection_name: &str,
        storage_plugin: &str,
        encryption_plugin: &str,
        unlock_semantic: DeviceLockUnlockSemantic,
        access_control: AccessControlMode,
    ) -> SecretsResult<()> {
        if collection_name.is_empty() {
            return Err(Error::InvalidCollection("empty collection name given".to_string()));
        }
        if is_reserved_collection_name(collection_name) {
            return Err(Error::InvalidCollection("reserved collection name given".to_string()));
        }
        self.check_plugin_pair(storage_plugin, encryption_plugin)?;

        let row = CollectionRow {
            name: collection_name.to_string(),
            application_id: self.caller_application_id(caller_pid),
            uses_device_lock_key: true,
            storage_plugin: storage_plugin.to_string(),
            encryption_plugin: encryption_plugin.to_string(),
            authentication_plugin: DEVICE_LOCK_AUTHENTICATION_PLUGIN_NAME.to_string(),
            unlock_semantic: unlock_semantic.into(),
            custom_lock_timeout_ms: 0,
            access_control,
        };
        self.db.insert_collection(&row)?;

        let device_lock_key = self.keys.device_lock_key().to_vec();
        let plugin_result = if storage_plugin == encryption_plugin {
            self.registry
                .encrypted_storage_mut(storage_plugin)
                .expect("plugin presence checked above")
                .create_collection(collection_name, &device_lock_key)
        } else {
            let result = self
                .registry
                .storage_mut(storage_plugin)
                .expect("plugin presence checked above")
                .create_collection(collection_name);
            if result.is_ok() {
                self.collection_auth_keys
                    .insert(collection_name.to_string(), Zeroizing::new(device_lock_key));
            }
            result
        };

        match plugin_result {
            Ok(()) => Ok(()),
            Err(plugin_error) => Err(self.compensate_collection_insert(collection_name, plugin_error)),
        }
    }

    /// Creates a custom-lock collection. Starts the authentication flow
    /// that produces the collection key and parks the request.
    pub(crate) fn create_custom_lock_collection(
        &mut self,
        caller_pid: Pid,
        request_id: RequestId,
        collection_name: &str,
        storage_plugin: &str,
        encryption_plugin: &str,
        authentication_plugin: &str,
        unlock_semantic: CustomLockUnlockSemantic,
        custom_lock_timeout_ms: u64,
        access_control: AccessControlMode,
        user_interaction: UserInteractionMode,
        ui_service_address: &str,
    ) -> HandlerOutcome {
        if collection_name.is_empty() {
            return HandlerOutcome::done(Err(Error::InvalidCollection(
                "empty collection name given".to_string(),
            )));
        }
        if is_reserved_collection_name(collection_name) {
            return HandlerOutcome::done(Err(Error::InvalidCollection(
                "reserved collection name given".to_string(),
            )));
        }
        if let Err(err) = self.check_plugin_pair(storage_plugin, encryption_plugin) {
            return HandlerOutcome::done(Err(err));
        }
        if let Err(err) = self.interaction_gate(
            false,
            authentication_plugin,
            user_interaction,
            ui_service_address,
            collection_name,
        ) {
            return HandlerOutcome::done(Err(err));
        }
        match self.db.collection(collection_name) {
            Ok(None) => {}
            Ok(Some(_)) => {
                return HandlerOutcome::done(Err(Error::CollectionAlreadyExists(
                    collection_name.to_string(),
                )))
            }
            Err(err) => return HandlerOutcome::done(Err(err)),
        }

        self.park_for_authentication(
            caller_pid,
            request_id,
            authentication_plugin,
            collection_name,
            "",
            ui_service_address,
            Continuation::CreateCustomLockCollection {
                collection_name: collection_name.to_string(),
                storage_plugin: storage_plugin.to_string(),
                encryption_plugin: encryption_plugin.to_string(),
                authentication_plugin: authentication_plugin.to_string(),
                unlock_semantic,
                custom_lock_timeout_ms,
                access_control,
            },
        )
    }

    /// Continuation of [`create_custom_lock_collection`] once the
    /// authentication flow delivered the collection key.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create_custom_lock_collection_with_key(
        &mut self,
        caller_pid: Pid,
        collection_name: &str,
        storage_plugin: &str,
        encryption_plugin: &str,
        authentication_plugin: &str,
        unlock_semantic: CustomLockUnlockSemantic,
        custom_lock_timeout_ms: u64,
        access_control: AccessControlMode,
        authentication_key: &[u8],
    ) -> SecretsResult<()> {
        // Re-check absence: another request may have created the name
        // while the authentication flow was in flight.
        if self.db.collection(collection_name)?.is_some() {
            return Err(Error::CollectionAlreadyExists(collection_name.to_string()));
        }

        let row = CollectionRow {
            name: collection_name.to_string(),
            application_id: self.caller_application_id(caller_pid),
            uses_device_lock_key: false,
            storage_plugin: storage_plugin.to_string(),
            encryption_plugin: encryption_plugin.to_string(),
            authentication_plugin: authentication_plugin.to_string(),
            unlock_semantic: unlock_semantic.into(),
            custom_lock_timeout_ms,
            access_control,
        };
        self.db.insert_collection(&row)?;

        let plugin_result = if storage_plugin == encryption_plugin {
            match self.registry.encrypted_storage_mut(storage_plugin) {
                Some(plugin) => plugin.create_collection(collection_name, authentication_key),
                None => Err(Error::InvalidExtensionPlugin(format!(
                    "no such encrypted storage plugin exists: {storage_plugin}"
                ))),
            }
        } else {
            let result = match self.registry.storage_mut(storage_plugin) {
                Some(plugin) => plugin.create_collection(collection_name),
                None => Err(Error::InvalidExtensionPlugin(format!(
                    "no such storage plugin exists: {storage_plugin}"
                ))),
            };
            if result.is_ok() {
                self.collection_auth_keys
                    .insert(collection_name.to_string(), Zeroizing::new(authentication_key.to_vec()));
            }
            result
        };

        match plugin_result {
            Ok(()) => Ok(()),
            Err(plugin_error) => Err(self.compensate_collection_insert(collection_name, plugin_error)),
        }
    }

    /// Deletes a collection: plugin first, then the master row, then the
    /// in-memory caches.
    pub(crate) fn delete_collection(
        &mut self,
        _caller_pid: Pid,
        collection_name: &str,
        _user_interaction: UserInteractionMode,
    ) -> SecretsResult<()> {
        if is_reserved_collection_name(collection_name) {
            return Err(Error::InvalidCollection("reserved collection name given".to_string()));
        }
        if collection_name.is_empty() {
            return Err(Error::InvalidCollection("empty collection name given".to_string()));
        }

        let Some(row) = self.db.collection(collection_name)? else {
            // Nothing to delete; deleting succeeded.
            return Ok(());
        };
        self.check_plugin_pair(&row.storage_plugin, &row.encryption_plugin)?;

        // Plugin-side removal first; the master row follows only once the
        // payloads are gone.
        if row.storage_plugin == row.encryption_plugin {
            self.registry
                .encrypted_storage_mut(&row.storage_plugin)
                .expect("plugin presence checked above")
                .remove_collection(collection_name)?;
        } else {
            self.registry
                .storage_mut(&row.storage_plugin)
                .expect("plugin presence checked above")
                .remove_collection(collection_name)?;
        }

        self.collection_auth_keys.remove(collection_name);
        self.collection_relocks.remove(collection_name);
        debug!(collection = collection_name, "removed collection");

        if let Err(db_error) = self.db.delete_collection(collection_name) {
            self.db.quarantine(
                crate::database::QuarantineKind::Collection,
                collection_name,
                "",
            );
            return Err(db_error);
        }
        Ok(())
    }
}
