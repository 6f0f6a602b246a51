//! Handlers for standalone secrets.
//!
//! Standalone secrets live under the reserved collection row and carry
//! their own per-row lock attributes.

use tracing::debug;
use zeroize::Zeroizing;

use crate::database::SecretRow;
use crate::error::{Error, SecretsResult};
use crate::hash::hashed_secret_name;
use crate::plugin::AuthenticationType;
use crate::types::{
    AccessControlMode, CustomLockUnlockSemantic, DeviceLockUnlockSemantic, Pid, RequestId,
    ResponseBody, UnlockSemantic, UserInteractionMode, DEVICE_LOCK_AUTHENTICATION_PLUGIN_NAME,
    RESERVED_COLLECTION_NAME,
};

use super::{Continuation, HandlerOutcome, RequestProcessor};

impl RequestProcessor {
    /// Constraint checks applied when a set targets an existing standalone
    /// row: ownership, lock class and storage plugin must not change.
    fn check_existing_standalone_row(
        &self,
        row: &SecretRow,
        caller_application_id: &str,
        secret_name: &str,
        storage_plugin: &str,
        expect_device_lock: bool,
    ) -> SecretsResult<()> {
        if row.access_control != AccessControlMode::OwnerOnly {
            return Err(Error::OperationNotSupported(
                "access control requests are not currently supported".to_string(),
            ));
        }
        if row.application_id != caller_application_id {
            return Err(Error::Permissions(format!(
                "secret {secret_name} is owned by a different application"
            )));
        }
        if row.uses_device_lock_key != expect_device_lock {
            let class = if expect_device_lock { "devicelock" } else { "customlock" };
            return Err(Error::OperationNotSupported(format!(
                "secret {secret_name} already exists and is not a {class} protected secret"
            )));
        }
        if !row.storage_plugin.eq_ignore_ascii_case(storage_plugin) {
            return Err(Error::OperationNotSupported(format!(
                "secret {secret_name} already exists and is not stored via plugin {storage_plugin}"
            )));
        }
        Ok(())
    }

    /// Sets a standalone secret protected by the device-lock key.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn set_standalone_device_lock_secret(
        &mut self,
        caller_pid: Pid,
        storage_plugin: &str,
        encryption_plugin: &str,
        secret_name: &str,
        secret: &[u8],
        unlock_semantic: DeviceLockUnlockSemantic,
        access_control: AccessControlMode,
        _user_interaction: UserInteractionMode,
    ) -> SecretsResult<()> {
        if secret_name.is_empty() {
            return Err(Error::InvalidSecret("empty secret name given".to_string()));
        }
        self.check_plugin_pair(storage_plugin, encryption_plugin)?;

        let caller_application_id = self.caller_application_id(caller_pid);
        let hashed = hashed_secret_name(RESERVED_COLLECTION_NAME, secret_name);
        let existing = self.db.secret(RESERVED_COLLECTION_NAME, &hashed)?;
        if let Some(row) = &existing {
            self.check_existing_standalone_row(
                row,
                &caller_application_id,
                secret_name,
                storage_plugin,
                true,
            )?;
        }

        let row = SecretRow {
            collection_name: RESERVED_COLLECTION_NAME.to_string(),
            hashed_secret_name: hashed.clone(),
            application_id: caller_application_id,
            uses_device_lock_key: true,
            storage_plugin: storage_plugin.to_string(),
            encryption_plugin: encryption_plugin.to_string(),
            authentication_plugin: DEVICE_LOCK_AUTHENTICATION_PLUGIN_NAME.to_string(),
            unlock_semantic: unlock_semantic.into(),
            custom_lock_timeout_ms: 0,
            access_control,
        };
        if existing.is_some() {
            self.db.update_secret(&row)?;
        } else {
            self.db.insert_secret(&row)?;
        }

        let device_lock_key = self.keys.device_lock_key().to_vec();
        let plugin_result = if storage_plugin == encryption_plugin {
            self.registry
                .encrypted_storage_mut(storage_plugin)
                .expect("plugin presence checked above")
                .set_secret_with_key(RESERVED_COLLECTION_NAME, &hashed, secret, &device_lock_key)
        } else {
            let encrypted = self
                .registry
                .encryption(encryption_plugin)
                .expect("plugin presence checked above")
                .encrypt_secret(secret, &device_lock_key);
            encrypted.and_then(|encrypted| {
                let result = self
                    .registry
                    .storage_mut(storage_plugin)
                    .expect("plugin presence checked above")
                    .set_secret(RESERVED_COLLECTION_NAME, &hashed, &encrypted);
                if result.is_ok() {
                    self.standalone_auth_keys
                        .insert(hashed.clone(), Zeroizing::new(device_lock_key.clone()));
                }
                result
            })
        };

        match plugin_result {
            Ok(()) => Ok(()),
            Err(plugin_error) if existing.is_none() => {
                Err(self.compensate_secret_insert(RESERVED_COLLECTION_NAME, &hashed, plugin_error))
            }
            Err(plugin_error) => Err(plugin_error),
        }
    }

    /// Sets a standalone custom-lock secret. Starts the authentication
    /// flow that produces the secret's key and parks the request.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn set_standalone_custom_lock_secret(
        &mut self,
        caller_pid: Pid,
        request_id: RequestId,
        storage_plugin: &str,
        encryption_plugin: &str,
        authentication_plugin: &str,
        secret_name: &str,
        secret: &[u8],
        unlock_semantic: CustomLockUnlockSemantic,
        custom_lock_timeout_ms: u64,
        access_control: AccessControlMode,
        user_interaction: UserInteractionMode,
        ui_service_address: &str,
    ) -> HandlerOutcome {
        if secret_name.is_empty() {
            return HandlerOutcome::done(Err(Error::InvalidSecret(
                "empty secret name given".to_string(),
            )));
        }
        if let Err(err) = self.check_plugin_pair(storage_plugin, encryption_plugin) {
            return HandlerOutcome::done(Err(err));
        }

        let caller_application_id = self.caller_application_id(caller_pid);
        let hashed = hashed_secret_name(RESERVED_COLLECTION_NAME, secret_name);
        match self.db.secret(RESERVED_COLLECTION_NAME, &hashed) {
            Ok(Some(row)) => {
                if let Err(err) = self.check_existing_standalone_row(
                    &row,
                    &caller_application_id,
                    secret_name,
                    storage_plugin,
                    false,
                ) {
                    return HandlerOutcome::done(Err(err));
                }
            }
            Ok(None) => {}
            Err(err) => return HandlerOutcome::done(Err(err)),
        }
        if let Err(err) = self.interaction_gate(
            false,
            authentication_plugin,
            user_interaction,
            ui_service_address,
            &format!("secret {secret_name}"),
        ) {
            return HandlerOutcome::done(Err(err));
        }

        self.park_for_authentication(
            caller_pid,
            request_id,
            authentication_plugin,
            "",
            secret_name,
            ui_service_address,
            Continuation::SetStandaloneCustomLockSecret {
                storage_plugin: storage_plugin.to_string(),
                encryption_plugin: encryption_plugin.to_string(),
                authentication_plugin: authentication_plugin.to_string(),
                secret_name: secret_name.to_string(),
                secret: secret.to_vec(),
                unlock_semantic,
                custom_lock_timeout_ms,
                access_control,
            },
        )
    }

    /// Continuation of [`set_standalone_custom_lock_secret`]. Re-validates
    /// the row, which may have been created or changed while the
    /// authentication flow was in flight.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn set_standalone_custom_lock_secret_with_key(
        &mut self,
        caller_pid: Pid,
        storage_plugin: &str,
        encryption_plugin: &str,
        authentication_plugin: &str,
        secret_name: &str,
        secret: &[u8],
        unlock_semantic: CustomLockUnlockSemantic,
        custom_lock_timeout_ms: u64,
        access_control: AccessControlMode,
        authentication_key: &[u8],
    ) -> SecretsResult<()> {
        let caller_application_id = self.caller_application_id(caller_pid);
        let hashed = hashed_secret_name(RESERVED_COLLECTION_NAME, secret_name);
        let existing = self.db.secret(RESERVED_COLLECTION_NAME, &hashed)?;
        if let Some(row) = &existing {
            self.check_existing_standalone_row(
                row,
                &caller_application_id,
                secret_name,
                storage_plugin,
                false,
            )?;
        }

        let row = SecretRow {
            collection_name: RESERVED_COLLECTION_NAME.to_string(),
            hashed_secret_name: hashed.clone(),
            application_id: caller_application_id,
            uses_device_lock_key: false,
            storage_plugin: storage_plugin.to_string(),
            encryption_plugin: encryption_plugin.to_string(),
            authentication_plugin: authentication_plugin.to_string(),
            unlock_semantic: unlock_semantic.into(),
            custom_lock_timeout_ms,
            access_control,
        };
        if existing.is_some() {
            self.db.update_secret(&row)?;
        } else {
            self.db.insert_secret(&row)?;
        }

        let plugin_result = if storage_plugin == encryption_plugin {
            self.registry
                .encrypted_storage_mut(storage_plugin)
                .ok_or_else(|| {
                    Error::InvalidExtensionPlugin(format!(
                        "no such encrypted storage plugin exists: {storage_plugin}"
                    ))
                })
                .and_then(|plugin| {
                    plugin.set_secret_with_key(
                        RESERVED_COLLECTION_NAME,
                        &hashed,
                        secret,
                        authentication_key,
                    )
                })
        } else {
            let encrypted = self
                .registry
                .encryption(encryption_plugin)
                .ok_or_else(|| {
                    Error::InvalidExtensionPlugin(format!(
                        "no such encryption plugin exists: {encryption_plugin}"
                    ))
                })
                .and_then(|plugin| plugin.encrypt_secret(secret, authentication_key));
            encrypted.and_then(|encrypted| {
                let result = self
                    .registry
                    .storage_mut(storage_plugin)
                    .ok_or_else(|| {
                        Error::InvalidExtensionPlugin(format!(
                            "no such storage plugin exists: {storage_plugin}"
                        ))
                    })
                    .and_then(|plugin| {
                        plugin.set_secret(RESERVED_COLLECTION_NAME, &hashed, &encrypted)
                    });
                if result.is_ok() {
                    self.standalone_auth_keys
                        .insert(hashed.clone(), Zeroizing::new(authentication_key.to_vec()));
                }
                result
            })
        };

        match plugin_result {
            Ok(()) => {
                self.arm_standalone_relock(&hashed, unlock_semantic.into(), custom_lock_timeout_ms);
                self.relock_standalone_after_access(&hashed, unlock_semantic.into());
                Ok(())
            }
            Err(plugin_error) if existing.is_none() => {
                Err(self.compensate_secret_insert(RESERVED_COLLECTION_NAME, &hashed, plugin_error))
            }
            Err(plugin_error) => Err(plugin_error),
        }
    }

    /// Reads a standalone secret.
    pub(crate) fn get_standalone_secret(
        &mut self,
        caller_pid: Pid,
        request_id: RequestId,
        secret_name: &str,
        user_interaction: UserInteractionMode,
        ui_service_address: &str,
    ) -> HandlerOutcome {
        if secret_name.is_empty() {
            return HandlerOutcome::done(Err(Error::InvalidSecret(
                "empty secret name given".to_string(),
            )));
        }

        let hashed = hashed_secret_name(RESERVED_COLLECTION_NAME, secret_name);
        let row = match self.db.secret(RESERVED_COLLECTION_NAME, &hashed) {
            Ok(Some(row)) => row,
            Ok(None) => {
                return HandlerOutcome::done(Err(Error::InvalidSecret(
                    "nonexistent secret name given".to_string(),
                )))
            }
            Err(err) => return HandlerOutcome::done(Err(err)),
        };
        if let Err(err) = self.check_plugin_pair(&row.storage_plugin, &row.encryption_plugin) {
            return HandlerOutcome::done(Err(err));
        }
        if row.access_control != AccessControlMode::OwnerOnly {
            return HandlerOutcome::done(Err(Error::OperationNotSupported(
                "access control requests are not currently supported".to_string(),
            )));
        }
        if row.application_id != self.caller_application_id(caller_pid) {
            return HandlerOutcome::done(Err(Error::Permissions(format!(
                "secret {secret_name} is owned by a different application"
            ))));
        }
        // The in-process constraint applies even when the key is cached.
        match self.registry.authentication(&row.authentication_plugin) {
            None if !row.uses_device_lock_key => {
                return HandlerOutcome::done(Err(Error::InvalidExtensionPlugin(format!(
                    "no such authentication plugin exists: {}",
                    row.authentication_plugin
                ))))
            }
            Some(plugin)
                if plugin.authentication_type()
                    == AuthenticationType::ApplicationSpecific
                    && (user_interaction != UserInteractionMode::InProcess
                        || ui_service_address.is_empty()) =>
            {
                return HandlerOutcome::done(Err(
                    Error::OperationRequiresInProcessUserInteraction(format!(
                        "authentication plugin {} requires in-process user interaction",
                        row.authentication_plugin
                    )),
                ))
            }
            _ => {}
        }

        if self.standalone_auth_keys.contains_key(&hashed) {
            let key = self.standalone_auth_keys[&hashed].clone();
            return HandlerOutcome::Complete(
                self.get_standalone_secret_with_key(
                    secret_name,
                    &row.storage_plugin,
                    &row.encryption_plugin,
                    row.unlock_semantic,
                    row.custom_lock_timeout_ms,
                    &key,
                )
                .map(ResponseBody::Secret),
            );
        }

        if row.uses_device_lock_key {
            return HandlerOutcome::done(Err(Error::CollectionIsLocked(format!(
                "secret {secret_name} is locked and requires device lock authentication"
            ))));
        }
        if user_interaction == UserInteractionMode::Prevent {
            return HandlerOutcome::done(Err(Error::OperationRequiresUserInteraction(format!(
                "authentication plugin {} requires user interaction",
                row.authentication_plugin
            ))));
        }

        let authentication_plugin = row.authentication_plugin.clone();
        self.park_for_authentication(
            caller_pid,
            request_id,
            &authentication_plugin,
            "",
            secret_name,
            ui_service_address,
            Continuation::GetStandaloneSecret {
                secret_name: secret_name.to_string(),
                storage_plugin: row.storage_plugin.clone(),
                encryption_plugin: row.encryption_plugin.clone(),
                unlock_semantic: row.unlock_semantic,
                custom_lock_timeout_ms: row.custom_lock_timeout_ms,
            },
        )
    }

    /// Continuation of [`get_standalone_secret`].
    pub(crate) fn get_standalone_secret_with_key(
        &mut self,
        secret_name: &str,
        storage_plugin: &str,
        encryption_plugin: &str,
        unlock_semantic: UnlockSemantic,
        custom_lock_timeout_ms: u64,
        authentication_key: &[u8],
    ) -> SecretsResult<Vec<u8>> {
        let hashed = hashed_secret_name(RESERVED_COLLECTION_NAME, secret_name);
        self.arm_standalone_relock(&hashed, unlock_semantic, custom_lock_timeout_ms);

        let result = if storage_plugin == encryption_plugin {
            self.registry
                .encrypted_storage_mut(storage_plugin)
                .ok_or_else(|| {
                    Error::InvalidExtensionPlugin(format!(
                        "no such encrypted storage plugin exists: {storage_plugin}"
                    ))
                })
                .and_then(|plugin| {
                    plugin.access_secret(RESERVED_COLLECTION_NAME, &hashed, authentication_key)
                })
        } else {
            self.registry
                .storage(storage_plugin)
                .ok_or_else(|| {
                    Error::InvalidExtensionPlugin(format!(
                        "no such storage plugin exists: {storage_plugin}"
                    ))
                })
                .and_then(|plugin| plugin.get_secret(RESERVED_COLLECTION_NAME, &hashed))
                .and_then(|encrypted| {
                    self.registry
                        .encryption(encryption_plugin)
                        .ok_or_else(|| {
                            Error::InvalidExtensionPlugin(format!(
                                "no such encryption plugin exists: {encryption_plugin}"
                            ))
                        })
                        .and_then(|plugin| plugin.decrypt_secret(&encrypted, authentication_key))
                })
        };

        if result.is_ok() {
            self.relock_standalone_after_access(&hashed, unlock_semantic);
        }
        result
    }

    /// Deletes a standalone secret. Deleting an absent secret succeeds.
    pub(crate) fn delete_standalone_secret(
        &mut self,
        caller_pid: Pid,
        secret_name: &str,
        _user_interaction: UserInteractionMode,
    ) -> SecretsResult<()> {
        let hashed = hashed_secret_name(RESERVED_COLLECTION_NAME, secret_name);
        let Some(row) = self.db.secret(RESERVED_COLLECTION_NAME, &hashed)? else {
            return Ok(());
        };

        if row.access_control != AccessControlMode::OwnerOnly {
            return Err(Error::OperationNotSupported(
                "access control requests are not currently supported".to_string(),
            ));
        }
        if row.application_id != self.caller_application_id(caller_pid) {
            return Err(Error::Permissions(format!(
                "secret {secret_name} is owned by a different application"
            )));
        }
        self.check_plugin_pair(&row.storage_plugin, &row.encryption_plugin)?;

        if row.storage_plugin == row.encryption_plugin {
            let device_lock_key = self.keys.device_lock_key().to_vec();
            let plugin = self
                .registry
                .encrypted_storage_mut(&row.storage_plugin)
                .expect("plugin presence checked above");
            let was_locked = plugin.is_locked(RESERVED_COLLECTION_NAME)?;
            if was_locked && row.uses_device_lock_key {
                // Unlock with the device-lock key for the duration of the
                // delete, relocking afterwards.
                plugin.set_encryption_key(RESERVED_COLLECTION_NAME, &device_lock_key)?;
            }
            let remove_result = plugin.remove_secret(RESERVED_COLLECTION_NAME, &hashed);
            if was_locked {
                let _ = plugin.set_encryption_key(RESERVED_COLLECTION_NAME, &[]);
            }
            remove_result?;
        } else {
            self.registry
                .storage_mut(&row.storage_plugin)
                .expect("plugin presence checked above")
                .remove_secret(RESERVED_COLLECTION_NAME, &hashed)?;
            self.standalone_auth_keys.remove(&hashed);
            self.standalone_relocks.remove(&hashed);
        }
        debug!("removed standalone secret");

        if let Err(db_error) = self.db.delete_secret(RESERVED_COLLECTION_NAME, &hashed) {
            self.db.quarantine(
                crate::database::QuarantineKind::Secret,
                RESERVED_COLLECTION_NAME,
                &hashed,
            );
            return Err(db_error);
        }
        Ok(())
    }
}
