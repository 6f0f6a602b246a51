//! Handlers for secrets stored inside user collections.

use zeroize::Zeroizing;

use crate::database::{CollectionRow, SecretRow};
use crate::error::{Error, SecretsResult};
use crate::hash::hashed_secret_name;
use crate::types::{
    is_reserved_collection_name, AccessControlMode, Pid, RequestId, ResponseBody, UnlockSemantic,
    UserInteractionMode,
};

use super::{Continuation, HandlerOutcome, RequestProcessor};

impl RequestProcessor {
    /// Validates a (collection, secret) address and loads the collection
    /// row, applying the ownership rules shared by the secret handlers.
    fn addressed_collection(
        &self,
        caller_pid: Pid,
        collection_name: &str,
        secret_name: &str,
    ) -> SecretsResult<CollectionRow> {
        if secret_name.is_empty() {
            return Err(Error::InvalidSecret("empty secret name given".to_string()));
        }
        if collection_name.is_empty() {
            return Err(Error::InvalidCollection("empty collection name given".to_string()));
        }
        if is_reserved_collection_name(collection_name) {
            return Err(Error::InvalidCollection("reserved collection name given".to_string()));
        }
        let Some(row) = self.db.collection(collection_name)? else {
            return Err(Error::InvalidCollection("nonexistent collection name given".to_string()));
        };
        if row.access_control != AccessControlMode::OwnerOnly {
            return Err(Error::OperationNotSupported(
                "access control requests are not currently supported".to_string(),
            ));
        }
        if row.application_id != self.caller_application_id(caller_pid) {
            return Err(Error::Permissions(format!(
                "collection {collection_name} is owned by a different application"
            )));
        }
        self.check_plugin_pair(&row.storage_plugin, &row.encryption_plugin)?;
        Ok(row)
    }

    /// Sets (creates or replaces) a secret in a collection.
    pub(crate) fn set_collection_secret(
        &mut self,
        caller_pid: Pid,
        request_id: RequestId,
        collection_name: &str,
        secret_name: &str,
        secret: &[u8],
        user_interaction: UserInteractionMode,
        ui_service_address: &str,
    ) -> HandlerOutcome {
        let row = match self.addressed_collection(caller_pid, collection_name, secret_name) {
            Ok(row) => row,
            Err(err) => return HandlerOutcome::done(Err(err)),
        };

        if row.storage_plugin == row.encryption_plugin {
            let locked = {
                let plugin = self
                    .registry
                    .encrypted_storage(&row.storage_plugin)
                    .expect("plugin presence checked above");
                match plugin.is_locked(collection_name) {
                    Ok(locked) => locked,
                    Err(err) => return HandlerOutcome::done(Err(err)),
                }
            };
            if !locked {
                return HandlerOutcome::done(self.set_collection_secret_with_key(
                    caller_pid,
                    collection_name,
                    secret_name,
                    secret,
                    &row,
                    None,
                ));
            }
        } else if self.collection_auth_keys.contains_key(collection_name) {
            let key = self.collection_auth_keys[collection_name].clone();
            return HandlerOutcome::done(self.set_collection_secret_with_key(
                caller_pid,
                collection_name,
                secret_name,
                secret,
                &row,
                Some(&key),
            ));
        }

        if let Err(err) = self.interaction_gate(
            row.uses_device_lock_key,
            &row.authentication_plugin,
            user_interaction,
            ui_service_address,
            &format!("collection {collection_name}"),
        ) {
            return HandlerOutcome::done(Err(err));
        }

        let authentication_plugin = row.authentication_plugin.clone();
        self.park_for_authentication(
            caller_pid,
            request_id,
            &authentication_plugin,
            collection_name,
            secret_name,
            ui_service_address,
            Continuation::SetCollectionSecret {
                collection_name: collection_name.to_string(),
                secret_name: secret_name.to_string(),
                secret: secret.to_vec(),
                collection: row,
            },
        )
    }

    /// Continuation of [`set_collection_secret`]: the collection is
    /// unlocked (or `key` carries the authentication key to unlock it).
    pub(crate) fn set_collection_secret_with_key(
        &mut self,
        _caller_pid: Pid,
        collection_name: &str,
        secret_name: &str,
        secret: &[u8],
        collection: &CollectionRow,
        key: Option<&Zeroizing<Vec<u8>>>,
    ) -> SecretsResult<()> {
        let hashed = hashed_secret_name(collection_name, secret_name);
        let secret_already_exists = self.db.secret(collection_name, &hashed)?.is_some();

        if !secret_already_exists {
            // Master row first; the plugin write follows.
            self.db.insert_secret(&SecretRow {
                collection_name: collection_name.to_string(),
                hashed_secret_name: hashed.clone(),
                application_id: collection.application_id.clone(),
                uses_device_lock_key: collection.uses_device_lock_key,
                storage_plugin: collection.storage_plugin.clone(),
                encryption_plugin: collection.encryption_plugin.clone(),
                authentication_plugin: collection.authentication_plugin.clone(),
                unlock_semantic: collection.unlock_semantic,
                custom_lock_timeout_ms: collection.custom_lock_timeout_ms,
                access_control: collection.access_control,
            })?;
        }

        // Plugin lookups are re-validated here: this continuation also
        // runs after an authentication flow, and the registry may have
        // changed while the request was parked.
        let plugin_result = if collection.storage_plugin == collection.encryption_plugin {
            self.apply_encrypted_storage_key(
                &collection.storage_plugin,
                collection_name,
                key.map(|k| k.as_slice()).unwrap_or(&[]),
            )
            .and_then(|()| {
                self.registry
                    .encrypted_storage_mut(&collection.storage_plugin)
                    .ok_or_else(|| {
                        Error::InvalidExtensionPlugin(format!(
                            "no such encrypted storage plugin exists: {}",
                            collection.storage_plugin
                        ))
                    })
                    .and_then(|plugin| plugin.set_secret(collection_name, &hashed, secret))
            })
        } else {
            if !self.collection_auth_keys.contains_key(collection_name) {
                // First presented key for this collection; cached without a
                // verification challenge. A wrong key surfaces as a
                // decryption failure on the next read.
                if let Some(key) = key {
                    self.collection_auth_keys
                        .insert(collection_name.to_string(), key.clone());
                }
            }
            match self.collection_auth_keys.get(collection_name) {
                None => Err(Error::CollectionIsLocked(format!(
                    "collection {collection_name} is locked"
                ))),
                Some(cached_key) => self
                    .registry
                    .encryption(&collection.encryption_plugin)
                    .ok_or_else(|| {
                        Error::InvalidExtensionPlugin(format!(
                            "no such encryption plugin exists: {}",
                            collection.encryption_plugin
                        ))
                    })
                    .and_then(|plugin| plugin.encrypt_secret(secret, cached_key))
                    .and_then(|encrypted| {
                        self.registry
                            .storage_mut(&collection.storage_plugin)
                            .ok_or_else(|| {
                                Error::InvalidExtensionPlugin(format!(
                                    "no such storage plugin exists: {}",
                                    collection.storage_plugin
                                ))
                            })
                            .and_then(|plugin| {
                                plugin.set_secret(collection_name, &hashed, &encrypted)
                            })
                    }),
            }
        };

        match plugin_result {
            Ok(()) => {
                self.arm_collection_relock(
                    collection_name,
                    collection.unlock_semantic,
                    collection.custom_lock_timeout_ms,
                    (collection.storage_plugin == collection.encryption_plugin)
                        .then_some(collection.storage_plugin.as_str()),
                );
                self.relock_after_access(
                    collection_name,
                    &collection.storage_plugin,
                    &collection.encryption_plugin,
                    collection.unlock_semantic,
                );
                Ok(())
            }
            Err(plugin_error) if !secret_already_exists => {
                Err(self.compensate_secret_insert(collection_name, &hashed, plugin_error))
            }
            Err(plugin_error) => Err(plugin_error),
        }
    }

    /// Reads a secret from a collection.
    pub(crate) fn get_collection_secret(
        &mut self,
        caller_pid: Pid,
        request_id: RequestId,
        collection_name: &str,
        secret_name: &str,
        user_interaction: UserInteractionMode,
        ui_service_address: &str,
    ) -> HandlerOutcome {
        let row = match self.addressed_collection(caller_pid, collection_name, secret_name) {
            Ok(row) => row,
            Err(err) => return HandlerOutcome::done(Err(err)),
        };
        // The authentication plugin must still be loadable even when the
        // key is cached; reads may need to re-authenticate later.
        if !self.registry.has_authentication(&row.authentication_plugin) {
            return HandlerOutcome::done(Err(Error::InvalidExtensionPlugin(format!(
                "no such authentication plugin exists: {}",
                row.authentication_plugin
            ))));
        }

        if row.storage_plugin == row.encryption_plugin {
            let locked = {
                let plugin = self
                    .registry
                    .encrypted_storage(&row.storage_plugin)
                    .expect("plugin presence checked above");
                match plugin.is_locked(collection_name) {
                    Ok(locked) => locked,
                    Err(err) => return HandlerOutcome::done(Err(err)),
                }
            };
            if !locked {
                return HandlerOutcome::Complete(
                    self.get_collection_secret_with_key(
                        collection_name,
                        secret_name,
                        &row.storage_plugin,
                        &row.encryption_plugin,
                        row.unlock_semantic,
                        row.custom_lock_timeout_ms,
                        None,
                    )
                    .map(ResponseBody::Secret),
                );
            }
        } else if self.collection_auth_keys.contains_key(collection_name) {
            let key = self.collection_auth_keys[collection_name].clone();
            return HandlerOutcome::Complete(
                self.get_collection_secret_with_key(
                    collection_name,
                    secret_name,
                    &row.storage_plugin,
                    &row.encryption_plugin,
                    row.unlock_semantic,
                    row.custom_lock_timeout_ms,
                    Some(&key),
                )
                .map(ResponseBody::Secret),
            );
        }

        if let Err(err) = self.interaction_gate(
            row.uses_device_lock_key,
            &row.authentication_plugin,
            user_interaction,
            ui_service_address,
            &format!("collection {collection_name}"),
        ) {
            return HandlerOutcome::done(Err(err));
        }

        let authentication_plugin = row.authentication_plugin.clone();
        self.park_for_authentication(
            caller_pid,
            request_id,
            &authentication_plugin,
            collection_name,
            secret_name,
            ui_service_address,
            Continuation::GetCollectionSecret {
                collection_name: collection_name.to_string(),
                secret_name: secret_name.to_string(),
                storage_plugin: row.storage_plugin.clone(),
                encryption_plugin: row.encryption_plugin.clone(),
                unlock_semantic: row.unlock_semantic,
                custom_lock_timeout_ms: row.custom_lock_timeout_ms,
            },
        )
    }

    /// Continuation of [`get_collection_secret`].
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn get_collection_secret_with_key(
        &mut self,
        collection_name: &str,
        secret_name: &str,
        storage_plugin: &str,
        encryption_plugin: &str,
        unlock_semantic: UnlockSemantic,
        custom_lock_timeout_ms: u64,
        key: Option<&Zeroizing<Vec<u8>>>,
    ) -> SecretsResult<Vec<u8>> {
        self.arm_collection_relock(
            collection_name,
            unlock_semantic,
            custom_lock_timeout_ms,
            (storage_plugin == encryption_plugin).then_some(storage_plugin),
        );

        // Plugin lookups are re-validated here: this continuation also
        // runs after an authentication flow, and the registry may have
        // changed while the request was parked.
        let hashed = hashed_secret_name(collection_name, secret_name);
        let result = if storage_plugin == encryption_plugin {
            self.apply_encrypted_storage_key(
                storage_plugin,
                collection_name,
                key.map(|k| k.as_slice()).unwrap_or(&[]),
            )
            .and_then(|()| {
                self.registry
                    .encrypted_storage(storage_plugin)
                    .ok_or_else(|| {
                        Error::InvalidExtensionPlugin(format!(
                            "no such encrypted storage plugin exists: {storage_plugin}"
                        ))
                    })
                    .and_then(|plugin| plugin.get_secret(collection_name, &hashed))
            })
        } else {
            if !self.collection_auth_keys.contains_key(collection_name) {
                if let Some(key) = key {
                    self.collection_auth_keys
                        .insert(collection_name.to_string(), key.clone());
                }
            }
            match self.collection_auth_keys.get(collection_name) {
                None => Err(Error::CollectionIsLocked(format!(
                    "collection {collection_name} is locked"
                ))),
                Some(cached_key) => self
                    .registry
                    .storage(storage_plugin)
                    .ok_or_else(|| {
                        Error::InvalidExtensionPlugin(format!(
                            "no such storage plugin exists: {storage_plugin}"
                        ))
                    })
                    .and_then(|plugin| plugin.get_secret(collection_name, &hashed))
                    .and_then(|encrypted| {
                        self.registry
                            .encryption(encryption_plugin)
                            .ok_or_else(|| {
                                Error::InvalidExtensionPlugin(format!(
                                    "no such encryption plugin exists: {encryption_plugin}"
                                ))
                            })
                            .and_then(|plugin| plugin.decrypt_secret(&encrypted, cached_key))
                    }),
            }
        };

        if result.is_ok() {
            self.relock_after_access(
                collection_name,
                storage_plugin,
                encryption_plugin,
                unlock_semantic,
            );
        }
        result
    }

    /// Deletes a secret from a collection.
    pub(crate) fn delete_collection_secret(
        &mut self,
        caller_pid: Pid,
        request_id: RequestId,
        collection_name: &str,
        secret_name: &str,
        user_interaction: UserInteractionMode,
        ui_service_address: &str,
    ) -> HandlerOutcome {
        let row = match self.addressed_collection(caller_pid, collection_name, secret_name) {
            Ok(row) => row,
            Err(err) => return HandlerOutcome::done(Err(err)),
        };

        if row.storage_plugin == row.encryption_plugin {
            let locked = {
                let plugin = self
                    .registry
                    .encrypted_storage(&row.storage_plugin)
                    .expect("plugin presence checked above");
                match plugin.is_locked(collection_name) {
                    Ok(locked) => locked,
                    Err(err) => return HandlerOutcome::done(Err(err)),
                }
            };
            if !locked {
                return HandlerOutcome::done(self.delete_collection_secret_with_key(
                    caller_pid,
                    collection_name,
                    secret_name,
                    &[],
                ));
            }
        } else if self.collection_auth_keys.contains_key(collection_name) {
            let key = self.collection_auth_keys[collection_name].clone();
            return HandlerOutcome::done(self.delete_collection_secret_with_key(
                caller_pid,
                collection_name,
                secret_name,
                &key,
            ));
        }

        if let Err(err) = self.interaction_gate(
            row.uses_device_lock_key,
            &row.authentication_plugin,
            user_interaction,
            ui_service_address,
            &format!("collection {collection_name}"),
        ) {
            return HandlerOutcome::done(Err(err));
        }

        let authentication_plugin = row.authentication_plugin.clone();
        self.park_for_authentication(
            caller_pid,
            request_id,
            &authentication_plugin,
            collection_name,
            secret_name,
            ui_service_address,
            Continuation::DeleteCollectionSecret {
                collection_name: collection_name.to_string(),
                secret_name: secret_name.to_string(),
            },
        )
    }

    /// Continuation of [`delete_collection_secret`]. Re-validates the
    /// collection row, which may have changed while the authentication
    /// flow was in flight.
    pub(crate) fn delete_collection_secret_with_key(
        &mut self,
        caller_pid: Pid,
        collection_name: &str,
        secret_name: &str,
        authentication_key: &[u8],
    ) -> SecretsResult<()> {
        let Some(row) = self.db.collection(collection_name)? else {
            return Err(Error::InvalidCollection("nonexistent collection name given".to_string()));
        };
        // An empty key means the collection was already unlocked and no
        // key was brokered; a supplied key must be the device-lock key for
        // device-lock rows.
        if row.uses_device_lock_key
            && !authentication_key.is_empty()
            && authentication_key != self.keys.device_lock_key()
        {
            return Err(Error::IncorrectAuthenticationKey(
                "incorrect device lock key provided".to_string(),
            ));
        }
        if row.access_control != AccessControlMode::OwnerOnly {
            return Err(Error::OperationNotSupported(
                "access control requests are not currently supported".to_string(),
            ));
        }
        if row.application_id != self.caller_application_id(caller_pid) {
            return Err(Error::Permissions(format!(
                "collection {collection_name} is owned by a different application"
            )));
        }

        let hashed = hashed_secret_name(collection_name, secret_name);
        if row.storage_plugin == row.encryption_plugin {
            self.apply_encrypted_storage_key(&row.storage_plugin, collection_name, authentication_key)?;
            self.registry
                .encrypted_storage_mut(&row.storage_plugin)
                .ok_or_else(|| {
                    Error::InvalidExtensionPlugin(format!(
                        "no such encrypted storage plugin exists: {}",
                        row.storage_plugin
                    ))
                })?
                .remove_secret(collection_name, &hashed)?;
        } else {
            if !self.collection_auth_keys.contains_key(collection_name)
                && !authentication_key.is_empty()
            {
                self.collection_auth_keys.insert(
                    collection_name.to_string(),
                    Zeroizing::new(authentication_key.to_vec()),
                );
            }
            self.registry
                .storage_mut(&row.storage_plugin)
                .ok_or_else(|| {
                    Error::InvalidExtensionPlugin(format!(
                        "no such storage plugin exists: {}",
                        row.storage_plugin
                    ))
                })?
                .remove_secret(collection_name, &hashed)?;
        }

        if let Err(db_error) = self.db.delete_secret(collection_name, &hashed) {
            self.db
                .quarantine(crate::database::QuarantineKind::Secret, collection_name, &hashed);
            return Err(db_error);
        }
        self.relock_after_access(
            collection_name,
            &row.storage_plugin,
            &row.encryption_plugin,
            row.unlock_semantic,
        );
        Ok(())
    }
}
