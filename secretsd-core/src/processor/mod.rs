//! The request-processing state machine.
//!
//! Handlers validate, authorise, route to plugins, and pair master-table
//! mutations with plugin mutations. Mutating operations follow the
//! write-master-then-plugin contract: the master row is committed first,
//! the plugin operation runs second, and a plugin failure triggers a
//! compensating delete of the just-written row. The reverse order is
//! forbidden — a failed compensation leaves a recoverable orphan metadata
//! row (quarantined for the startup sweep), whereas plugin-first could
//! leave an untracked plugin payload.
//!
//! Read-style operations on locked entities follow the unlock-or-park
//! contract: either a cached authentication key (or an already-unlocked
//! encrypted-storage collection) lets the handler continue synchronously,
//! or the handler starts an authentication flow, parks a continuation and
//! reports the request pending.

mod collections;
mod pending;
mod secrets;
mod standalone;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::database::{QuarantineKind, SecretsDatabase};
use crate::error::{Error, SecretsResult};
use crate::identity::ProcessIdentity;
use crate::keys::{AuthKey, DaemonKeys};
use crate::plugin::{
    AuthenticationPrompt, AuthenticationType, PluginInfoReport, PluginRegistry,
};
use crate::types::{
    Pid, RequestId, ResponseBody, UnlockSemantic, UserInteractionMode,
};

pub(crate) use pending::{Continuation, PendingTable};

/// Result of dispatching one request to a handler.
pub(crate) enum HandlerOutcome {
    /// The handler ran to completion; the reply can be emitted.
    Complete(SecretsResult<ResponseBody>),
    /// The request was parked on an authentication flow; a later
    /// `request_finished` delivers the real outcome.
    Pending,
}

impl HandlerOutcome {
    /// Wraps a unit result as a completed outcome.
    pub fn done(result: SecretsResult<()>) -> Self {
        HandlerOutcome::Complete(result.map(|()| ResponseBody::None))
    }
}

/// A pending relock deadline for an unlocked entity.
struct RelockEntry {
    deadline: Instant,
    /// Set when the entity lives in an encrypted-storage plugin that must
    /// itself be relocked when the deadline fires.
    encrypted_storage_plugin: Option<String>,
}

/// The state-machine core shared by every request handler.
pub struct RequestProcessor {
    db: SecretsDatabase,
    registry: PluginRegistry,
    identity: Box<dyn ProcessIdentity>,
    keys: DaemonKeys,
    /// collection name → cached authentication key, present while unlocked.
    collection_auth_keys: HashMap<String, AuthKey>,
    /// hashed standalone secret name → cached authentication key.
    standalone_auth_keys: HashMap<String, AuthKey>,
    collection_relocks: HashMap<String, RelockEntry>,
    standalone_relocks: HashMap<String, Instant>,
    pending: PendingTable,
}

impl RequestProcessor {
    pub fn new(
        db: SecretsDatabase,
        registry: PluginRegistry,
        identity: Box<dyn ProcessIdentity>,
        keys: DaemonKeys,
    ) -> Self {
        Self {
            db,
            registry,
            identity,
            keys,
            collection_auth_keys: HashMap::new(),
            standalone_auth_keys: HashMap::new(),
            collection_relocks: HashMap::new(),
            standalone_relocks: HashMap::new(),
            pending: PendingTable::default(),
        }
    }

    /// Returns snapshots of every loaded plugin.
    pub fn plugin_info(&self) -> PluginInfoReport {
        self.registry.plugin_info()
    }

    /// Names of the loaded storage plugins (crypto shim helper).
    pub fn storage_plugin_names(&self) -> Vec<String> {
        self.registry.storage_plugin_names()
    }

    pub(crate) fn database(&self) -> &SecretsDatabase {
        &self.db
    }

    pub(crate) fn caller_application_id(&self, caller_pid: Pid) -> String {
        self.identity.caller_application_id(caller_pid)
    }

    // ── Shared validation ───────────────────────────────────────────────

    /// Verifies a (storage, encryption) plugin pair names loaded plugins
    /// of the right kinds. Equal names must resolve to an
    /// encrypted-storage plugin; distinct names to a storage plugin and an
    /// encryption plugin respectively.
    pub(crate) fn check_plugin_pair(
        &self,
        storage_plugin: &str,
        encryption_plugin: &str,
    ) -> SecretsResult<()> {
        if storage_plugin == encryption_plugin {
            if !self.registry.has_encrypted_storage(storage_plugin) {
                return Err(Error::InvalidExtensionPlugin(format!(
                    "no such encrypted storage plugin exists: {storage_plugin}"
                )));
            }
            return Ok(());
        }
        if storage_plugin.is_empty() || !self.registry.has_storage(storage_plugin) {
            return Err(Error::InvalidExtensionPlugin(format!(
                "no such storage plugin exists: {storage_plugin}"
            )));
        }
        if encryption_plugin.is_empty() || !self.registry.has_encryption(encryption_plugin) {
            return Err(Error::InvalidExtensionPlugin(format!(
                "no such encryption plugin exists: {encryption_plugin}"
            )));
        }
        Ok(())
    }

    /// Gate applied before starting an authentication flow for a locked
    /// entity: device-lock entities cannot be brokered, the caller must
    /// allow interaction, and application-specific plugins need an
    /// in-process view.
    pub(crate) fn interaction_gate(
        &self,
        uses_device_lock_key: bool,
        authentication_plugin: &str,
        user_interaction: UserInteractionMode,
        ui_service_address: &str,
        locked_entity: &str,
    ) -> SecretsResult<()> {
        if uses_device_lock_key {
            return Err(Error::CollectionIsLocked(format!(
                "{locked_entity} is locked and requires device lock authentication"
            )));
        }
        if user_interaction == UserInteractionMode::Prevent {
            return Err(Error::OperationRequiresUserInteraction(format!(
                "authentication plugin {authentication_plugin} requires user interaction"
            )));
        }
        let plugin = self.registry.authentication(authentication_plugin).ok_or_else(|| {
            Error::InvalidExtensionPlugin(format!(
                "no such authentication plugin exists: {authentication_plugin}"
            ))
        })?;
        if plugin.authentication_type() == AuthenticationType::ApplicationSpecific
            && (user_interaction != UserInteractionMode::InProcess || ui_service_address.is_empty())
        {
            return Err(Error::OperationRequiresInProcessUserInteraction(format!(
                "authentication plugin {authentication_plugin} requires in-process user interaction"
            )));
        }
        Ok(())
    }

    /// Starts the authentication flow and parks the continuation.
    pub(crate) fn park_for_authentication(
        &mut self,
        caller_pid: Pid,
        request_id: RequestId,
        authentication_plugin: &str,
        collection_name: &str,
        secret_name: &str,
        ui_service_address: &str,
        continuation: Continuation,
    ) -> HandlerOutcome {
        let caller_application_id = self.caller_application_id(caller_pid);
        let Some(plugin) = self.registry.authentication_mut(authentication_plugin) else {
            return HandlerOutcome::Complete(Err(Error::InvalidExtensionPlugin(format!(
                "no such authentication plugin exists: {authentication_plugin}"
            ))));
        };
        let prompt = AuthenticationPrompt {
            caller_pid,
            request_id,
            caller_application_id,
            collection_name: collection_name.to_string(),
            secret_name: secret_name.to_string(),
            ui_service_address: ui_service_address.to_string(),
        };
        if let Err(err) = plugin.begin_authentication(prompt) {
            return HandlerOutcome::Complete(Err(err));
        }
        self.pending.park(request_id, caller_pid, continuation);
        HandlerOutcome::Pending
    }

    // ── Encrypted-storage key application ───────────────────────────────

    /// Unlocks an encrypted-storage collection with `key` if it is
    /// currently locked. A wrong key leaves the plugin relocked and fails
    /// with `IncorrectAuthenticationKey`; plugin errors during the
    /// sequence also relock before surfacing.
    pub(crate) fn apply_encrypted_storage_key(
        &mut self,
        plugin_name: &str,
        collection_name: &str,
        key: &[u8],
    ) -> SecretsResult<()> {
        let plugin = self.registry.encrypted_storage_mut(plugin_name).ok_or_else(|| {
            Error::InvalidExtensionPlugin(format!(
                "no such encrypted storage plugin exists: {plugin_name}"
            ))
        })?;
        if !plugin.is_locked(collection_name)? {
            return Ok(());
        }
        if plugin.set_encryption_key(collection_name, key).is_err() {
            let _ = plugin.set_encryption_key(collection_name, &[]);
            return Err(Error::PluginDecryption(format!(
                "unable to decrypt collection {collection_name} with the entered authentication key"
            )));
        }
        match plugin.is_locked(collection_name) {
            Err(_) => {
                let _ = plugin.set_encryption_key(collection_name, &[]);
                Err(Error::PluginDecryption(format!(
                    "unable to check lock state of collection {collection_name} after setting the entered authentication key"
                )))
            }
            Ok(true) => {
                // Still locked after applying the key: the key was wrong.
                let _ = plugin.set_encryption_key(collection_name, &[]);
                Err(Error::IncorrectAuthenticationKey(format!(
                    "the authentication key entered for collection {collection_name} was incorrect"
                )))
            }
            Ok(false) => Ok(()),
        }
    }

    // ── Relock timers ───────────────────────────────────────────────────

    /// Arms the one-shot relock deadline for a timeout-relock collection.
    /// The first unlocking access arms it; later accesses within the
    /// window do not reset it.
    pub(crate) fn arm_collection_relock(
        &mut self,
        collection_name: &str,
        unlock_semantic: UnlockSemantic,
        custom_lock_timeout_ms: u64,
        encrypted_storage_plugin: Option<&str>,
    ) {
        if unlock_semantic != UnlockSemantic::CustomLockTimeoutRelock {
            return;
        }
        if self.collection_relocks.contains_key(collection_name) {
            return;
        }
        self.collection_relocks.insert(
            collection_name.to_string(),
            RelockEntry {
                deadline: Instant::now() + Duration::from_millis(custom_lock_timeout_ms),
                encrypted_storage_plugin: encrypted_storage_plugin.map(str::to_string),
            },
        );
        debug!(collection = collection_name, timeout_ms = custom_lock_timeout_ms, "armed relock timer");
    }

    /// Arms the relock deadline for a timeout-relock standalone secret,
    /// keyed by hashed name.
    pub(crate) fn arm_standalone_relock(
        &mut self,
        hashed_secret_name: &str,
        unlock_semantic: UnlockSemantic,
        custom_lock_timeout_ms: u64,
    ) {
        if unlock_semantic != UnlockSemantic::CustomLockTimeoutRelock {
            return;
        }
        self.standalone_relocks
            .entry(hashed_secret_name.to_string())
            .or_insert_with(|| Instant::now() + Duration::from_millis(custom_lock_timeout_ms));
    }

    /// Drops cached keys whose relock deadline has passed and relocks the
    /// corresponding encrypted-storage collections.
    pub fn purge_expired_locks(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .collection_relocks
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(name, _)| name.clone())
            .collect();
        for name in expired {
            if let Some(entry) = self.collection_relocks.remove(&name) {
                debug!(collection = %name, "relocking collection due to unlock timeout");
                self.collection_auth_keys.remove(&name);
                if let Some(plugin_name) = entry.encrypted_storage_plugin {
                    if let Some(plugin) = self.registry.encrypted_storage_mut(&plugin_name) {
                        let _ = plugin.set_encryption_key(&name, &[]);
                    }
                }
            }
        }
        let expired_standalone: Vec<String> = self
            .standalone_relocks
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(name, _)| name.clone())
            .collect();
        for hashed in expired_standalone {
            debug!("relocking standalone secret due to unlock timeout");
            self.standalone_relocks.remove(&hashed);
            self.standalone_auth_keys.remove(&hashed);
        }
    }

    /// Earliest pending relock deadline, if any.
    pub fn next_lock_deadline(&self) -> Option<Instant> {
        let collection = self.collection_relocks.values().map(|entry| entry.deadline).min();
        let standalone = self.standalone_relocks.values().copied().min();
        match (collection, standalone) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Drops the cached key (and plugin unlock state) immediately after an
    /// access to an access-relock collection.
    pub(crate) fn relock_after_access(
        &mut self,
        collection_name: &str,
        storage_plugin: &str,
        encryption_plugin: &str,
        unlock_semantic: UnlockSemantic,
    ) {
        if unlock_semantic != UnlockSemantic::CustomLockAccessRelock {
            return;
        }
        self.collection_auth_keys.remove(collection_name);
        if storage_plugin == encryption_plugin {
            if let Some(plugin) = self.registry.encrypted_storage_mut(storage_plugin) {
                let _ = plugin.set_encryption_key(collection_name, &[]);
            }
        }
    }

    /// Standalone counterpart of [`relock_after_access`].
    pub(crate) fn relock_standalone_after_access(
        &mut self,
        hashed_secret_name: &str,
        unlock_semantic: UnlockSemantic,
    ) {
        if unlock_semantic == UnlockSemantic::CustomLockAccessRelock {
            self.standalone_auth_keys.remove(hashed_secret_name);
        }
    }

    /// Handles a device-lock event: every cached key for an entity with a
    /// relock-on-device-lock semantic is dropped, and encrypted-storage
    /// collections with such semantics are relocked.
    pub fn device_locked(&mut self) {
        let cached: Vec<String> = self.collection_auth_keys.keys().cloned().collect();
        for name in cached {
            match self.db.collection(&name) {
                Ok(Some(row)) if row.unlock_semantic.relocks_on_device_lock() => {
                    info!(collection = %name, "relocking collection on device lock");
                    self.collection_auth_keys.remove(&name);
                    self.collection_relocks.remove(&name);
                }
                Ok(_) => {}
                Err(err) => warn!(collection = %name, %err, "device-lock relock lookup failed"),
            }
        }
        match self.db.collections_relocking_on_device_lock() {
            Ok(rows) => {
                for row in rows {
                    if row.storage_plugin == row.encryption_plugin {
                        if let Some(plugin) = self.registry.encrypted_storage_mut(&row.storage_plugin)
                        {
                            let _ = plugin.set_encryption_key(&row.name, &[]);
                        }
                    }
                }
            }
            Err(err) => warn!(%err, "device-lock relock query failed"),
        }
        let cached_standalone: Vec<String> = self.standalone_auth_keys.keys().cloned().collect();
        for hashed in cached_standalone {
            match self.db.secret(crate::types::RESERVED_COLLECTION_NAME, &hashed) {
                Ok(Some(row)) if row.unlock_semantic.relocks_on_device_lock() => {
                    self.standalone_auth_keys.remove(&hashed);
                    self.standalone_relocks.remove(&hashed);
                }
                Ok(_) => {}
                Err(err) => warn!(%err, "device-lock relock lookup failed"),
            }
        }
    }

    // ── Compensation ────────────────────────────────────────────────────

    /// Deletes the master collection row written before a failed plugin
    /// call. A failed compensation quarantines the row and surfaces a
    /// composite error.
    pub(crate) fn compensate_collection_insert(
        &mut self,
        collection_name: &str,
        plugin_error: Error,
    ) -> Error {
        match self.db.delete_collection(collection_name) {
            Ok(()) => plugin_error,
            Err(db_error) => {
                warn!(
                    collection = collection_name,
                    %db_error,
                    "compensating collection delete failed; quarantining row"
                );
                self.db
                    .quarantine(QuarantineKind::Collection, collection_name, "");
                db_error.while_compensating(&plugin_error)
            }
        }
    }

    /// Secret-row counterpart of [`compensate_collection_insert`].
    pub(crate) fn compensate_secret_insert(
        &mut self,
        collection_name: &str,
        hashed_secret_name: &str,
        plugin_error: Error,
    ) -> Error {
        match self.db.delete_secret(collection_name, hashed_secret_name) {
            Ok(()) => plugin_error,
            Err(db_error) => {
                warn!(
                    collection = collection_name,
                    %db_error,
                    "compensating secret delete failed; quarantining row"
                );
                self.db
                    .quarantine(QuarantineKind::Secret, collection_name, hashed_secret_name);
                db_error.while_compensating(&plugin_error)
            }
        }
    }

    /// Startup sweep: retries the master-row delete for every quarantined
    /// row.
    pub fn sweep_quarantine(&mut self) {
        let rows = match self.db.quarantined_rows() {
            Ok(rows) => rows,
            Err(err) => {
                warn!(%err, "quarantine sweep query failed");
                return;
            }
        };
        for row in rows {
            let deleted = match row.kind {
                QuarantineKind::Collection => self.db.delete_collection(&row.collection_name),
                QuarantineKind::Secret => self
                    .db
                    .delete_secret(&row.collection_name, &row.hashed_secret_name),
            };
            match deleted {
                Ok(()) => {
                    info!(collection = %row.collection_name, "swept quarantined row");
                    if let Err(err) = self.db.clear_quarantine(&row) {
                        warn!(%err, "unable to clear quarantine marker");
                    }
                }
                Err(err) => warn!(collection = %row.collection_name, %err, "quarantine sweep delete failed"),
            }
        }
    }

    // ── Authentication continuation ─────────────────────────────────────

    /// Resumes the parked request `request_id` with the outcome of its
    /// authentication flow and returns the final request outcome.
    pub(crate) fn resume_authenticated(
        &mut self,
        request_id: RequestId,
        result: SecretsResult<()>,
        authentication_key: &Zeroizing<Vec<u8>>,
    ) -> SecretsResult<ResponseBody> {
        if let Err(err) = result {
            // The flow itself failed; finish the request with that result.
            self.pending.take(request_id);
            return Err(err);
        }
        let Some(parked) = self.pending.take(request_id) else {
            return Err(Error::Unknown(
                "failed to finish unknown pending request".to_string(),
            ));
        };
        let caller_pid = parked.caller_pid;
        let key = authentication_key;
        match parked.continuation {
            Continuation::CreateCustomLockCollection {
                collection_name,
                storage_plugin,
                encryption_plugin,
                authentication_plugin,
                unlock_semantic,
                custom_lock_timeout_ms,
                access_control,
            } => self
                .create_custom_lock_collection_with_key(
                    caller_pid,
                    &collection_name,
                    &storage_plugin,
                    &encryption_plugin,
                    &authentication_plugin,
                    unlock_semantic,
                    custom_lock_timeout_ms,
                    access_control,
                    key,
                )
                .map(|()| ResponseBody::None),
            Continuation::SetCollectionSecret {
                collection_name,
                secret_name,
                secret,
                collection,
            } => self
                .set_collection_secret_with_key(
                    caller_pid,
                    &collection_name,
                    &secret_name,
                    &secret,
                    &collection,
                    Some(key),
                )
                .map(|()| ResponseBody::None),
            Continuation::SetStandaloneCustomLockSecret {
                storage_plugin,
                encryption_plugin,
                authentication_plugin,
                secret_name,
                secret,
                unlock_semantic,
                custom_lock_timeout_ms,
                access_control,
            } => self
                .set_standalone_custom_lock_secret_with_key(
                    caller_pid,
                    &storage_plugin,
                    &encryption_plugin,
                    &authentication_plugin,
                    &secret_name,
                    &secret,
                    unlock_semantic,
                    custom_lock_timeout_ms,
                    access_control,
                    key,
                )
                .map(|()| ResponseBody::None),
            Continuation::GetCollectionSecret {
                collection_name,
                secret_name,
                storage_plugin,
                encryption_plugin,
                unlock_semantic,
                custom_lock_timeout_ms,
            } => self
                .get_collection_secret_with_key(
                    &collection_name,
                    &secret_name,
                    &storage_plugin,
                    &encryption_plugin,
                    unlock_semantic,
                    custom_lock_timeout_ms,
                    Some(key),
                )
                .map(ResponseBody::Secret),
            Continuation::GetStandaloneSecret {
                secret_name,
                storage_plugin,
                encryption_plugin,
                unlock_semantic,
                custom_lock_timeout_ms,
            } => self
                .get_standalone_secret_with_key(
                    &secret_name,
                    &storage_plugin,
                    &encryption_plugin,
                    unlock_semantic,
                    custom_lock_timeout_ms,
                    key,
                )
                .map(ResponseBody::Secret),
            Continuation::DeleteCollectionSecret {
                collection_name,
                secret_name,
            } => self
                .delete_collection_secret_with_key(caller_pid, &collection_name, &secret_name, key)
                .map(|()| ResponseBody::None),
        }
    }

    #[cfg(test)]
    pub(crate) fn has_pending_request(&self, request_id: RequestId) -> bool {
        self.pending.contains(request_id)
    }

    #[cfg(test)]
    pub(crate) fn collection_key_cached(&self, collection_name: &str) -> bool {
        self.collection_auth_keys.contains_key(collection_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticIdentity;

    fn processor() -> RequestProcessor {
        RequestProcessor::new(
            SecretsDatabase::open_in_memory().expect("open database"),
            PluginRegistry::new(true),
            Box::new(StaticIdentity::new().with_application(1, "app-a")),
            DaemonKeys::for_testing(),
        )
    }

    #[test]
    fn test_resume_unknown_request_yields_internal_error() {
        let mut processor = processor();
        let outcome =
            processor.resume_authenticated(99, Ok(()), &Zeroizing::new(b"key".to_vec()));
        match outcome {
            Err(Error::Unknown(message)) => assert!(message.contains("unknown pending request")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_resume_failed_flow_surfaces_flow_error() {
        let mut processor = processor();
        processor.pending.park(
            7,
            1,
            Continuation::DeleteCollectionSecret {
                collection_name: "vault".to_string(),
                secret_name: "pwd".to_string(),
            },
        );
        let outcome = processor.resume_authenticated(
            7,
            Err(Error::OperationRequiresUserInteraction("cancelled".to_string())),
            &Zeroizing::new(Vec::new()),
        );
        match outcome {
            Err(Error::OperationRequiresUserInteraction(_)) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!processor.has_pending_request(7));
    }

    #[test]
    fn test_purge_drops_only_expired_deadlines() {
        let mut processor = processor();
        processor
            .collection_auth_keys
            .insert("stale".to_string(), Zeroizing::new(b"k1".to_vec()));
        processor
            .collection_auth_keys
            .insert("fresh".to_string(), Zeroizing::new(b"k2".to_vec()));
        processor.collection_relocks.insert(
            "stale".to_string(),
            RelockEntry {
                deadline: Instant::now() - Duration::from_millis(10),
                encrypted_storage_plugin: None,
            },
        );
        processor.collection_relocks.insert(
            "fresh".to_string(),
            RelockEntry {
                deadline: Instant::now() + Duration::from_secs(60),
                encrypted_storage_plugin: None,
            },
        );

        processor.purge_expired_locks();
        assert!(!processor.collection_key_cached("stale"));
        assert!(processor.collection_key_cached("fresh"));
        assert!(processor.next_lock_deadline().is_some());
    }

    #[test]
    fn test_relock_timer_is_not_reset_by_later_accesses() {
        let mut processor = processor();
        processor.arm_collection_relock(
            "timed",
            UnlockSemantic::CustomLockTimeoutRelock,
            1_000,
            None,
        );
        let first_deadline = processor.next_lock_deadline().expect("armed");
        processor.arm_collection_relock(
            "timed",
            UnlockSemantic::CustomLockTimeoutRelock,
            1_000_000,
            None,
        );
        assert_eq!(processor.next_lock_deadline(), Some(first_deadline));
    }

    #[test]
    fn test_interaction_gate_ordering() {
        let processor = processor();
        // Device-lock entities fail closed regardless of interaction mode.
        match processor.interaction_gate(true, "auth", UserInteractionMode::System, "", "vault") {
            Err(Error::CollectionIsLocked(_)) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
        // Prevented interaction is reported before plugin lookups.
        match processor.interaction_gate(false, "ghost", UserInteractionMode::Prevent, "", "vault") {
            Err(Error::OperationRequiresUserInteraction(_)) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
        // An unknown authentication plugin is the last gate.
        match processor.interaction_gate(false, "ghost", UserInteractionMode::System, "", "vault") {
            Err(Error::InvalidExtensionPlugin(_)) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
