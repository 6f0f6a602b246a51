//! Storage helpers for the sibling cryptography subsystem.
//!
//! The crypto daemon persists key material through the same
//! access-controlled pipeline as ordinary secrets, and records which
//! plugins hold each key in the shared `KeyEntries` table so both
//! subsystems operate on one database for atomicity.
//!
//! Known trade-off: key entry rows (collection name, key name, plugin
//! names) are stored in plaintext so identifiers can be listed back to
//! clients. Any key persisted through this path therefore carries a
//! known-plaintext association between its name and its stored material.

use tracing::warn;

use crate::database::KeyEntryIdentifier;
use crate::error::SecretsResult;
use crate::queue::ReplySink;
use crate::service::SecretsService;
use crate::types::{Pid, RequestArgs, ResponseBody, UserInteractionMode};

/// The possibly-asynchronous helper kinds tracked per crypto request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CryptoHelperKind {
    StoreKey,
    StoredKey,
    DeleteStoredKey,
}

/// Completion signals delivered back to the crypto subsystem.
#[derive(Debug)]
pub enum CryptoHelperEvent {
    StoredKeyCompleted {
        crypto_request_id: u64,
        result: SecretsResult<Vec<u8>>,
    },
    StoreKeyCompleted {
        crypto_request_id: u64,
        result: SecretsResult<()>,
    },
    DeleteStoredKeyCompleted {
        crypto_request_id: u64,
        result: SecretsResult<()>,
    },
}

impl SecretsService {
    // ── Synchronous helpers ─────────────────────────────────────────────

    /// Names of the loaded storage plugins.
    pub fn storage_plugin_names(&self, _caller_pid: Pid) -> Vec<String> {
        self.processor.storage_plugin_names()
    }

    /// Lists the identifiers of every stored key entry.
    pub fn key_entry_identifiers(&self, _caller_pid: Pid) -> SecretsResult<Vec<KeyEntryIdentifier>> {
        self.processor.database().key_entry_identifiers()
    }

    /// Looks up the (crypto plugin, storage plugin) pair for a key entry.
    pub fn key_entry(
        &self,
        _caller_pid: Pid,
        identifier: &KeyEntryIdentifier,
    ) -> SecretsResult<Option<(String, String)>> {
        self.processor.database().key_entry(identifier)
    }

    /// Records a key entry.
    pub fn add_key_entry(
        &self,
        _caller_pid: Pid,
        identifier: &KeyEntryIdentifier,
        crypto_plugin: &str,
        storage_plugin: &str,
    ) -> SecretsResult<()> {
        self.processor
            .database()
            .add_key_entry(identifier, crypto_plugin, storage_plugin)
    }

    /// Removes a key entry.
    pub fn remove_key_entry(
        &self,
        _caller_pid: Pid,
        identifier: &KeyEntryIdentifier,
    ) -> SecretsResult<()> {
        self.processor.database().remove_key_entry(identifier)
    }

    // ── Possibly-asynchronous helpers ───────────────────────────────────
    //
    // Each enqueues an internal request with user interaction prevented;
    // the outcome arrives as a CryptoHelperEvent once the request
    // completes. An Ok return only means the request was accepted.

    /// Persists serialised key material as the collection secret named by
    /// `identifier`.
    pub fn store_key(
        &mut self,
        caller_pid: Pid,
        crypto_request_id: u64,
        identifier: &KeyEntryIdentifier,
        serialised_key: &[u8],
    ) -> SecretsResult<()> {
        self.enqueue_crypto_helper(
            caller_pid,
            crypto_request_id,
            CryptoHelperKind::StoreKey,
            RequestArgs::SetCollectionSecret {
                collection_name: identifier.collection_name.clone(),
                secret_name: identifier.key_name.clone(),
                secret: serialised_key.to_vec(),
                user_interaction: UserInteractionMode::Prevent,
                ui_service_address: String::new(),
            },
        )
    }

    /// Retrieves the serialised key material stored for `identifier`.
    pub fn stored_key(
        &mut self,
        caller_pid: Pid,
        crypto_request_id: u64,
        identifier: &KeyEntryIdentifier,
    ) -> SecretsResult<()> {
        self.enqueue_crypto_helper(
            caller_pid,
            crypto_request_id,
            CryptoHelperKind::StoredKey,
            RequestArgs::GetCollectionSecret {
                collection_name: identifier.collection_name.clone(),
                secret_name: identifier.key_name.clone(),
                user_interaction: UserInteractionMode::Prevent,
                ui_service_address: String::new(),
            },
        )
    }

    /// Deletes the key material stored for `identifier`.
    pub fn delete_stored_key(
        &mut self,
        caller_pid: Pid,
        crypto_request_id: u64,
        identifier: &KeyEntryIdentifier,
    ) -> SecretsResult<()> {
        self.enqueue_crypto_helper(
            caller_pid,
            crypto_request_id,
            CryptoHelperKind::DeleteStoredKey,
            RequestArgs::DeleteCollectionSecret {
                collection_name: identifier.collection_name.clone(),
                secret_name: identifier.key_name.clone(),
                user_interaction: UserInteractionMode::Prevent,
                ui_service_address: String::new(),
            },
        )
    }

    fn enqueue_crypto_helper(
        &mut self,
        caller_pid: Pid,
        crypto_request_id: u64,
        kind: CryptoHelperKind,
        args: RequestArgs,
    ) -> SecretsResult<()> {
        self.queue
            .enqueue(caller_pid, args, ReplySink::CryptoHelper { crypto_request_id })?;
        self.crypto_requests.insert(crypto_request_id, kind);
        Ok(())
    }

    /// Completes an internal crypto request: translates the request
    /// outcome into the kind-specific completion event.
    pub(crate) fn asynchronous_crypto_request_completed(
        &mut self,
        crypto_request_id: u64,
        outcome: SecretsResult<ResponseBody>,
    ) {
        let Some(kind) = self.crypto_requests.remove(&crypto_request_id) else {
            warn!(crypto_request_id, "unknown asynchronous secrets request finished for crypto request");
            return;
        };
        let event = match kind {
            CryptoHelperKind::StoredKey => CryptoHelperEvent::StoredKeyCompleted {
                crypto_request_id,
                result: outcome.map(|body| match body {
                    ResponseBody::Secret(bytes) => bytes,
                    _ => Vec::new(),
                }),
            },
            CryptoHelperKind::StoreKey => CryptoHelperEvent::StoreKeyCompleted {
                crypto_request_id,
                result: outcome.map(|_| ()),
            },
            CryptoHelperKind::DeleteStoredKey => CryptoHelperEvent::DeleteStoredKeyCompleted {
                crypto_request_id,
                result: outcome.map(|_| ()),
            },
        };
        if self.crypto_events.send(event).is_err() {
            warn!(crypto_request_id, "crypto subsystem is no longer listening for completions");
        }
    }
}
