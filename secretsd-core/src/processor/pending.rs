//! Table of requests parked on an authentication flow.

use std::collections::HashMap;

use crate::database::CollectionRow;
use crate::types::{
    AccessControlMode, CustomLockUnlockSemantic, Pid, RequestId, UnlockSemantic,
};

/// The continuation a parked request resumes into, with the argument
/// tuple captured when it was parked.
///
/// Each variant maps to one `*_with_authentication_key` handler. Keeping
/// the tag and arguments explicit (rather than a boxed closure) keeps the
/// suspension table auditable.
#[derive(Debug)]
pub(crate) enum Continuation {
    CreateCustomLockCollection {
        collection_name: String,
        storage_plugin: String,
        encryption_plugin: String,
        authentication_plugin: String,
        unlock_semantic: CustomLockUnlockSemantic,
        custom_lock_timeout_ms: u64,
        access_control: AccessControlMode,
    },
    SetCollectionSecret {
        collection_name: String,
        secret_name: String,
        secret: Vec<u8>,
        /// Collection attributes captured before the flow started.
        collection: CollectionRow,
    },
    SetStandaloneCustomLockSecret {
        storage_plugin: String,
        encryption_plugin: String,
        authentication_plugin: String,
        secret_name: String,
        secret: Vec<u8>,
        unlock_semantic: CustomLockUnlockSemantic,
        custom_lock_timeout_ms: u64,
        access_control: AccessControlMode,
    },
    GetCollectionSecret {
        collection_name: String,
        secret_name: String,
        storage_plugin: String,
        encryption_plugin: String,
        unlock_semantic: UnlockSemantic,
        custom_lock_timeout_ms: u64,
    },
    GetStandaloneSecret {
        secret_name: String,
        storage_plugin: String,
        encryption_plugin: String,
        unlock_semantic: UnlockSemantic,
        custom_lock_timeout_ms: u64,
    },
    DeleteCollectionSecret {
        collection_name: String,
        secret_name: String,
    },
}

/// One parked request.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub caller_pid: Pid,
    pub continuation: Continuation,
}

/// request id → parked request.
#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    entries: HashMap<RequestId, PendingRequest>,
}

impl PendingTable {
    pub fn park(&mut self, request_id: RequestId, caller_pid: Pid, continuation: Continuation) {
        self.entries.insert(
            request_id,
            PendingRequest {
                caller_pid,
                continuation,
            },
        );
    }

    pub fn take(&mut self, request_id: RequestId) -> Option<PendingRequest> {
        self.entries.remove(&request_id)
    }

    #[cfg(test)]
    pub fn contains(&self, request_id: RequestId) -> bool {
        self.entries.contains_key(&request_id)
    }
}
