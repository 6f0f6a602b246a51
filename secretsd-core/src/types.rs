//! Shared value types: lock semantics, access control, request shapes.

use crate::error::{Error, SecretsResult};
use crate::plugin::PluginInfoReport;

/// OS process id of a calling application.
pub type Pid = u32;

/// Identifier assigned to a queued request.
pub type RequestId = u64;

/// Name of the reserved collection that hosts standalone secrets.
pub const RESERVED_COLLECTION_NAME: &str = "standalone";

/// Authentication plugin name recorded for device-lock protected rows.
pub const DEVICE_LOCK_AUTHENTICATION_PLUGIN_NAME: &str = "device-lock";

/// Returns true if `name` collides with the reserved collection name.
///
/// The comparison is case-insensitive: "Standalone" is just as reserved.
pub fn is_reserved_collection_name(name: &str) -> bool {
    name.eq_ignore_ascii_case(RESERVED_COLLECTION_NAME)
}

/// Whether the daemon may start a user-interaction flow for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserInteractionMode {
    /// Fail rather than interact with the user.
    Prevent,
    /// The system-mediated interaction service may be used.
    System,
    /// The calling application hosts the interaction view in-process.
    InProcess,
}

/// Who may address an entity besides its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessControlMode {
    OwnerOnly,
    SystemMediated,
}

impl AccessControlMode {
    pub fn as_code(self) -> i64 {
        match self {
            AccessControlMode::OwnerOnly => 0,
            AccessControlMode::SystemMediated => 1,
        }
    }

    pub fn from_code(code: i64) -> SecretsResult<Self> {
        match code {
            0 => Ok(AccessControlMode::OwnerOnly),
            1 => Ok(AccessControlMode::SystemMediated),
            other => Err(Error::Unknown(format!("invalid access control code: {other}"))),
        }
    }
}

/// Relock policy for device-lock protected entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceLockUnlockSemantic {
    /// Stay unlocked across device unlock cycles.
    KeepUnlocked,
    /// Relock when the device locks.
    Relock,
}

/// Relock policy for custom-lock protected entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomLockUnlockSemantic {
    KeepUnlocked,
    /// Relock when the device locks.
    DeviceLockRelock,
    /// Relock a fixed interval after the first unlocking access.
    TimeoutRelock,
    /// Relock after every access.
    AccessRelock,
}

/// Unified persistence code covering both lock classes.
///
/// Collections and standalone secret rows store one integer column for the
/// unlock semantic; the device-lock and custom-lock value sets occupy
/// disjoint code ranges so a row's lock class is recoverable from the code
/// alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockSemantic {
    DeviceLockKeepUnlocked,
    DeviceLockRelock,
    CustomLockKeepUnlocked,
    CustomLockDeviceLockRelock,
    CustomLockTimeoutRelock,
    CustomLockAccessRelock,
}

impl UnlockSemantic {
    pub fn as_code(self) -> i64 {
        match self {
            UnlockSemantic::DeviceLockKeepUnlocked => 0,
            UnlockSemantic::DeviceLockRelock => 1,
            UnlockSemantic::CustomLockKeepUnlocked => 10,
            UnlockSemantic::CustomLockDeviceLockRelock => 11,
            UnlockSemantic::CustomLockTimeoutRelock => 12,
            UnlockSemantic::CustomLockAccessRelock => 13,
        }
    }

    pub fn from_code(code: i64) -> SecretsResult<Self> {
        match code {
            0 => Ok(UnlockSemantic::DeviceLockKeepUnlocked),
            1 => Ok(UnlockSemantic::DeviceLockRelock),
            10 => Ok(UnlockSemantic::CustomLockKeepUnlocked),
            11 => Ok(UnlockSemantic::CustomLockDeviceLockRelock),
            12 => Ok(UnlockSemantic::CustomLockTimeoutRelock),
            13 => Ok(UnlockSemantic::CustomLockAccessRelock),
            other => Err(Error::Unknown(format!("invalid unlock semantic code: {other}"))),
        }
    }

    /// True for entities that relock when the device locks.
    pub fn relocks_on_device_lock(self) -> bool {
        matches!(
            self,
            UnlockSemantic::DeviceLockRelock | UnlockSemantic::CustomLockDeviceLockRelock
        )
    }
}

impl From<DeviceLockUnlockSemantic> for UnlockSemantic {
    fn from(semantic: DeviceLockUnlockSemantic) -> Self {
        match semantic {
            DeviceLockUnlockSemantic::KeepUnlocked => UnlockSemantic::DeviceLockKeepUnlocked,
            DeviceLockUnlockSemantic::Relock => UnlockSemantic::DeviceLockRelock,
        }
    }
}

impl From<CustomLockUnlockSemantic> for UnlockSemantic {
    fn from(semantic: CustomLockUnlockSemantic) -> Self {
        match semantic {
            CustomLockUnlockSemantic::KeepUnlocked => UnlockSemantic::CustomLockKeepUnlocked,
            CustomLockUnlockSemantic::DeviceLockRelock => UnlockSemantic::CustomLockDeviceLockRelock,
            CustomLockUnlockSemantic::TimeoutRelock => UnlockSemantic::CustomLockTimeoutRelock,
            CustomLockUnlockSemantic::AccessRelock => UnlockSemantic::CustomLockAccessRelock,
        }
    }
}

/// The request kinds handled by the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    GetPluginInfo,
    CreateDeviceLockCollection,
    CreateCustomLockCollection,
    DeleteCollection,
    SetCollectionSecret,
    SetStandaloneDeviceLockSecret,
    SetStandaloneCustomLockSecret,
    GetCollectionSecret,
    GetStandaloneSecret,
    DeleteCollectionSecret,
    DeleteStandaloneSecret,
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RequestKind::GetPluginInfo => "GetPluginInfo",
            RequestKind::CreateDeviceLockCollection => "CreateDeviceLockCollection",
            RequestKind::CreateCustomLockCollection => "CreateCustomLockCollection",
            RequestKind::DeleteCollection => "DeleteCollection",
            RequestKind::SetCollectionSecret => "SetCollectionSecret",
            RequestKind::SetStandaloneDeviceLockSecret => "SetStandaloneDeviceLockSecret",
            RequestKind::SetStandaloneCustomLockSecret => "SetStandaloneCustomLockSecret",
            RequestKind::GetCollectionSecret => "GetCollectionSecret",
            RequestKind::GetStandaloneSecret => "GetStandaloneSecret",
            RequestKind::DeleteCollectionSecret => "DeleteCollectionSecret",
            RequestKind::DeleteStandaloneSecret => "DeleteStandaloneSecret",
        };
        f.write_str(name)
    }
}

/// Typed argument payload for each request kind.
///
/// The router packages client parameters into one of these before handing
/// the request to the queue; the processor consumes them by value when the
/// request is dispatched.
#[derive(Debug, Clone)]
pub enum RequestArgs {
    GetPluginInfo,
    CreateDeviceLockCollection {
        collection_name: String,
        storage_plugin: String,
        encryption_plugin: String,
        unlock_semantic: DeviceLockUnlockSemantic,
        access_control: AccessControlMode,
    },
    CreateCustomLockCollection {
        collection_name: String,
        storage_plugin: String,
        encryption_plugin: String,
        authentication_plugin: String,
        unlock_semantic: CustomLockUnlockSemantic,
        custom_lock_timeout_ms: u64,
        access_control: AccessControlMode,
        user_interaction: UserInteractionMode,
        ui_service_address: String,
    },
    DeleteCollection {
        collection_name: String,
        user_interaction: UserInteractionMode,
    },
    SetCollectionSecret {
        collection_name: String,
        secret_name: String,
        secret: Vec<u8>,
        user_interaction: UserInteractionMode,
        ui_service_address: String,
    },
    SetStandaloneDeviceLockSecret {
        storage_plugin: String,
        encryption_plugin: String,
        secret_name: String,
        secret: Vec<u8>,
        unlock_semantic: DeviceLockUnlockSemantic,
        access_control: AccessControlMode,
        user_interaction: UserInteractionMode,
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
        user_interaction: UserInteractionMode,
        ui_service_address: String,
    },
    GetCollectionSecret {
        collection_name: String,
        secret_name: String,
        user_interaction: UserInteractionMode,
        ui_service_address: String,
    },
    GetStandaloneSecret {
        secret_name: String,
        user_interaction: UserInteractionMode,
        ui_service_address: String,
    },
    DeleteCollectionSecret {
        collection_name: String,
        secret_name: String,
        user_interaction: UserInteractionMode,
        ui_service_address: String,
    },
    DeleteStandaloneSecret {
        secret_name: String,
        user_interaction: UserInteractionMode,
    },
}

impl RequestArgs {
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestArgs::GetPluginInfo => RequestKind::GetPluginInfo,
            RequestArgs::CreateDeviceLockCollection { .. } => RequestKind::CreateDeviceLockCollection,
            RequestArgs::CreateCustomLockCollection { .. } => RequestKind::CreateCustomLockCollection,
            RequestArgs::DeleteCollection { .. } => RequestKind::DeleteCollection,
            RequestArgs::SetCollectionSecret { .. } => RequestKind::SetCollectionSecret,
            RequestArgs::SetStandaloneDeviceLockSecret { .. } => {
                RequestKind::SetStandaloneDeviceLockSecret
            }
            RequestArgs::SetStandaloneCustomLockSecret { .. } => {
                RequestKind::SetStandaloneCustomLockSecret
            }
            RequestArgs::GetCollectionSecret { .. } => RequestKind::GetCollectionSecret,
            RequestArgs::GetStandaloneSecret { .. } => RequestKind::GetStandaloneSecret,
            RequestArgs::DeleteCollectionSecret { .. } => RequestKind::DeleteCollectionSecret,
            RequestArgs::DeleteStandaloneSecret { .. } => RequestKind::DeleteStandaloneSecret,
        }
    }
}

/// Payload of a completed request.
#[derive(Debug, Clone)]
pub enum ResponseBody {
    /// No payload beyond the result code.
    None,
    /// Clear secret bytes for a Get operation.
    Secret(Vec<u8>),
    /// Plugin info snapshot for GetPluginInfo.
    PluginInfo(PluginInfoReport),
}

/// Reply delivered on a client's reply channel.
#[derive(Debug, Clone)]
pub struct Response {
    pub request_id: RequestId,
    pub result: SecretsResult<ResponseBody>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_name_is_case_insensitive() {
        assert!(is_reserved_collection_name("standalone"));
        assert!(is_reserved_collection_name("Standalone"));
        assert!(is_reserved_collection_name("STANDALONE"));
        assert!(!is_reserved_collection_name("vault"));
    }

    #[test]
    fn test_unlock_semantic_codes_round_trip() {
        for semantic in [
            UnlockSemantic::DeviceLockKeepUnlocked,
            UnlockSemantic::DeviceLockRelock,
            UnlockSemantic::CustomLockKeepUnlocked,
            UnlockSemantic::CustomLockDeviceLockRelock,
            UnlockSemantic::CustomLockTimeoutRelock,
            UnlockSemantic::CustomLockAccessRelock,
        ] {
            assert_eq!(UnlockSemantic::from_code(semantic.as_code()).expect("code"), semantic);
        }
        assert!(UnlockSemantic::from_code(99).is_err());
    }
}
