//! Error types for the secrets daemon core.

use thiserror::Error;

/// Result type for daemon core operations.
pub type SecretsResult<T> = Result<T, Error>;

/// Errors raised by the daemon core and surfaced to clients.
///
/// A successful call maps to `Ok`; every failure carries one of the codes
/// below. "Pending" is deliberately not represented here: a parked request
/// is a handler outcome tracked by the queue, never a client-visible result.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// The named collection is invalid (empty, reserved, or nonexistent).
    #[error("invalid collection: {0}")]
    InvalidCollection(String),

    /// The named secret is invalid (empty or nonexistent).
    #[error("invalid secret: {0}")]
    InvalidSecret(String),

    /// A named extension plugin is not loaded or is of the wrong kind.
    #[error("invalid extension plugin: {0}")]
    InvalidExtensionPlugin(String),

    /// A collection with the given name already exists.
    #[error("collection already exists: {0}")]
    CollectionAlreadyExists(String),

    /// The collection (or standalone secret) is locked and the lock cannot
    /// be brokered by the daemon (device-lock entities), or a plugin refused
    /// an operation on a locked collection.
    #[error("collection is locked: {0}")]
    CollectionIsLocked(String),

    /// The caller does not own the addressed entity.
    #[error("permission denied: {0}")]
    Permissions(String),

    /// The requested operation is not supported for the addressed entity.
    #[error("operation not supported: {0}")]
    OperationNotSupported(String),

    /// The operation needs a user-interaction flow but the caller prevented
    /// user interaction.
    #[error("operation requires user interaction: {0}")]
    OperationRequiresUserInteraction(String),

    /// The authentication plugin requires an in-process user-interaction
    /// flow which the caller did not offer.
    #[error("operation requires in-process user interaction: {0}")]
    OperationRequiresInProcessUserInteraction(String),

    /// The supplied authentication key failed verification.
    #[error("incorrect authentication key: {0}")]
    IncorrectAuthenticationKey(String),

    /// A plugin failed to decrypt data or verify lock state.
    #[error("plugin decryption error: {0}")]
    PluginDecryption(String),

    /// Preparing or executing a database query failed.
    #[error("database query error: {0}")]
    DatabaseQuery(String),

    /// Beginning or committing a database transaction failed.
    #[error("database transaction error: {0}")]
    DatabaseTransaction(String),

    /// The request queue has no free request ids.
    #[error("request queue is full, try again later")]
    RequestQueueFull,

    /// A plugin operation failed without a more specific code.
    #[error("plugin operation failed: {0}")]
    PluginOperation(String),

    /// Internal invariant violation (missing continuation, unreachable
    /// default, and the like).
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl Error {
    /// Composes a compensating-delete failure with the plugin error that
    /// triggered the compensation, preserving the database error code.
    pub(crate) fn while_compensating(self, plugin_error: &Error) -> Error {
        let compose = |message: String| {
            format!("{message} while removing artifacts due to plugin operation failure: {plugin_error}")
        };
        match self {
            Error::DatabaseQuery(message) => Error::DatabaseQuery(compose(message)),
            Error::DatabaseTransaction(message) => Error::DatabaseTransaction(compose(message)),
            other => other,
        }
    }
}

/// Maps a rusqlite error to the query-error code.
pub(crate) fn map_query_err(err: &rusqlite::Error) -> Error {
    Error::DatabaseQuery(err.to_string())
}

/// Maps a rusqlite error to the transaction-error code.
pub(crate) fn map_tx_err(err: &rusqlite::Error) -> Error {
    Error::DatabaseTransaction(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compensation_error_keeps_db_code_and_plugin_message() {
        let plugin_err = Error::PluginOperation("disk full".to_string());
        let composed =
            Error::DatabaseQuery("unable to execute delete".to_string()).while_compensating(&plugin_err);
        match composed {
            Error::DatabaseQuery(message) => {
                assert!(message.contains("unable to execute delete"));
                assert!(message.contains("disk full"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
