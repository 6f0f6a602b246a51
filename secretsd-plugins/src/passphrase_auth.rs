//! Passphrase-based authentication plugins.
//!
//! Stand-ins for the device dialog: `begin_authentication` resolves
//! immediately by sending a completion carrying a key derived from the
//! configured passphrase. The daemon still observes the full park/resume
//! cycle because completions arrive over the authentication channel.

use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use secretsd_core::error::SecretsResult;
use secretsd_core::plugin::{
    AuthenticationCompleted, AuthenticationPlugin, AuthenticationPrompt, AuthenticationSink,
    AuthenticationType, PluginMetadata,
};

const KEY_DERIVATION_LABEL: &[u8] = b"secretsd:passphrase-auth-key";

/// Authentication plugin deriving keys from a configured passphrase.
pub struct PassphraseAuthPlugin {
    name: String,
    test_mode: bool,
    authentication_type: AuthenticationType,
    sink: AuthenticationSink,
    passphrase: Zeroizing<Vec<u8>>,
}

impl PassphraseAuthPlugin {
    /// System-mediated variant.
    pub fn new(name: &str, sink: AuthenticationSink, passphrase: &[u8], test_mode: bool) -> Self {
        Self {
            name: name.to_string(),
            test_mode,
            authentication_type: AuthenticationType::System,
            sink,
            passphrase: Zeroizing::new(passphrase.to_vec()),
        }
    }

    /// Application-specific variant: callers must offer an in-process
    /// interaction view.
    pub fn application_specific(
        name: &str,
        sink: AuthenticationSink,
        passphrase: &[u8],
        test_mode: bool,
    ) -> Self {
        Self {
            authentication_type: AuthenticationType::ApplicationSpecific,
            ..Self::new(name, sink, passphrase, test_mode)
        }
    }

    fn derive_key(&self, prompt: &AuthenticationPrompt) -> Zeroizing<Vec<u8>> {
        // Per-entity key: the same passphrase unlocks different entities
        // with different material.
        let mut hasher = Sha256::new();
        hasher.update(KEY_DERIVATION_LABEL);
        hasher.update(self.passphrase.as_slice());
        hasher.update(prompt.collection_name.as_bytes());
        Zeroizing::new(hasher.finalize().to_vec())
    }
}

impl PluginMetadata for PassphraseAuthPlugin {
    fn name(&self) -> &str {
        &self.name
    }
    fn is_test_plugin(&self) -> bool {
        self.test_mode
    }
}

impl AuthenticationPlugin for PassphraseAuthPlugin {
    fn authentication_type(&self) -> AuthenticationType {
        self.authentication_type
    }

    fn begin_authentication(&mut self, prompt: AuthenticationPrompt) -> SecretsResult<()> {
        let authentication_key = self.derive_key(&prompt);
        self.sink.complete(AuthenticationCompleted {
            request_id: prompt.request_id,
            result: Ok(()),
            authentication_key,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_carries_derived_key() {
        let (sink, mut rx) = AuthenticationSink::channel();
        let mut plugin = PassphraseAuthPlugin::new("auth", sink, b"hunter2", true);
        plugin
            .begin_authentication(AuthenticationPrompt {
                caller_pid: 1,
                request_id: 5,
                caller_application_id: "app".to_string(),
                collection_name: "vault".to_string(),
                secret_name: String::new(),
                ui_service_address: String::new(),
            })
            .expect("begin");
        let completion = rx.try_recv().expect("completion");
        assert_eq!(completion.request_id, 5);
        assert!(completion.result.is_ok());
        assert_eq!(completion.authentication_key.len(), 32);
    }

    #[test]
    fn test_key_is_stable_per_entity() {
        let (sink, mut rx) = AuthenticationSink::channel();
        let mut plugin = PassphraseAuthPlugin::new("auth", sink, b"hunter2", true);
        let prompt = AuthenticationPrompt {
            caller_pid: 1,
            request_id: 1,
            caller_application_id: "app".to_string(),
            collection_name: "vault".to_string(),
            secret_name: String::new(),
            ui_service_address: String::new(),
        };
        plugin.begin_authentication(prompt.clone()).expect("begin");
        plugin
            .begin_authentication(AuthenticationPrompt {
                request_id: 2,
                ..prompt.clone()
            })
            .expect("begin");
        plugin
            .begin_authentication(AuthenticationPrompt {
                request_id: 3,
                collection_name: "other".to_string(),
                ..prompt
            })
            .expect("begin");
        let first = rx.try_recv().expect("first");
        let second = rx.try_recv().expect("second");
        let third = rx.try_recv().expect("third");
        assert_eq!(*first.authentication_key, *second.authentication_key);
        assert_ne!(*first.authentication_key, *third.authentication_key);
    }
}
