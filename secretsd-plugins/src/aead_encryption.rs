//! XChaCha20-Poly1305 encryption plugin.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use secretsd_core::error::{Error, SecretsResult};
use secretsd_core::plugin::{EncryptionPlugin, PluginMetadata};

const NONCE_LEN: usize = 24;
const KEY_CONDITIONING_LABEL: &[u8] = b"secretsd:aead-encryption-key";

/// Symmetric encryption plugin.
///
/// Caller-supplied keys of arbitrary length are conditioned to 256 bits
/// with SHA-256 under a fixed label; payloads are sealed with
/// XChaCha20-Poly1305 and carried as `nonce ‖ ciphertext`.
pub struct AeadEncryptionPlugin {
    name: String,
    test_mode: bool,
}

impl AeadEncryptionPlugin {
    pub fn new(name: &str, test_mode: bool) -> Self {
        Self {
            name: name.to_string(),
            test_mode,
        }
    }

    fn conditioned_key(key: &[u8]) -> Key {
        let mut hasher = Sha256::new();
        hasher.update(KEY_CONDITIONING_LABEL);
        hasher.update(key);
        Key::from(<[u8; 32]>::from(hasher.finalize()))
    }
}

impl PluginMetadata for AeadEncryptionPlugin {
    fn name(&self) -> &str {
        &self.name
    }
    fn is_test_plugin(&self) -> bool {
        self.test_mode
    }
}

impl EncryptionPlugin for AeadEncryptionPlugin {
    fn block_size(&self) -> usize {
        1
    }

    fn encrypt_secret(&self, plaintext: &[u8], key: &[u8]) -> SecretsResult<Vec<u8>> {
        let cipher = XChaCha20Poly1305::new(&Self::conditioned_key(key));
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &[],
                },
            )
            .map_err(|err| Error::PluginOperation(format!("encryption failed: {err}")))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt_secret(&self, ciphertext: &[u8], key: &[u8]) -> SecretsResult<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN {
            return Err(Error::PluginDecryption("ciphertext too short".to_string()));
        }
        let (nonce, payload) = ciphertext.split_at(NONCE_LEN);
        let cipher = XChaCha20Poly1305::new(&Self::conditioned_key(key));
        cipher
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: payload,
                    aad: &[],
                },
            )
            .map_err(|_| Error::PluginDecryption("payload failed authentication".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let plugin = AeadEncryptionPlugin::new("crypt", true);
        let cipher = plugin.encrypt_secret(b"attack at dawn", b"hunter2").expect("encrypt");
        assert_eq!(
            plugin.decrypt_secret(&cipher, b"hunter2").expect("decrypt"),
            b"attack at dawn"
        );
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let plugin = AeadEncryptionPlugin::new("crypt", true);
        let cipher = plugin.encrypt_secret(b"payload", b"right").expect("encrypt");
        match plugin.decrypt_secret(&cipher, b"wrong") {
            Err(Error::PluginDecryption(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let plugin = AeadEncryptionPlugin::new("crypt", true);
        let mut cipher = plugin.encrypt_secret(b"payload", b"key").expect("encrypt");
        let last = cipher.len() - 1;
        cipher[last] ^= 0xFF;
        assert!(plugin.decrypt_secret(&cipher, b"key").is_err());
    }
}
