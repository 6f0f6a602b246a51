//! Process-lifetime master and device-lock key material.

use std::fs;
use std::path::Path;

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{Error, SecretsResult};

const MASTER_KEY_FILENAME: &str = "master.key";
const DEVICE_LOCK_KEY_FILENAME: &str = "devicelock.key";
const KEY_LEN: usize = 32;

/// A cached authentication key. Zeroised when dropped from a cache.
pub type AuthKey = Zeroizing<Vec<u8>>;

/// The two process-lifetime keys the daemon is initialised with.
///
/// Neither key is ever derived from user input, logged, or included in a
/// reply. The file-backed loader stands in for the platform secure source:
/// keys are read if present, generated and persisted otherwise.
pub struct DaemonKeys {
    master_encryption_key: Zeroizing<Vec<u8>>,
    device_lock_key: Zeroizing<Vec<u8>>,
}

impl DaemonKeys {
    /// Opens (or creates) the key files under `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if a key file cannot be read or written.
    pub fn load(dir: &Path) -> SecretsResult<Self> {
        fs::create_dir_all(dir)
            .map_err(|err| Error::Unknown(format!("unable to create key directory: {err}")))?;
        Ok(Self {
            master_encryption_key: read_or_create_key(&dir.join(MASTER_KEY_FILENAME))?,
            device_lock_key: read_or_create_key(&dir.join(DEVICE_LOCK_KEY_FILENAME))?,
        })
    }

    /// Fixed keys for tests.
    pub fn for_testing() -> Self {
        Self {
            master_encryption_key: Zeroizing::new(vec![0x11; KEY_LEN]),
            device_lock_key: Zeroizing::new(vec![0x22; KEY_LEN]),
        }
    }

    /// The system-wide master encryption key. Treat as sensitive material.
    pub fn master_encryption_key(&self) -> &[u8] {
        &self.master_encryption_key
    }

    /// The device-lock key applied to device-lock protected entities.
    pub fn device_lock_key(&self) -> &[u8] {
        &self.device_lock_key
    }
}

impl std::fmt::Debug for DaemonKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonKeys")
            .field("master_encryption_key", &"[REDACTED]")
            .field("device_lock_key", &"[REDACTED]")
            .finish()
    }
}

fn read_or_create_key(path: &Path) -> SecretsResult<Zeroizing<Vec<u8>>> {
    if path.exists() {
        let bytes = fs::read(path)
            .map_err(|err| Error::Unknown(format!("unable to read key file: {err}")))?;
        if bytes.len() != KEY_LEN {
            return Err(Error::Unknown(format!(
                "key file {} has invalid length {}",
                path.display(),
                bytes.len()
            )));
        }
        Ok(Zeroizing::new(bytes))
    } else {
        let mut key = Zeroizing::new(vec![0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut key);
        fs::write(path, key.as_slice())
            .map_err(|err| Error::Unknown(format!("unable to write key file: {err}")))?;
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_stable_across_loads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = DaemonKeys::load(dir.path()).expect("load");
        let second = DaemonKeys::load(dir.path()).expect("load");
        assert_eq!(first.master_encryption_key(), second.master_encryption_key());
        assert_eq!(first.device_lock_key(), second.device_lock_key());
    }

    #[test]
    fn test_master_and_device_lock_keys_differ() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keys = DaemonKeys::load(dir.path()).expect("load");
        assert_ne!(keys.master_encryption_key(), keys.device_lock_key());
    }

    #[test]
    fn test_debug_redacts_material() {
        let keys = DaemonKeys::for_testing();
        let rendered = format!("{keys:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("17")); // 0x11
    }
}
