//! Derivation of the opaque persistence key for secret rows.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::{Digest, Sha256};

const REHASH_ROUNDS: usize = 100;

/// Derives the hashed secret name under which a secret row is persisted.
///
/// The derivation is a pure function of (collection name, clear secret
/// name): SHA-256 over the concatenated UTF-8 names, repeat-hashed for a
/// fixed number of rounds, base64-encoded. Only this value ever reaches the
/// metadata store or a storage plugin; the clear secret name is never
/// persisted.
pub fn hashed_secret_name(collection_name: &str, secret_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(collection_name.as_bytes());
    hasher.update(secret_name.as_bytes());
    let mut hashed = hasher.finalize();

    for _ in 0..REHASH_ROUNDS {
        hashed = Sha256::digest(hashed);
    }

    BASE64.encode(hashed)
}
