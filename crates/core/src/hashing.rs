//! SHA-256 hex digest used to name uploaded images by content.

use sha2::{Digest, Sha256};

/// Compute a SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Short content-derived name stem, e.g. `genrelay_9f86d081884c7d65`.
pub fn content_name_stem(data: &[u8]) -> String {
    let digest = sha256_hex(data);
    format!("genrelay_{}", &digest[..16])
}
