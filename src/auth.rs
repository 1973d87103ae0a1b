use sha2::{Digest, Sha256};

/// Hash a bearer token the way session rows store it (SHA-256 hex).
/// Raw tokens never touch the database.
pub fn hash_access_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let out = hasher.finalize();
    hex::encode(out)
}
