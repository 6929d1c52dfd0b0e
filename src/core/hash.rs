use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use sha2::{Digest, Sha512};

/// Length of identity hashes such as `calc_hash`
pub const DEFAULT_HASH_LEN: usize = 28;

/// Web-safe content hash: SHA-512, base64 with `-`/`_`, truncated
pub fn hash(input: &str) -> String {
    hash_with_len(input, DEFAULT_HASH_LEN)
}

pub fn hash_with_len(input: &str, length: usize) -> String {
    let digest = Sha512::digest(input.as_bytes());
    let mut encoded = URL_SAFE.encode(digest);
    if length > 0 {
        encoded.truncate(length);
    }
    encoded
}
