use data_encoding::BASE32_NOPAD;
use sha1::{Digest, Sha1};

/// Content hash used for cache-busting asset names: the SHA-1 digest of
/// `bytes`, base-32 encoded (RFC 4648 alphabet, lowercase, no padding).
pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha1::digest(bytes);
    BASE32_NOPAD.encode(&digest).to_ascii_lowercase()
}
