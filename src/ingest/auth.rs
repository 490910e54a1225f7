use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Lowercase hex `HMAC-SHA256(secret, topic)`, the hash a caller puts in the
/// ingestion path.
pub fn topic_signature(secret: &str, topic: &str) -> Result<String, InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())?;
    mac.update(topic.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a caller-supplied hex hash.
pub fn verify_topic_signature(secret: &str, topic: &str, hash: &str) -> bool {
    let Ok(expected) = hex::decode(hash) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(topic.as_bytes());
    mac.verify_slice(&expected).is_ok()
}
