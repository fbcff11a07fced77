//! Keyed integrity hashes for session records

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 key over the identifying fields of a session
#[derive(Clone)]
pub struct IntegrityKey {
    mac: HmacSha256,
}

impl IntegrityKey {
    pub fn new(secret: &str) -> Result<Self, hmac::digest::InvalidLength> {
        Ok(Self {
            mac: HmacSha256::new_from_slice(secret.as_bytes())?,
        })
    }

    fn keyed(&self, session_id: &str, user_id: &str, device_fingerprint: &str) -> HmacSha256 {
        let mut mac = self.mac.clone();
        // Length-prefix each field so boundaries cannot shift
        for field in [session_id, user_id, device_fingerprint] {
            mac.update(&(field.len() as u64).to_be_bytes());
            mac.update(field.as_bytes());
        }
        mac
    }

    /// Hex-encoded integrity hash
    pub fn sign(&self, session_id: &str, user_id: &str, device_fingerprint: &str) -> String {
        hex::encode(
            self.keyed(session_id, user_id, device_fingerprint)
                .finalize()
                .into_bytes(),
        )
    }

    /// Constant-time check of a stored hash
    pub fn verify(
        &self,
        session_id: &str,
        user_id: &str,
        device_fingerprint: &str,
        integrity_hash: &str,
    ) -> bool {
        let Ok(provided) = hex::decode(integrity_hash) else {
            return false;
        };
        self.keyed(session_id, user_id, device_fingerprint)
            .verify_slice(&provided)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let key = IntegrityKey::new("secret").unwrap();
        let hash = key.sign("s1", "alice", "fp");
        assert_eq!(hash.len(), 64);
        assert!(key.verify("s1", "alice", "fp", &hash));
    }

    #[test]
    fn test_any_field_change_fails() {
        let key = IntegrityKey::new("secret").unwrap();
        let hash = key.sign("s1", "alice", "fp");
        assert!(!key.verify("s2", "alice", "fp", &hash));
        assert!(!key.verify("s1", "mallory", "fp", &hash));
        assert!(!key.verify("s1", "alice", "fp2", &hash));
        assert!(!key.verify("s1", "alice", "fp", "not-hex"));
    }

    #[test]
    fn test_field_boundaries() {
        let key = IntegrityKey::new("secret").unwrap();
        assert_ne!(key.sign("ab", "c", "fp"), key.sign("a", "bc", "fp"));
    }

    #[test]
    fn test_key_matters() {
        let hash = IntegrityKey::new("one").unwrap().sign("s1", "alice", "fp");
        assert!(!IntegrityKey::new("two").unwrap().verify("s1", "alice", "fp", &hash));
    }
}
