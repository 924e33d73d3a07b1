//! Shared chat keys and their fingerprints.
//!
//! An [`AuthKey`] is the 256-byte result of a completed DH exchange. Both sides
//! derive the same `key_id` from it without ever sending the key:
//!
//! ```text
//! digest = SHA1(key)                       [20 bytes]
//! key_id = u64::from_le_bytes(digest[12..20])
//! ```
//!
//! The id is the low 64 bits of the digest by byte position, so the peer's
//! fingerprint comparison works on any host endianness.

use sha1::{Digest, Sha1};
use sha2::Sha256;
use zeroize::Zeroizing;

/// Length of an auth key produced by a 2048-bit exchange.
pub const AUTH_KEY_SIZE: usize = 256;

/// Length of the key visualization hash.
pub const KEY_HASH_SIZE: usize = 36;

/// Shared symmetric key identified by its SHA-1 fingerprint.
#[derive(Clone)]
pub struct AuthKey {
    id: u64,
    key: Zeroizing<Vec<u8>>,
}

impl AuthKey {
    /// Wraps raw key bytes and computes the key id.
    pub fn new(key: Vec<u8>) -> Self {
        let id = key_id(&key);
        Self {
            id,
            key: Zeroizing::new(key),
        }
    }

    /// Returns an empty key (no key established).
    pub fn empty() -> Self {
        Self {
            id: 0,
            key: Zeroizing::new(Vec::new()),
        }
    }

    /// Whether no key is held.
    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }

    /// Key id (fingerprint) shared by both sides.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Key fingerprint as carried on the wire.
    pub fn fingerprint(&self) -> i64 {
        self.id as i64
    }

    /// Raw key bytes.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Hash shown to users to compare keys out of band.
    ///
    /// `SHA1(key)[0..16] || SHA256(key)[0..20]`
    pub fn key_hash(&self) -> Vec<u8> {
        let sha1 = Sha1::digest(&*self.key);
        let sha256 = Sha256::digest(&*self.key);

        let mut hash = Vec::with_capacity(KEY_HASH_SIZE);
        hash.extend_from_slice(&sha1[..16]);
        hash.extend_from_slice(&sha256[..20]);
        hash
    }
}

impl Default for AuthKey {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for AuthKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.key[..] == other.key[..]
    }
}

impl Eq for AuthKey {}

impl core::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AuthKey")
            .field("id", &format_args!("{:#018x}", self.id))
            .field("len", &self.key.len())
            .finish()
    }
}

/// Computes the key id of raw key bytes.
pub fn key_id(key: &[u8]) -> u64 {
    let digest = Sha1::digest(key);
    let mut low = [0u8; 8];
    low.copy_from_slice(&digest[12..20]);
    u64::from_le_bytes(low)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_id_uses_trailing_digest_bytes() {
        // SHA1("abc") = a9993e364706816aba3e25717850c26c9cd0d89d
        let id = key_id(b"abc");
        let expected = u64::from_le_bytes(hex::decode("7850c26c9cd0d89d").unwrap().try_into().unwrap());
        assert_eq!(id, expected);
    }

    #[test]
    fn test_key_hash_layout() {
        let key = AuthKey::new(vec![7u8; AUTH_KEY_SIZE]);
        let hash = key.key_hash();

        assert_eq!(hash.len(), KEY_HASH_SIZE);
        assert_eq!(&hash[..16], &Sha1::digest([7u8; AUTH_KEY_SIZE])[..16]);
        assert_eq!(&hash[16..], &Sha256::digest([7u8; AUTH_KEY_SIZE])[..20]);
    }

    #[test]
    fn test_empty_key() {
        let key = AuthKey::empty();
        assert!(key.is_empty());
        assert_eq!(key.id(), 0);
        assert_eq!(key, AuthKey::default());
    }

    #[test]
    fn test_debug_hides_key_material() {
        let key = AuthKey::new(vec![0xAB; AUTH_KEY_SIZE]);
        let rendered = format!("{:?}", key);
        assert!(!rendered.contains("[171"));
        assert!(rendered.contains("len: 256"));
    }
}
