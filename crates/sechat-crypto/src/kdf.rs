//! Key derivation (HKDF-SHA256) for packet keys.

use crate::{Error, Result};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

/// Label mixed into every packet key derivation.
const PACKET_KEY_INFO: &[u8] = b"sechat-packet-key";

/// Generic HKDF-SHA256 key derivation per RFC 5869.
///
/// # Arguments
/// * `ikm` - Input key material
/// * `salt` - Salt value (empty slice for no salt)
/// * `info` - Context and application-specific information
/// * `output_len` - Length of output key material
///
/// # Example
/// ```
/// use sechat_crypto::kdf::hkdf_sha256;
///
/// let okm = hkdf_sha256(&[0x0b; 22], b"salt", b"info", 42).unwrap();
/// assert_eq!(okm.len(), 42);
/// ```
pub fn hkdf_sha256(
    ikm: &[u8],
    salt: &[u8],
    info: &[u8],
    output_len: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);

    let mut okm = vec![0u8; output_len];
    hk.expand(info, &mut okm)
        .map_err(|_| Error::KeyDerivation("HKDF expansion failed".into()))?;

    Ok(Zeroizing::new(okm))
}

/// AES-256-GCM key and nonce for one packet.
pub struct PacketKey {
    /// 32-byte cipher key.
    pub key: Zeroizing<[u8; 32]>,
    /// 12-byte nonce.
    pub nonce: [u8; 12],
}

/// Derive the cipher key and nonce for one packet.
///
/// Uses HKDF-SHA256 with:
/// - IKM: a 64-byte window of the auth key selected by the sender side
/// - Salt: the 16-byte message key
/// - Info: "sechat-packet-key"
/// - Length: 44 bytes (32 key + 12 nonce)
///
/// The message key is a hash over the plaintext, so every packet gets a fresh nonce.
pub fn derive_packet_key(key_window: &[u8], msg_key: &[u8]) -> Result<PacketKey> {
    let okm = hkdf_sha256(key_window, msg_key, PACKET_KEY_INFO, 44)?;

    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&okm[..32]);
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&okm[32..44]);

    Ok(PacketKey { key, nonce })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hkdf_rfc5869_case1() {
        // RFC 5869 Test Case 1
        let ikm = [0x0bu8; 22];
        let salt = hex::decode("000102030405060708090a0b0c").unwrap();
        let info = hex::decode("f0f1f2f3f4f5f6f7f8f9").unwrap();

        let okm = hkdf_sha256(&ikm, &salt, &info, 42).unwrap();

        assert_eq!(
            hex::encode(&*okm),
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865"
        );
    }

    #[test]
    fn test_packet_key_depends_on_msg_key() {
        let window = [0x42u8; 64];
        let a = derive_packet_key(&window, &[1u8; 16]).unwrap();
        let b = derive_packet_key(&window, &[2u8; 16]).unwrap();

        assert_ne!(*a.key, *b.key);
        assert_ne!(a.nonce, b.nonce);
    }
}
