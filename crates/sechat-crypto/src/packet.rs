//! Encrypted packet framing for chat messages.
//!
//! ## Structure
//!
//! ```text
//! packet
//! ┌──────────────────────────────────────────────────────────┐
//! │ auth_key_id: u64 LE                         [8 bytes]    │
//! │ msg_key                                     [16 bytes]   │
//! │ AES-256-GCM(plaintext) || tag               [n + 16]     │
//! └──────────────────────────────────────────────────────────┘
//! plaintext = payload_len: u32 LE || payload || padding
//! padding   = 12..=1024 random bytes, plaintext length a multiple of 16
//! msg_key   = SHA256(auth_key[88+x .. 120+x] || plaintext)[8..24]
//! ```
//!
//! `x` is 0 for packets sent by the chat creator and 8 for packets sent by the
//! acceptor, so the two directions never share a message key. The cipher key
//! and nonce come from [`derive_packet_key`] over `auth_key[x .. x+64]`.
//! The key id and message key are authenticated as associated data.

use crate::auth_key::{AuthKey, AUTH_KEY_SIZE};
use crate::kdf::derive_packet_key;
use crate::{Error, Result};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// Size of the auth key id prefix.
pub const AUTH_KEY_ID_SIZE: usize = 8;

/// Size of the message key.
pub const MSG_KEY_SIZE: usize = 16;

const TAG_SIZE: usize = 16;
const LEN_PREFIX_SIZE: usize = 4;
const MIN_PADDING: usize = 12;
const MAX_PADDING: usize = 1024;
const HEADER_SIZE: usize = AUTH_KEY_ID_SIZE + MSG_KEY_SIZE;

/// Reads the auth key id a packet was encrypted with.
///
/// # Errors
/// Returns `Error::InvalidLength` if the packet is shorter than the id.
pub fn read_auth_key_id(packet: &[u8]) -> Result<u64> {
    if packet.len() < AUTH_KEY_ID_SIZE {
        return Err(Error::InvalidLength {
            expected: AUTH_KEY_ID_SIZE,
            actual: packet.len(),
        });
    }
    let mut id = [0u8; AUTH_KEY_ID_SIZE];
    id.copy_from_slice(&packet[..AUTH_KEY_ID_SIZE]);
    Ok(u64::from_le_bytes(id))
}

/// Encrypts a payload.
///
/// # Arguments
/// * `auth_key` - Current chat key
/// * `payload` - Serialized message layer
/// * `from_creator` - Whether the sender created the chat
///
/// # Errors
/// Returns an error if the key is not a full 256-byte key or encryption fails.
pub fn encrypt_packet(auth_key: &AuthKey, payload: &[u8], from_creator: bool) -> Result<Vec<u8>> {
    check_key(auth_key)?;
    let x = side_offset(from_creator);

    let unpadded = LEN_PREFIX_SIZE + payload.len() + MIN_PADDING;
    let padding = MIN_PADDING + (16 - unpadded % 16) % 16 + 16 * (OsRng.next_u32() % 8) as usize;

    let mut plaintext = Zeroizing::new(Vec::with_capacity(unpadded + padding));
    plaintext.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    plaintext.extend_from_slice(payload);
    let mut pad = vec![0u8; padding];
    OsRng.fill_bytes(&mut pad);
    plaintext.extend_from_slice(&pad);

    let msg_key = compute_msg_key(auth_key, &plaintext, x);
    let packet_key = derive_packet_key(&auth_key.key()[x..x + 64], &msg_key)?;

    let mut packet = Vec::with_capacity(HEADER_SIZE + plaintext.len() + TAG_SIZE);
    packet.extend_from_slice(&auth_key.id().to_le_bytes());
    packet.extend_from_slice(&msg_key);

    let cipher = Aes256Gcm::new_from_slice(&*packet_key.key)
        .map_err(|_| Error::Encryption("invalid AES-256-GCM key length".into()))?;
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&packet_key.nonce),
            Payload {
                msg: &plaintext,
                aad: &packet[..HEADER_SIZE],
            },
        )
        .map_err(|_| Error::Encryption("AES-256-GCM encryption failed".into()))?;

    packet.extend_from_slice(&ciphertext);
    Ok(packet)
}

/// Decrypts a packet and returns the payload.
///
/// # Arguments
/// * `auth_key` - Key whose id matches the packet prefix
/// * `packet` - Encrypted packet
/// * `from_creator` - Whether the sender created the chat
///
/// # Errors
/// Returns `Error::Decryption` on a key id mismatch, failed authentication, a
/// message key that does not match the plaintext, or malformed padding.
pub fn decrypt_packet(
    auth_key: &AuthKey,
    packet: &[u8],
    from_creator: bool,
) -> Result<Zeroizing<Vec<u8>>> {
    check_key(auth_key)?;
    let min_len = HEADER_SIZE + LEN_PREFIX_SIZE + MIN_PADDING + TAG_SIZE;
    if packet.len() < min_len {
        return Err(Error::InvalidLength {
            expected: min_len,
            actual: packet.len(),
        });
    }
    if read_auth_key_id(packet)? != auth_key.id() {
        return Err(Error::Decryption("auth key id mismatch".into()));
    }

    let x = side_offset(from_creator);
    let msg_key = &packet[AUTH_KEY_ID_SIZE..HEADER_SIZE];
    let packet_key = derive_packet_key(&auth_key.key()[x..x + 64], msg_key)?;

    let cipher = Aes256Gcm::new_from_slice(&*packet_key.key)
        .map_err(|_| Error::Decryption("invalid AES-256-GCM key length".into()))?;
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(
                Nonce::from_slice(&packet_key.nonce),
                Payload {
                    msg: &packet[HEADER_SIZE..],
                    aad: &packet[..HEADER_SIZE],
                },
            )
            .map_err(|_| Error::Decryption("AES-256-GCM authentication failed".into()))?,
    );

    let expected = compute_msg_key(auth_key, &plaintext, x);
    if !bool::from(expected[..].ct_eq(msg_key)) {
        return Err(Error::Decryption("msg_key mismatch".into()));
    }

    if plaintext.len() % 16 != 0 {
        return Err(Error::Decryption("plaintext is not block aligned".into()));
    }
    let mut len = [0u8; LEN_PREFIX_SIZE];
    len.copy_from_slice(&plaintext[..LEN_PREFIX_SIZE]);
    let len = u32::from_le_bytes(len) as usize;
    let padding = plaintext
        .len()
        .checked_sub(LEN_PREFIX_SIZE + len)
        .ok_or_else(|| Error::Decryption("payload length exceeds packet".into()))?;
    if !(MIN_PADDING..=MAX_PADDING).contains(&padding) {
        return Err(Error::Decryption(format!("invalid padding length {}", padding)));
    }

    Ok(Zeroizing::new(
        plaintext[LEN_PREFIX_SIZE..LEN_PREFIX_SIZE + len].to_vec(),
    ))
}

fn check_key(auth_key: &AuthKey) -> Result<()> {
    if auth_key.key().len() != AUTH_KEY_SIZE {
        return Err(Error::InvalidLength {
            expected: AUTH_KEY_SIZE,
            actual: auth_key.key().len(),
        });
    }
    Ok(())
}

fn side_offset(from_creator: bool) -> usize {
    if from_creator {
        0
    } else {
        8
    }
}

fn compute_msg_key(auth_key: &AuthKey, plaintext: &[u8], x: usize) -> [u8; MSG_KEY_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(&auth_key.key()[88 + x..120 + x]);
    hasher.update(plaintext);
    let digest = hasher.finalize();

    let mut msg_key = [0u8; MSG_KEY_SIZE];
    msg_key.copy_from_slice(&digest[8..24]);
    msg_key
}
