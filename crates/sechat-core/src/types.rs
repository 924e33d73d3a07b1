//! Identifiers and file descriptors shared across the protocol.

use crate::codec::{Reader, Writer};
use crate::Result;

/// Identifier of one secret chat, shared by both peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ChatId(pub i32);

impl core::fmt::Display for ChatId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct UserId(pub i64);

/// Encrypted file stored on the server, received with a message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncryptedFile {
    /// Server file id.
    pub id: i64,
    /// Access hash of the file.
    pub access_hash: i64,
    /// Size in bytes.
    pub size: i64,
    /// Storage location.
    pub dc_id: i32,
    /// Fingerprint of the file key.
    pub key_fingerprint: i32,
}

impl EncryptedFile {
    pub(crate) fn serialize_into(&self, w: &mut Writer) {
        w.put_i64(self.id);
        w.put_i64(self.access_hash);
        w.put_i64(self.size);
        w.put_i32(self.dc_id);
        w.put_i32(self.key_fingerprint);
    }

    pub(crate) fn parse_from(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            id: r.get_i64()?,
            access_hash: r.get_i64()?,
            size: r.get_i64()?,
            dc_id: r.get_i32()?,
            key_fingerprint: r.get_i32()?,
        })
    }
}

/// File attached to an outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InputEncryptedFile {
    /// Uploaded or existing file id.
    pub id: i64,
    /// Part count for uploads, 0 for an existing file.
    pub parts: i32,
    /// Access hash for an existing file.
    pub access_hash: i64,
    /// Fingerprint of the file key.
    pub key_fingerprint: i32,
}

impl InputEncryptedFile {
    pub(crate) fn serialize_into(&self, w: &mut Writer) {
        w.put_i64(self.id);
        w.put_i32(self.parts);
        w.put_i64(self.access_hash);
        w.put_i32(self.key_fingerprint);
    }

    pub(crate) fn parse_from(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            id: r.get_i64()?,
            parts: r.get_i32()?,
            access_hash: r.get_i64()?,
            key_fingerprint: r.get_i32()?,
        })
    }
}
