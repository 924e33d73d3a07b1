//! Decrypted message envelopes and service actions.
//!
//! Every packet payload is a [`MessageLayer`]: the negotiated layer, both
//! sequence numbers and one message. Messages are either user content or a
//! service [`Action`]. All integers are little-endian.
//!
//! ```text
//! MessageLayer
//!   magic: u32 = "SCLY"
//!   random_bytes: bytes (>= 15)
//!   layer: i32
//!   in_seq_no: i32
//!   out_seq_no: i32
//!   message: Content | Service
//!
//! Content: magic "SCMG", random_id i64, ttl i32, text string, media bytes,
//!          reply_to_random_id i64, silent bool
//! Service: magic "SCSV", random_id i64, action_type u8, action fields
//! ```

use crate::codec::{Reader, Writer};
use crate::{Error, Result};
use rand::rngs::OsRng;
use rand::RngCore;

/// Layer assumed for a peer that never announced one.
pub const LAYER_INITIAL: i32 = 8;
/// Lowest layer this engine speaks.
pub const LAYER_DEFAULT: i32 = 46;
/// Layer this engine announces.
pub const LAYER_CURRENT: i32 = 144;

/// Magic number for MessageLayer (0x53434C59 = "SCLY").
pub const MAGIC_MESSAGE_LAYER: u32 = 0x5343_4C59;
/// Magic number for content messages (0x53434D47 = "SCMG").
pub const MAGIC_CONTENT: u32 = 0x5343_4D47;
/// Magic number for service messages (0x53435356 = "SCSV").
pub const MAGIC_SERVICE: u32 = 0x5343_5356;

/// Type identifier for SetTtl (0x01).
pub const ACTION_SET_TTL: u8 = 0x01;
/// Type identifier for ReadMessages (0x02).
pub const ACTION_READ_MESSAGES: u8 = 0x02;
/// Type identifier for DeleteMessages (0x03).
pub const ACTION_DELETE_MESSAGES: u8 = 0x03;
/// Type identifier for ScreenshotMessages (0x04).
pub const ACTION_SCREENSHOT_MESSAGES: u8 = 0x04;
/// Type identifier for FlushHistory (0x05).
pub const ACTION_FLUSH_HISTORY: u8 = 0x05;
/// Type identifier for Resend (0x06).
pub const ACTION_RESEND: u8 = 0x06;
/// Type identifier for NotifyLayer (0x07).
pub const ACTION_NOTIFY_LAYER: u8 = 0x07;
/// Type identifier for Typing (0x08).
pub const ACTION_TYPING: u8 = 0x08;
/// Type identifier for RequestKey (0x10).
pub const ACTION_REQUEST_KEY: u8 = 0x10;
/// Type identifier for AcceptKey (0x11).
pub const ACTION_ACCEPT_KEY: u8 = 0x11;
/// Type identifier for AbortKey (0x12).
pub const ACTION_ABORT_KEY: u8 = 0x12;
/// Type identifier for CommitKey (0x13).
pub const ACTION_COMMIT_KEY: u8 = 0x13;
/// Type identifier for Noop (0x14).
pub const ACTION_NOOP: u8 = 0x14;

/// Minimum random prefix carried by every envelope.
pub const MIN_RANDOM_BYTES: usize = 15;

const RANDOM_BYTES: usize = 16;

/// Layer both sides can speak given the peer's announced layer.
pub fn current_layer(his_layer: i32) -> i32 {
    his_layer.min(LAYER_CURRENT).max(LAYER_DEFAULT)
}

/// Service actions carried inside a chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Set the self-destruct timer of new messages.
    SetTtl {
        /// Timer in seconds, 0 disables it.
        ttl_seconds: i32,
    },
    /// Peer read these messages.
    ReadMessages {
        /// Random ids of the read messages.
        random_ids: Vec<i64>,
    },
    /// Delete these messages on both sides.
    DeleteMessages {
        /// Random ids of the deleted messages.
        random_ids: Vec<i64>,
    },
    /// Peer took a screenshot of these messages.
    ScreenshotMessages {
        /// Random ids of the captured messages.
        random_ids: Vec<i64>,
    },
    /// Clear the chat history.
    FlushHistory,
    /// Ask the peer to send again its messages in a range.
    Resend {
        /// First out_seq_no to resend.
        start_seq_no: i32,
        /// Last out_seq_no to resend.
        end_seq_no: i32,
    },
    /// Announce the sender's layer.
    NotifyLayer {
        /// Sender's layer.
        layer: i32,
    },
    /// Typing indicator.
    Typing {
        /// Whether the peer is typing.
        typing: bool,
    },
    /// Start a forward-secrecy exchange.
    RequestKey {
        /// Exchange identifier.
        exchange_id: i64,
        /// Initiator's public value.
        g_a: Vec<u8>,
    },
    /// Answer a forward-secrecy exchange.
    AcceptKey {
        /// Exchange identifier.
        exchange_id: i64,
        /// Responder's public value.
        g_b: Vec<u8>,
        /// Fingerprint of the new key.
        key_fingerprint: i64,
    },
    /// Abandon a forward-secrecy exchange.
    AbortKey {
        /// Exchange identifier.
        exchange_id: i64,
    },
    /// Switch to the new key.
    CommitKey {
        /// Exchange identifier.
        exchange_id: i64,
        /// Fingerprint of the new key.
        key_fingerprint: i64,
    },
    /// Does nothing; fills a sequence slot.
    Noop,
}

impl Action {
    /// Lowest layer able to carry this action.
    pub fn min_layer(&self) -> i32 {
        match self {
            Action::SetTtl { .. }
            | Action::ReadMessages { .. }
            | Action::DeleteMessages { .. }
            | Action::ScreenshotMessages { .. }
            | Action::FlushHistory => LAYER_INITIAL,
            Action::Resend { .. } | Action::NotifyLayer { .. } | Action::Typing { .. } => 17,
            Action::RequestKey { .. }
            | Action::AcceptKey { .. }
            | Action::AbortKey { .. }
            | Action::CommitKey { .. }
            | Action::Noop => 20,
        }
    }

    /// Whether this action belongs to the forward-secrecy exchange.
    pub fn is_pfs(&self) -> bool {
        matches!(
            self,
            Action::RequestKey { .. }
                | Action::AcceptKey { .. }
                | Action::AbortKey { .. }
                | Action::CommitKey { .. }
                | Action::Noop
        )
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Action::SetTtl { .. } => "SetTtl",
            Action::ReadMessages { .. } => "ReadMessages",
            Action::DeleteMessages { .. } => "DeleteMessages",
            Action::ScreenshotMessages { .. } => "ScreenshotMessages",
            Action::FlushHistory => "FlushHistory",
            Action::Resend { .. } => "Resend",
            Action::NotifyLayer { .. } => "NotifyLayer",
            Action::Typing { .. } => "Typing",
            Action::RequestKey { .. } => "RequestKey",
            Action::AcceptKey { .. } => "AcceptKey",
            Action::AbortKey { .. } => "AbortKey",
            Action::CommitKey { .. } => "CommitKey",
            Action::Noop => "Noop",
        }
    }

    /// Appends the type tag and fields.
    pub fn serialize_into(&self, w: &mut Writer) {
        match self {
            Action::SetTtl { ttl_seconds } => {
                w.put_u8(ACTION_SET_TTL);
                w.put_i32(*ttl_seconds);
            }
            Action::ReadMessages { random_ids } => {
                w.put_u8(ACTION_READ_MESSAGES);
                w.put_i64_list(random_ids);
            }
            Action::DeleteMessages { random_ids } => {
                w.put_u8(ACTION_DELETE_MESSAGES);
                w.put_i64_list(random_ids);
            }
            Action::ScreenshotMessages { random_ids } => {
                w.put_u8(ACTION_SCREENSHOT_MESSAGES);
                w.put_i64_list(random_ids);
            }
            Action::FlushHistory => w.put_u8(ACTION_FLUSH_HISTORY),
            Action::Resend {
                start_seq_no,
                end_seq_no,
            } => {
                w.put_u8(ACTION_RESEND);
                w.put_i32(*start_seq_no);
                w.put_i32(*end_seq_no);
            }
            Action::NotifyLayer { layer } => {
                w.put_u8(ACTION_NOTIFY_LAYER);
                w.put_i32(*layer);
            }
            Action::Typing { typing } => {
                w.put_u8(ACTION_TYPING);
                w.put_bool(*typing);
            }
            Action::RequestKey { exchange_id, g_a } => {
                w.put_u8(ACTION_REQUEST_KEY);
                w.put_i64(*exchange_id);
                w.put_bytes(g_a);
            }
            Action::AcceptKey {
                exchange_id,
                g_b,
                key_fingerprint,
            } => {
                w.put_u8(ACTION_ACCEPT_KEY);
                w.put_i64(*exchange_id);
                w.put_bytes(g_b);
                w.put_i64(*key_fingerprint);
            }
            Action::AbortKey { exchange_id } => {
                w.put_u8(ACTION_ABORT_KEY);
                w.put_i64(*exchange_id);
            }
            Action::CommitKey {
                exchange_id,
                key_fingerprint,
            } => {
                w.put_u8(ACTION_COMMIT_KEY);
                w.put_i64(*exchange_id);
                w.put_i64(*key_fingerprint);
            }
            Action::Noop => w.put_u8(ACTION_NOOP),
        }
    }

    /// Reads the type tag and fields.
    pub fn parse_from(r: &mut Reader<'_>) -> Result<Self> {
        let action_type = r.get_u8()?;
        let action = match action_type {
            ACTION_SET_TTL => Action::SetTtl {
                ttl_seconds: r.get_i32()?,
            },
            ACTION_READ_MESSAGES => Action::ReadMessages {
                random_ids: r.get_i64_list()?,
            },
            ACTION_DELETE_MESSAGES => Action::DeleteMessages {
                random_ids: r.get_i64_list()?,
            },
            ACTION_SCREENSHOT_MESSAGES => Action::ScreenshotMessages {
                random_ids: r.get_i64_list()?,
            },
            ACTION_FLUSH_HISTORY => Action::FlushHistory,
            ACTION_RESEND => Action::Resend {
                start_seq_no: r.get_i32()?,
                end_seq_no: r.get_i32()?,
            },
            ACTION_NOTIFY_LAYER => Action::NotifyLayer {
                layer: r.get_i32()?,
            },
            ACTION_TYPING => Action::Typing {
                typing: r.get_bool()?,
            },
            ACTION_REQUEST_KEY => Action::RequestKey {
                exchange_id: r.get_i64()?,
                g_a: r.get_bytes()?,
            },
            ACTION_ACCEPT_KEY => Action::AcceptKey {
                exchange_id: r.get_i64()?,
                g_b: r.get_bytes()?,
                key_fingerprint: r.get_i64()?,
            },
            ACTION_ABORT_KEY => Action::AbortKey {
                exchange_id: r.get_i64()?,
            },
            ACTION_COMMIT_KEY => Action::CommitKey {
                exchange_id: r.get_i64()?,
                key_fingerprint: r.get_i64()?,
            },
            ACTION_NOOP => Action::Noop,
            other => {
                return Err(Error::InvalidFrame(format!(
                    "Unknown action type: 0x{:02X}",
                    other
                )));
            }
        };
        Ok(action)
    }
}

/// User-visible message body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentMessage {
    /// Correlation id chosen by the sender.
    pub random_id: i64,
    /// Self-destruct timer in seconds.
    pub ttl: i32,
    /// Message text.
    pub text: String,
    /// Opaque media descriptor.
    pub media: Vec<u8>,
    /// Message this one replies to, 0 for none.
    pub reply_to_random_id: i64,
    /// Deliver without notification.
    pub silent: bool,
}

/// One message inside a [`MessageLayer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptedMessage {
    /// User content.
    Content(ContentMessage),
    /// Service action.
    Service {
        /// Correlation id chosen by the sender.
        random_id: i64,
        /// The action.
        action: Action,
    },
}

impl DecryptedMessage {
    /// Correlation id of the message.
    pub fn random_id(&self) -> i64 {
        match self {
            DecryptedMessage::Content(content) => content.random_id,
            DecryptedMessage::Service { random_id, .. } => *random_id,
        }
    }

    /// Service action, if any.
    pub fn action(&self) -> Option<&Action> {
        match self {
            DecryptedMessage::Content(_) => None,
            DecryptedMessage::Service { action, .. } => Some(action),
        }
    }

    fn serialize_into(&self, w: &mut Writer) {
        match self {
            DecryptedMessage::Content(content) => {
                w.put_u32(MAGIC_CONTENT);
                w.put_i64(content.random_id);
                w.put_i32(content.ttl);
                w.put_string(&content.text);
                w.put_bytes(&content.media);
                w.put_i64(content.reply_to_random_id);
                w.put_bool(content.silent);
            }
            DecryptedMessage::Service { random_id, action } => {
                w.put_u32(MAGIC_SERVICE);
                w.put_i64(*random_id);
                action.serialize_into(w);
            }
        }
    }

    fn parse_from(r: &mut Reader<'_>) -> Result<Self> {
        match r.get_u32()? {
            MAGIC_CONTENT => Ok(DecryptedMessage::Content(ContentMessage {
                random_id: r.get_i64()?,
                ttl: r.get_i32()?,
                text: r.get_string()?,
                media: r.get_bytes()?,
                reply_to_random_id: r.get_i64()?,
                silent: r.get_bool()?,
            })),
            MAGIC_SERVICE => {
                let random_id = r.get_i64()?;
                let action = Action::parse_from(r)?;
                Ok(DecryptedMessage::Service { random_id, action })
            }
            magic => Err(Error::InvalidFrame(format!(
                "Unknown message magic: 0x{:08X}",
                magic
            ))),
        }
    }
}

/// Envelope carried by every encrypted packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageLayer {
    /// Random prefix.
    pub random_bytes: Vec<u8>,
    /// Sender's layer.
    pub layer: i32,
    /// Sender's in sequence number.
    pub in_seq_no: i32,
    /// Sender's out sequence number.
    pub out_seq_no: i32,
    /// The message.
    pub message: DecryptedMessage,
}

impl MessageLayer {
    /// Wraps a message with a fresh random prefix.
    pub fn new(layer: i32, in_seq_no: i32, out_seq_no: i32, message: DecryptedMessage) -> Self {
        let mut random_bytes = vec![0u8; RANDOM_BYTES];
        OsRng.fill_bytes(&mut random_bytes);
        Self {
            random_bytes,
            layer,
            in_seq_no,
            out_seq_no,
            message,
        }
    }

    /// Serializes the envelope.
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.serialize_into(&mut w);
        w.finish()
    }

    /// Appends the envelope to a writer.
    pub fn serialize_into(&self, w: &mut Writer) {
        w.put_u32(MAGIC_MESSAGE_LAYER);
        w.put_bytes(&self.random_bytes);
        w.put_i32(self.layer);
        w.put_i32(self.in_seq_no);
        w.put_i32(self.out_seq_no);
        self.message.serialize_into(w);
    }

    /// Parses a complete envelope.
    ///
    /// # Errors
    /// Returns `Error::InvalidFrame` on an unknown magic, a short random prefix,
    /// or trailing bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let layer = Self::parse_from(&mut r)?;
        r.finish()?;
        Ok(layer)
    }

    /// Reads an envelope from a reader.
    pub fn parse_from(r: &mut Reader<'_>) -> Result<Self> {
        let magic = r.get_u32()?;
        if magic != MAGIC_MESSAGE_LAYER {
            return Err(Error::InvalidFrame(format!(
                "Invalid layer magic: expected 0x{:08X}, got 0x{:08X}",
                MAGIC_MESSAGE_LAYER, magic
            )));
        }
        let random_bytes = r.get_bytes()?;
        if random_bytes.len() < MIN_RANDOM_BYTES {
            return Err(Error::InvalidFrame(format!(
                "Random prefix too short: {} bytes",
                random_bytes.len()
            )));
        }
        Ok(Self {
            random_bytes,
            layer: r.get_i32()?,
            in_seq_no: r.get_i32()?,
            out_seq_no: r.get_i32()?,
            message: DecryptedMessage::parse_from(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_layer_roundtrip() {
        let layer = MessageLayer::new(
            LAYER_CURRENT,
            4,
            7,
            DecryptedMessage::Content(ContentMessage {
                random_id: 42,
                ttl: 5,
                text: "hi there".into(),
                media: vec![1, 2, 3],
                reply_to_random_id: 41,
                silent: true,
            }),
        );

        let parsed = MessageLayer::parse(&layer.serialize()).unwrap();
        assert_eq!(parsed, layer);
        assert_eq!(parsed.message.random_id(), 42);
        assert!(parsed.message.action().is_none());
    }

    #[test]
    fn test_pfs_action_layer_roundtrip() {
        let layer = MessageLayer::new(
            LAYER_DEFAULT,
            0,
            1,
            DecryptedMessage::Service {
                random_id: -9,
                action: Action::AcceptKey {
                    exchange_id: 77,
                    g_b: vec![0xAA; 256],
                    key_fingerprint: -5,
                },
            },
        );

        let parsed = MessageLayer::parse(&layer.serialize()).unwrap();
        assert_eq!(parsed, layer);
        assert!(parsed.message.action().unwrap().is_pfs());
    }

    #[test]
    fn test_action_wire_tag() {
        let mut w = Writer::new();
        Action::Resend {
            start_seq_no: 3,
            end_seq_no: 9,
        }
        .serialize_into(&mut w);
        let bytes = w.finish();

        assert_eq!(bytes, vec![ACTION_RESEND, 3, 0, 0, 0, 9, 0, 0, 0]);
    }

    #[test]
    fn test_unknown_action_rejected() {
        let mut r = Reader::new(&[0x7F]);
        assert!(matches!(
            Action::parse_from(&mut r),
            Err(Error::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_short_random_prefix_rejected() {
        let mut layer = MessageLayer::new(LAYER_DEFAULT, 0, 1, DecryptedMessage::Service {
            random_id: 1,
            action: Action::Noop,
        });
        layer.random_bytes.truncate(MIN_RANDOM_BYTES - 1);

        assert!(MessageLayer::parse(&layer.serialize()).is_err());
    }

    #[test]
    fn test_current_layer_clamps() {
        assert_eq!(current_layer(LAYER_INITIAL), LAYER_DEFAULT);
        assert_eq!(current_layer(100), 100);
        assert_eq!(current_layer(LAYER_CURRENT + 10), LAYER_CURRENT);
    }

    #[test]
    fn test_min_layers() {
        assert_eq!(Action::FlushHistory.min_layer(), LAYER_INITIAL);
        assert_eq!(Action::Typing { typing: true }.min_layer(), 17);
        assert_eq!(Action::AbortKey { exchange_id: 1 }.min_layer(), 20);
        assert!(Action::Noop.min_layer() <= LAYER_DEFAULT);
    }
}
