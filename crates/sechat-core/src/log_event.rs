//! Binlog events.
//!
//! Every event is framed as `magic (u32) || version (u8) || fields`. The
//! magic selects the event type; the version lets later releases add
//! trailing fields while still replaying older logs.

use crate::codec::{Reader, Writer};
use crate::types::{ChatId, EncryptedFile, InputEncryptedFile, UserId};
use crate::wire::Action;
use crate::{Error, Result};

/// Magic number for inbound message events (0x5345_494E = "SEIN").
pub const MAGIC_INBOUND: u32 = 0x5345_494E;

/// Magic number for outbound message events (0x5345_4F54 = "SEOT").
pub const MAGIC_OUTBOUND: u32 = 0x5345_4F54;

/// Magic number for close events (0x5345_434C = "SECL").
pub const MAGIC_CLOSE: u32 = 0x5345_434C;

/// Magic number for create events (0x5345_4352 = "SECR").
pub const MAGIC_CREATE: u32 = 0x5345_4352;

const INBOUND_VERSION: u8 = 1;
const OUTBOUND_VERSION: u8 = 2;
const CLOSE_VERSION: u8 = 1;
const CREATE_VERSION: u8 = 1;

/// Identifier of a binlog record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LogId(pub u64);

impl core::fmt::Display for LogId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Admitted inbound message awaiting delivery and save.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InboundSecretMessage {
    /// Chat the message belongs to.
    pub chat_id: ChatId,
    /// Server date.
    pub date: i32,
    /// Id of the key that decrypted the packet.
    pub auth_key_id: u64,
    /// Local message id assigned on admission.
    pub message_id: i32,
    /// Our in counter after admission.
    pub my_in_seq_no: i32,
    /// Our out counter at admission.
    pub my_out_seq_no: i32,
    /// Peer's in counter after admission.
    pub his_in_seq_no: i32,
    /// Peer's layer after admission.
    pub his_layer: i32,
    /// Serialized decrypted envelope.
    pub decrypted_message_layer: Vec<u8>,
    /// Attached file.
    pub file: Option<EncryptedFile>,
}

impl InboundSecretMessage {
    fn serialize_into(&self, w: &mut Writer) {
        w.put_u8(INBOUND_VERSION);
        w.put_i32(self.chat_id.0);
        w.put_i32(self.date);
        w.put_u64(self.auth_key_id);
        w.put_i32(self.message_id);
        w.put_i32(self.my_in_seq_no);
        w.put_i32(self.my_out_seq_no);
        w.put_i32(self.his_in_seq_no);
        w.put_i32(self.his_layer);
        w.put_bytes(&self.decrypted_message_layer);
        w.put_bool(self.file.is_some());
        if let Some(file) = &self.file {
            file.serialize_into(w);
        }
    }

    fn parse_from(r: &mut Reader<'_>) -> Result<Self> {
        let version = r.get_u8()?;
        if version != INBOUND_VERSION {
            return Err(Error::InvalidFrame(format!(
                "Unsupported inbound event version: {}",
                version
            )));
        }
        Ok(Self {
            chat_id: ChatId(r.get_i32()?),
            date: r.get_i32()?,
            auth_key_id: r.get_u64()?,
            message_id: r.get_i32()?,
            my_in_seq_no: r.get_i32()?,
            my_out_seq_no: r.get_i32()?,
            his_in_seq_no: r.get_i32()?,
            his_layer: r.get_i32()?,
            decrypted_message_layer: r.get_bytes()?,
            file: if r.get_bool()? {
                Some(EncryptedFile::parse_from(r)?)
            } else {
                None
            },
        })
    }
}

/// Outbound message from reservation until it is both sent and saved.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutboundSecretMessage {
    /// Chat the message belongs to.
    pub chat_id: ChatId,
    /// Correlation id of the message.
    pub random_id: i64,
    /// Local message id.
    pub message_id: i32,
    /// Our in counter when the message was built.
    pub my_in_seq_no: i32,
    /// Our out counter including this message.
    pub my_out_seq_no: i32,
    /// Peer's in counter when the message was built.
    pub his_in_seq_no: i32,
    /// Encrypted packet.
    pub encrypted_message: Vec<u8>,
    /// Attached file.
    pub file: Option<InputEncryptedFile>,
    /// Whether the server accepted the packet.
    pub is_sent: bool,
    /// Whether this is a service message.
    pub is_service: bool,
    /// Whether a permanent send failure may replace the message.
    pub is_rewritable: bool,
    /// Whether the application started the send.
    pub is_external: bool,
    /// Deliver without notification.
    pub is_silent: bool,
    /// Whether the peer's user is notified; service delivery otherwise.
    pub is_push: bool,
    /// Service action carried by the message.
    pub action: Option<Action>,
}

impl OutboundSecretMessage {
    fn serialize_into(&self, w: &mut Writer) {
        w.put_u8(OUTBOUND_VERSION);
        w.put_i32(self.chat_id.0);
        w.put_i64(self.random_id);
        w.put_i32(self.message_id);
        w.put_i32(self.my_in_seq_no);
        w.put_i32(self.my_out_seq_no);
        w.put_i32(self.his_in_seq_no);
        w.put_bytes(&self.encrypted_message);
        w.put_bool(self.file.is_some());
        if let Some(file) = &self.file {
            file.serialize_into(w);
        }
        w.put_bool(self.is_sent);
        w.put_bool(self.is_service);
        w.put_bool(self.is_rewritable);
        w.put_bool(self.is_external);
        w.put_bool(self.is_push);
        w.put_bool(self.action.is_some());
        if let Some(action) = &self.action {
            action.serialize_into(w);
        }
        w.put_bool(self.is_silent);
    }

    fn parse_from(r: &mut Reader<'_>) -> Result<Self> {
        let version = r.get_u8()?;
        if version == 0 || version > OUTBOUND_VERSION {
            return Err(Error::InvalidFrame(format!(
                "Unsupported outbound event version: {}",
                version
            )));
        }
        let mut event = Self {
            chat_id: ChatId(r.get_i32()?),
            random_id: r.get_i64()?,
            message_id: r.get_i32()?,
            my_in_seq_no: r.get_i32()?,
            my_out_seq_no: r.get_i32()?,
            his_in_seq_no: r.get_i32()?,
            encrypted_message: r.get_bytes()?,
            file: if r.get_bool()? {
                Some(InputEncryptedFile::parse_from(r)?)
            } else {
                None
            },
            is_sent: r.get_bool()?,
            is_service: r.get_bool()?,
            is_rewritable: r.get_bool()?,
            is_external: r.get_bool()?,
            is_push: r.get_bool()?,
            action: if r.get_bool()? {
                Some(Action::parse_from(r)?)
            } else {
                None
            },
            is_silent: false,
        };
        if version >= 2 {
            event.is_silent = r.get_bool()?;
        }
        Ok(event)
    }
}

/// Pending discard of a chat.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloseSecretChat {
    /// Chat being closed.
    pub chat_id: ChatId,
    /// Whether the local history is deleted too.
    pub delete_history: bool,
    /// Whether the server already discarded the chat.
    pub is_already_discarded: bool,
}

impl CloseSecretChat {
    fn serialize_into(&self, w: &mut Writer) {
        w.put_u8(CLOSE_VERSION);
        w.put_i32(self.chat_id.0);
        w.put_bool(self.delete_history);
        w.put_bool(self.is_already_discarded);
    }

    fn parse_from(r: &mut Reader<'_>) -> Result<Self> {
        let version = r.get_u8()?;
        if version != CLOSE_VERSION {
            return Err(Error::InvalidFrame(format!(
                "Unsupported close event version: {}",
                version
            )));
        }
        Ok(Self {
            chat_id: ChatId(r.get_i32()?),
            delete_history: r.get_bool()?,
            is_already_discarded: r.get_bool()?,
        })
    }
}

/// Chat creation requested by the local user, kept until the chat is ready.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CreateSecretChat {
    /// Random id of the chat; also its local chat id.
    pub random_id: i32,
    /// Invited user.
    pub user_id: UserId,
    /// Access hash of the invited user.
    pub user_access_hash: i64,
}

impl CreateSecretChat {
    fn serialize_into(&self, w: &mut Writer) {
        w.put_u8(CREATE_VERSION);
        w.put_i32(self.random_id);
        w.put_i64(self.user_id.0);
        w.put_i64(self.user_access_hash);
    }

    fn parse_from(r: &mut Reader<'_>) -> Result<Self> {
        let version = r.get_u8()?;
        if version != CREATE_VERSION {
            return Err(Error::InvalidFrame(format!(
                "Unsupported create event version: {}",
                version
            )));
        }
        Ok(Self {
            random_id: r.get_i32()?,
            user_id: UserId(r.get_i64()?),
            user_access_hash: r.get_i64()?,
        })
    }
}

/// Any secret chat binlog event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    /// Admitted inbound message.
    InboundMessage(InboundSecretMessage),
    /// Outbound message in flight.
    OutboundMessage(OutboundSecretMessage),
    /// Pending close.
    CloseChat(CloseSecretChat),
    /// Pending creation.
    CreateChat(CreateSecretChat),
}

impl LogEvent {
    /// Chat the event belongs to.
    pub fn chat_id(&self) -> ChatId {
        match self {
            LogEvent::InboundMessage(event) => event.chat_id,
            LogEvent::OutboundMessage(event) => event.chat_id,
            LogEvent::CloseChat(event) => event.chat_id,
            LogEvent::CreateChat(event) => ChatId(event.random_id),
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            LogEvent::InboundMessage(_) => "InboundSecretMessage",
            LogEvent::OutboundMessage(_) => "OutboundSecretMessage",
            LogEvent::CloseChat(_) => "CloseSecretChat",
            LogEvent::CreateChat(_) => "CreateSecretChat",
        }
    }

    /// Serializes the event with its magic.
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            LogEvent::InboundMessage(event) => {
                w.put_u32(MAGIC_INBOUND);
                event.serialize_into(&mut w);
            }
            LogEvent::OutboundMessage(event) => {
                w.put_u32(MAGIC_OUTBOUND);
                event.serialize_into(&mut w);
            }
            LogEvent::CloseChat(event) => {
                w.put_u32(MAGIC_CLOSE);
                event.serialize_into(&mut w);
            }
            LogEvent::CreateChat(event) => {
                w.put_u32(MAGIC_CREATE);
                event.serialize_into(&mut w);
            }
        }
        w.finish()
    }

    /// Parses an event.
    ///
    /// # Errors
    /// Returns `Error::InvalidFrame` for an unknown magic or version, or
    /// trailing bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let event = match r.get_u32()? {
            MAGIC_INBOUND => LogEvent::InboundMessage(InboundSecretMessage::parse_from(&mut r)?),
            MAGIC_OUTBOUND => LogEvent::OutboundMessage(OutboundSecretMessage::parse_from(&mut r)?),
            MAGIC_CLOSE => LogEvent::CloseChat(CloseSecretChat::parse_from(&mut r)?),
            MAGIC_CREATE => LogEvent::CreateChat(CreateSecretChat::parse_from(&mut r)?),
            magic => {
                return Err(Error::InvalidFrame(format!(
                    "Unknown log event magic: 0x{:08X}",
                    magic
                )));
            }
        };
        r.finish()?;
        Ok(event)
    }
}
