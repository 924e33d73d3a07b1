//! Core protocol logic for secret chats.
//!
//! This crate holds the pure parts of the secret chat engine:
//! - Byte codec, message envelopes and service actions (`codec`, `wire`)
//! - Versioned durable records and binlog events (`state`, `log_event`)
//! - Sequence numbering with gap and duplicate detection (`seq_no`)
//! - Handshake lifecycle and forward-secrecy rotation (`lifecycle`, `pfs`)
//! - In-order release of asynchronously saved changes (`changes`)
//!
//! Nothing here performs I/O. The async runtime lives in `sechat-engine`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod changes;
pub mod codec;
pub mod error;
pub mod lifecycle;
pub mod log_event;
pub mod pfs;
pub mod seq_no;
pub mod state;
pub mod types;
pub mod wire;

pub use changes::{ChangeToken, ChangesProcessor};
pub use error::{Error, ErrorClass, Result};
pub use lifecycle::{ChatStatus, EncryptedChat, HandshakeRequest};
pub use log_event::{LogEvent, LogId};
pub use pfs::RekeyPolicy;
pub use seq_no::{Admission, SeqNoChange, SeqNoUpdate, WireSeqNo};
pub use state::{AuthState, ChatState, ConfigState, DurableRecord, PfsStage, PfsState, SeqNoState};
pub use types::{ChatId, EncryptedFile, InputEncryptedFile, UserId};
pub use wire::{Action, ContentMessage, DecryptedMessage, MessageLayer};
