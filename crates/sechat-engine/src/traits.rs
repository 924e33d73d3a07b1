//! Collaborator traits at the engine boundary.
//!
//! The engine owns no I/O. Durable storage, the clock and the application are
//! injected through these traits; `mock` has in-memory versions for tests.

use crate::Result;
use async_trait::async_trait;
use sechat_core::{ChatId, ChatStatus, ContentMessage, EncryptedFile, LogId, UserId};
use tokio::sync::oneshot;

/// Append-only write-ahead log shared by every chat.
///
/// Writes are visible to `replay` at once but only survive a crash after a
/// later `sync` completes.
#[async_trait]
pub trait Binlog: Send + Sync {
    /// Appends a record.
    fn append(&self, data: Vec<u8>) -> Result<LogId>;

    /// Replaces the body of a record.
    fn rewrite(&self, id: LogId, data: Vec<u8>) -> Result<()>;

    /// Removes a record.
    fn erase(&self, id: LogId) -> Result<()>;

    /// Resolves once every earlier write is durable.
    async fn sync(&self) -> Result<()>;

    /// Every live record in append order.
    fn replay(&self) -> Result<Vec<(LogId, Vec<u8>)>>;
}

/// Durable string-keyed store; writes are durable when the call returns.
pub trait KeyValueStore: Send + Sync {
    /// Stores a value.
    fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Loads a value.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Removes a value.
    fn erase(&self, key: &str) -> Result<()>;
}

/// Wall clock in unix seconds.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> i64;
}

/// System time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default()
    }
}

/// Completion handle passed to the application.
///
/// The engine keeps the related log event until the ack is resolved. Dropping
/// it without calling [`Ack::done`] counts as done.
#[derive(Debug)]
pub struct Ack(oneshot::Sender<()>);

impl Ack {
    /// Creates an ack and the receiver the engine waits on.
    pub fn channel() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    /// Marks the application side as durable.
    pub fn done(self) {
        let _ = self.0.send(());
    }
}

/// Content message admitted from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Local message id.
    pub message_id: i32,
    /// Server date.
    pub date: i32,
    /// Message body.
    pub content: ContentMessage,
    /// Attached file.
    pub file: Option<EncryptedFile>,
}

/// Chat state reported to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatStateUpdate {
    /// Chat id.
    pub chat_id: ChatId,
    /// Status.
    pub status: ChatStatus,
    /// Why the chat closed, if it closed on an error.
    pub reason: Option<String>,
    /// Peer user.
    pub user_id: UserId,
    /// Whether we created the chat.
    pub is_outbound: bool,
    /// Key visualization hash, empty before the key exists.
    pub key_hash: Vec<u8>,
    /// Layer both sides speak.
    pub layer: i32,
    /// Self-destruct timer in seconds.
    pub ttl: i32,
    /// Creation date.
    pub date: i32,
}

/// Application side of a chat.
///
/// Methods taking an [`Ack`] may finish asynchronously.
pub trait ChatCallbacks: Send + Sync {
    /// Chat status, key hash, layer or ttl changed.
    fn on_chat_state_changed(&self, update: ChatStateUpdate);

    /// A content message arrived.
    fn on_inbound_message(&self, chat_id: ChatId, message: InboundMessage, ack: Ack);

    /// The peer deleted messages.
    fn on_delete_messages(&self, chat_id: ChatId, random_ids: Vec<i64>, ack: Ack);

    /// History up to `message_id` must be cleared.
    fn on_flush_history(&self, chat_id: ChatId, remove_from_dialog_list: bool, message_id: i32, ack: Ack);

    /// The peer read messages.
    fn on_read_messages(&self, chat_id: ChatId, random_ids: Vec<i64>, ack: Ack);

    /// The peer took a screenshot.
    fn on_screenshot_taken(&self, chat_id: ChatId, message_id: i32, date: i32, random_id: i64, ack: Ack);

    /// The peer changed the self-destruct timer.
    fn on_set_ttl(&self, chat_id: ChatId, message_id: i32, date: i32, ttl: i32, random_id: i64, ack: Ack);

    /// The server accepted one of our messages.
    fn on_send_ok(&self, chat_id: ChatId, random_id: i64, date: i32, file: Option<EncryptedFile>);

    /// One of our messages could not be sent.
    fn on_send_error(&self, chat_id: ChatId, random_id: i64, error: String, ack: Ack);

    /// The peer received one of our messages.
    fn on_send_ack(&self, chat_id: ChatId, random_id: i64);
}
