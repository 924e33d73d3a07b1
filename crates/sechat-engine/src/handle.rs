//! Cloneable front end of a chat task.

use crate::{Error, Result};
use sechat_core::{
    Action, AuthState, ChatId, ConfigState, ContentMessage, EncryptedChat, EncryptedFile,
    InputEncryptedFile, LogEvent, LogId, PfsState, SeqNoState, UserId,
};
use tokio::sync::{mpsc, oneshot};

pub(crate) type Reply = oneshot::Sender<Result<()>>;

pub(crate) enum Command {
    Replay {
        log_id: LogId,
        event: LogEvent,
    },
    ReplayFinish,
    Create {
        user_id: UserId,
        user_access_hash: i64,
        reply: Reply,
    },
    UpdateChat {
        chat: EncryptedChat,
    },
    NewMessage {
        message: EncryptedMessage,
        reply: Reply,
    },
    SendMessage {
        content: ContentMessage,
        file: Option<InputEncryptedFile>,
        reply: Reply,
    },
    SendAction {
        random_id: i64,
        action: Action,
        reply: Reply,
    },
    SendTyping {
        typing: bool,
        reply: Reply,
    },
    ReadHistory {
        date: i32,
        reply: Reply,
    },
    RequestRekey {
        reply: Reply,
    },
    Cancel {
        delete_history: bool,
        reply: Reply,
    },
    Snapshot {
        reply: oneshot::Sender<ChatSnapshot>,
    },
}

/// Encrypted packet pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedMessage {
    /// Server date.
    pub date: i32,
    /// Encrypted packet.
    pub data: Vec<u8>,
    /// Attached file.
    pub file: Option<EncryptedFile>,
}

/// Copy of a chat's in-memory state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSnapshot {
    /// Identity and handshake.
    pub auth: AuthState,
    /// Sequence counters.
    pub seq: SeqNoState,
    /// Layers and ttl.
    pub config: ConfigState,
    /// Keys.
    pub pfs: PfsState,
    /// Outbound messages not yet acknowledged and saved.
    pub pending_outbound: usize,
    /// Inbound messages not yet acknowledged and saved.
    pub pending_inbound: usize,
    /// Whether the chat is closing or closed.
    pub closed: bool,
}

/// Handle to one chat task.
#[derive(Debug, Clone)]
pub struct SecretChatHandle {
    chat_id: ChatId,
    tx: mpsc::Sender<Command>,
}

impl SecretChatHandle {
    pub(crate) fn new(chat_id: ChatId, tx: mpsc::Sender<Command>) -> Self {
        Self { chat_id, tx }
    }

    /// Chat id.
    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }

    /// Whether the chat task has exited.
    pub fn is_stopped(&self) -> bool {
        self.tx.is_closed()
    }

    async fn call<F>(&self, command: F) -> Result<()>
    where
        F: FnOnce(Reply) -> Command,
    {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply)).await?;
        rx.await.map_err(|_| Error::Stopped(self.chat_id))?
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| Error::Stopped(self.chat_id))
    }

    pub(crate) async fn replay(&self, log_id: LogId, event: LogEvent) -> Result<()> {
        self.send(Command::Replay { log_id, event }).await
    }

    pub(crate) async fn finish_replay(&self) -> Result<()> {
        self.send(Command::ReplayFinish).await
    }

    /// Invites a user; resolves once the request is durable.
    ///
    /// # Errors
    /// Fails with `InvalidState` unless the chat is empty.
    pub async fn create_chat(&self, user_id: UserId, user_access_hash: i64) -> Result<()> {
        self.call(|reply| Command::Create {
            user_id,
            user_access_hash,
            reply,
        })
        .await
    }

    /// Applies a chat envelope from the server.
    pub async fn update_chat(&self, chat: EncryptedChat) -> Result<()> {
        self.send(Command::UpdateChat { chat }).await
    }

    /// Processes an encrypted packet; resolves once it is durably logged,
    /// dropped as a duplicate, or rejected.
    pub async fn on_new_message(&self, message: EncryptedMessage) -> Result<()> {
        self.call(|reply| Command::NewMessage { message, reply })
            .await
    }

    /// Sends a content message; resolves once it is queued in the log.
    pub async fn send_message(
        &self,
        content: ContentMessage,
        file: Option<InputEncryptedFile>,
    ) -> Result<()> {
        self.call(|reply| Command::SendMessage {
            content,
            file,
            reply,
        })
        .await
    }

    /// Sends `ReadMessages`, `DeleteMessages`, `ScreenshotMessages` or
    /// `FlushHistory`.
    pub async fn send_action(&self, random_id: i64, action: Action) -> Result<()> {
        self.call(|reply| Command::SendAction {
            random_id,
            action,
            reply,
        })
        .await
    }

    /// Changes the self-destruct timer for both sides.
    pub async fn send_set_ttl_message(&self, ttl_seconds: i32, random_id: i64) -> Result<()> {
        self.send_action(random_id, Action::SetTtl { ttl_seconds })
            .await
    }

    /// Typing indicator.
    pub async fn send_typing(&self, typing: bool) -> Result<()> {
        self.call(|reply| Command::SendTyping { typing, reply })
            .await
    }

    /// Marks history read up to `date`.
    pub async fn send_read_history(&self, date: i32) -> Result<()> {
        self.call(|reply| Command::ReadHistory { date, reply })
            .await
    }

    /// Starts a forward-secrecy key rotation.
    pub async fn request_rekey(&self) -> Result<()> {
        self.call(|reply| Command::RequestRekey { reply }).await
    }

    /// Closes the chat. Closing an already closed chat succeeds.
    pub async fn cancel_chat(&self, delete_history: bool) -> Result<()> {
        match self
            .call(|reply| Command::Cancel {
                delete_history,
                reply,
            })
            .await
        {
            Err(Error::Stopped(_)) => Ok(()),
            result => result,
        }
    }

    /// Current in-memory state.
    pub async fn snapshot(&self) -> Result<ChatSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| Error::Stopped(self.chat_id))
    }
}
