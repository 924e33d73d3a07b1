//! Map of live chats.
//!
//! The registry is the only state shared between chats. It starts chat tasks
//! on demand, routes server pushes to them and, on startup, replays the
//! binlog into the chats its events belong to.

use crate::actor::spawn_chat;
use crate::context::{ChatContext, SecretChatDb};
use crate::handle::{EncryptedMessage, SecretChatHandle};
use crate::{Error, Result};
use rand::Rng;
use sechat_core::{AuthState, ChatId, EncryptedChat, LogEvent, UserId};
use std::collections::HashMap;
use std::sync::RwLock;

/// Every chat of one account.
pub struct ChatRegistry {
    ctx: ChatContext,
    chats: RwLock<HashMap<ChatId, SecretChatHandle>>,
}

impl ChatRegistry {
    /// Registry with no binlog to replay.
    pub fn new(ctx: ChatContext) -> Self {
        Self {
            ctx,
            chats: RwLock::new(HashMap::new()),
        }
    }

    /// Replays the binlog and starts every chat that has pending events.
    ///
    /// Events are routed to their chat in log order; unreadable records are
    /// erased. Once all events are delivered each restored chat resumes.
    ///
    /// # Errors
    /// Returns a storage error if the binlog can't be read.
    pub async fn restore(ctx: ChatContext) -> Result<Self> {
        let registry = Self::new(ctx);
        let records = registry.ctx.binlog.replay()?;
        let total = records.len();
        let mut restored: Vec<SecretChatHandle> = Vec::new();

        for (log_id, data) in records {
            let event = match LogEvent::parse(&data) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(log_id = %log_id, error = %e, "Dropping unreadable binlog record");
                    registry.ctx.binlog.erase(log_id)?;
                    continue;
                }
            };
            let chat_id = event.chat_id();
            let handle = match restored.iter().find(|h| h.chat_id() == chat_id) {
                Some(handle) => handle.clone(),
                None => {
                    let handle = registry.spawn(chat_id, false)?;
                    restored.push(handle.clone());
                    handle
                }
            };
            handle.replay(log_id, event).await?;
        }

        for handle in &restored {
            handle.finish_replay().await?;
        }
        tracing::info!(chats = restored.len(), records = total, "Restored secret chats");
        Ok(registry)
    }

    fn lookup(&self, chat_id: ChatId) -> Option<SecretChatHandle> {
        let chats = self.chats.read().ok()?;
        chats
            .get(&chat_id)
            .filter(|handle| !handle.is_stopped())
            .cloned()
    }

    fn spawn(&self, chat_id: ChatId, finish_replay: bool) -> Result<SecretChatHandle> {
        let mut chats = self
            .chats
            .write()
            .map_err(|_| Error::Storage("chat map lock poisoned".into()))?;
        chats.retain(|_, handle| !handle.is_stopped());
        if let Some(handle) = chats.get(&chat_id) {
            return Ok(handle.clone());
        }
        let handle = spawn_chat(chat_id, self.ctx.clone(), finish_replay)?;
        chats.insert(chat_id, handle.clone());
        Ok(handle)
    }

    fn get_or_spawn(&self, chat_id: ChatId) -> Result<SecretChatHandle> {
        match self.lookup(chat_id) {
            Some(handle) => Ok(handle),
            None => self.spawn(chat_id, true),
        }
    }

    /// Handle of a known chat.
    ///
    /// # Errors
    /// Returns `Error::UnknownChat` if the chat has neither a task nor stored
    /// state.
    pub fn chat(&self, chat_id: ChatId) -> Result<SecretChatHandle> {
        if let Some(handle) = self.lookup(chat_id) {
            return Ok(handle);
        }
        let db = SecretChatDb::new(self.ctx.kv.clone(), chat_id);
        if db.get_value::<AuthState>()?.is_none() {
            return Err(Error::UnknownChat(chat_id));
        }
        self.spawn(chat_id, true)
    }

    /// Starts a new chat with `user_id` and returns its id.
    pub async fn create_chat(&self, user_id: UserId, user_access_hash: i64) -> Result<ChatId> {
        let handle = loop {
            let chat_id = ChatId(rand::thread_rng().gen_range(1..i32::MAX));
            if self.lookup(chat_id).is_some() {
                continue;
            }
            let db = SecretChatDb::new(self.ctx.kv.clone(), chat_id);
            if db.get_value::<AuthState>()?.is_some() {
                continue;
            }
            break self.spawn(chat_id, true)?;
        };
        handle.create_chat(user_id, user_access_hash).await?;
        Ok(handle.chat_id())
    }

    /// Routes a chat envelope pushed by the server.
    pub async fn on_update_chat(&self, chat: EncryptedChat) -> Result<()> {
        let handle = self.get_or_spawn(chat.id())?;
        handle.update_chat(chat).await
    }

    /// Routes an encrypted packet pushed by the server.
    ///
    /// Resolves once the packet is durably logged, dropped or rejected.
    pub async fn on_new_message(&self, chat_id: ChatId, message: EncryptedMessage) -> Result<()> {
        let handle = self.chat(chat_id)?;
        handle.on_new_message(message).await
    }

    /// Closes a chat.
    pub async fn cancel_chat(&self, chat_id: ChatId, delete_history: bool) -> Result<()> {
        match self.chat(chat_id) {
            Ok(handle) => handle.cancel_chat(delete_history).await,
            Err(Error::UnknownChat(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Ids of the chats with a running task.
    pub fn chat_ids(&self) -> Vec<ChatId> {
        let mut ids: Vec<ChatId> = self
            .chats
            .read()
            .map(|chats| {
                chats
                    .iter()
                    .filter(|(_, handle)| !handle.is_stopped())
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default();
        ids.sort_by_key(|id| id.0);
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChatConfig;
    use crate::context::DhConfigCache;
    use crate::error::RpcError;
    use crate::mock::{ManualClock, MemoryBinlog, MemoryKeyValueStore, RecordingCallbacks};
    use crate::rpc::{RpcDispatcher, RpcRequest, RpcResponse};
    use crate::traits::Binlog;
    use async_trait::async_trait;
    use sechat_core::log_event::CreateSecretChat;
    use sechat_crypto::PrimeCache;
    use std::sync::Arc;

    /// Server that never answers.
    struct Silent;

    #[async_trait]
    impl RpcDispatcher for Silent {
        async fn send(&self, _request: RpcRequest) -> core::result::Result<RpcResponse, RpcError> {
            std::future::pending().await
        }
    }

    fn context(binlog: MemoryBinlog) -> ChatContext {
        ChatContext {
            binlog: Arc::new(binlog),
            kv: Arc::new(MemoryKeyValueStore::new()),
            rpc: Arc::new(Silent),
            callbacks: Arc::new(RecordingCallbacks::new()),
            clock: Arc::new(ManualClock::new(1_000)),
            primes: Arc::new(PrimeCache::new()),
            dh_config: Arc::new(DhConfigCache::new()),
            config: ChatConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_unknown_chat() {
        let registry = ChatRegistry::new(context(MemoryBinlog::new()));
        assert!(matches!(
            registry.chat(ChatId(5)),
            Err(Error::UnknownChat(ChatId(5)))
        ));
        assert!(registry.cancel_chat(ChatId(5), false).await.is_ok());
        assert!(registry.chat_ids().is_empty());
    }

    #[tokio::test]
    async fn test_restore_drops_unreadable_records() {
        let binlog = MemoryBinlog::new();
        binlog.append(b"garbage".to_vec()).unwrap();
        let create = LogEvent::CreateChat(CreateSecretChat {
            random_id: 42,
            user_id: UserId(7),
            user_access_hash: 9,
        });
        binlog.append(create.serialize()).unwrap();

        let registry = ChatRegistry::restore(context(binlog.clone())).await.unwrap();
        assert_eq!(registry.chat_ids(), vec![ChatId(42)]);
        assert_eq!(binlog.len(), 1);

        let snapshot = registry.chat(ChatId(42)).unwrap().snapshot().await.unwrap();
        assert_eq!(snapshot.auth.user_id, UserId(7));
        assert_eq!(snapshot.auth.random_id, 42);
    }

    /// Test: closed chats don't stay in the map
    #[tokio::test]
    async fn test_stopped_chats_are_pruned() {
        let registry = ChatRegistry::new(context(MemoryBinlog::new()));
        let first = registry.create_chat(UserId(7), 1).await.unwrap();
        let handle = registry.chat(first).unwrap();
        registry.cancel_chat(first, false).await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(10), async {
            while !handle.is_stopped() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("chat task did not stop");

        let second = registry.create_chat(UserId(8), 2).await.unwrap();
        let chats = registry.chats.read().unwrap();
        assert_eq!(chats.len(), 1);
        assert!(chats.contains_key(&second));
        assert!(!chats.contains_key(&first));
    }
}
