//! In-memory collaborators for testing.
//!
//! Deterministic stand-ins for the write-ahead log, the key-value store, the
//! clock and the application. `MemoryBinlog` separates written from synced
//! records so tests can simulate a crash at any point.

use crate::traits::{
    Ack, Binlog, ChatCallbacks, ChatStateUpdate, Clock, InboundMessage, KeyValueStore,
};
use crate::{Error, Result};
use async_trait::async_trait;
use sechat_core::{ChatId, EncryptedFile, LogId};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Debug, Default, Clone)]
struct BinlogInner {
    next_id: u64,
    records: BTreeMap<u64, Vec<u8>>,
    synced: BTreeMap<u64, Vec<u8>>,
    sync_count: u64,
}

/// Mock write-ahead log.
///
/// Clones share the same log.
///
/// # Example
///
/// ```
/// use sechat_engine::mock::MemoryBinlog;
/// use sechat_engine::traits::Binlog;
///
/// let binlog = MemoryBinlog::new();
/// binlog.append(b"unsynced".to_vec()).unwrap();
/// assert!(binlog.crash_copy().replay().unwrap().is_empty());
/// ```
#[derive(Debug, Default, Clone)]
pub struct MemoryBinlog {
    inner: Arc<RwLock<BinlogInner>>,
}

impl MemoryBinlog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// The log as a process restarted right now would find it.
    ///
    /// Only synced writes survive.
    pub fn crash_copy(&self) -> Self {
        let inner = match self.inner.read() {
            Ok(inner) => BinlogInner {
                next_id: inner.next_id,
                records: inner.synced.clone(),
                synced: inner.synced.clone(),
                sync_count: 0,
            },
            Err(_) => BinlogInner::default(),
        };
        Self {
            inner: Arc::new(RwLock::new(inner)),
        }
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.records.len()).unwrap_or(0)
    }

    /// Whether no record is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of completed syncs.
    pub fn sync_count(&self) -> u64 {
        self.inner.read().map(|inner| inner.sync_count).unwrap_or(0)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, BinlogInner>> {
        self.inner
            .write()
            .map_err(|_| Error::Storage("binlog lock poisoned".into()))
    }
}

#[async_trait]
impl Binlog for MemoryBinlog {
    fn append(&self, data: Vec<u8>) -> Result<LogId> {
        let mut inner = self.write()?;
        inner.next_id += 1;
        let id = inner.next_id;
        inner.records.insert(id, data);
        Ok(LogId(id))
    }

    fn rewrite(&self, id: LogId, data: Vec<u8>) -> Result<()> {
        let mut inner = self.write()?;
        match inner.records.get_mut(&id.0) {
            Some(record) => {
                *record = data;
                Ok(())
            }
            None => Err(Error::Storage(format!("rewrite of unknown record {}", id))),
        }
    }

    fn erase(&self, id: LogId) -> Result<()> {
        let mut inner = self.write()?;
        inner.records.remove(&id.0);
        Ok(())
    }

    async fn sync(&self) -> Result<()> {
        tokio::task::yield_now().await;
        let mut inner = self.write()?;
        inner.synced = inner.records.clone();
        inner.sync_count += 1;
        Ok(())
    }

    fn replay(&self) -> Result<Vec<(LogId, Vec<u8>)>> {
        let inner = self
            .inner
            .read()
            .map_err(|_| Error::Storage("binlog lock poisoned".into()))?;
        Ok(inner
            .records
            .iter()
            .map(|(id, data)| (LogId(*id), data.clone()))
            .collect())
    }
}

/// Mock key-value store. Clones share the same map.
#[derive(Debug, Default, Clone)]
pub struct MemoryKeyValueStore {
    values: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryKeyValueStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored key, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .values
            .read()
            .map(|values| values.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut values = self
            .values
            .write()
            .map_err(|_| Error::Storage("store lock poisoned".into()))?;
        values.insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let values = self
            .values
            .read()
            .map_err(|_| Error::Storage("store lock poisoned".into()))?;
        Ok(values.get(key).cloned())
    }

    fn erase(&self, key: &str) -> Result<()> {
        let mut values = self
            .values
            .write()
            .map_err(|_| Error::Storage("store lock poisoned".into()))?;
        values.remove(key);
        Ok(())
    }
}

/// Clock moved by hand.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Clock starting at `now`.
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, seconds: i64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Callback observed by [`RecordingCallbacks`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackEvent {
    /// `on_chat_state_changed`.
    StateChanged(ChatStateUpdate),
    /// `on_inbound_message`.
    Message(ChatId, InboundMessage),
    /// `on_delete_messages`.
    DeleteMessages(ChatId, Vec<i64>),
    /// `on_flush_history`.
    FlushHistory(ChatId, bool, i32),
    /// `on_read_messages`.
    ReadMessages(ChatId, Vec<i64>),
    /// `on_screenshot_taken`.
    Screenshot(ChatId, i64),
    /// `on_set_ttl`.
    SetTtl(ChatId, i32),
    /// `on_send_ok`.
    SendOk(ChatId, i64),
    /// `on_send_error`.
    SendError(ChatId, i64, String),
    /// `on_send_ack`.
    SendAck(ChatId, i64),
}

/// Application double that records every callback and acks at once.
#[derive(Debug, Default, Clone)]
pub struct RecordingCallbacks {
    events: Arc<RwLock<Vec<CallbackEvent>>>,
}

impl RecordingCallbacks {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every callback so far.
    pub fn events(&self) -> Vec<CallbackEvent> {
        self.events.read().map(|events| events.clone()).unwrap_or_default()
    }

    /// Content messages delivered to `chat_id`, in order.
    pub fn messages(&self, chat_id: ChatId) -> Vec<InboundMessage> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                CallbackEvent::Message(id, message) if id == chat_id => Some(message),
                _ => None,
            })
            .collect()
    }

    /// Most recent state update of `chat_id`.
    pub fn last_state(&self, chat_id: ChatId) -> Option<ChatStateUpdate> {
        self.events().into_iter().rev().find_map(|event| match event {
            CallbackEvent::StateChanged(update) if update.chat_id == chat_id => Some(update),
            _ => None,
        })
    }

    fn record(&self, event: CallbackEvent) {
        tracing::debug!(?event, "Callback");
        if let Ok(mut events) = self.events.write() {
            events.push(event);
        }
    }
}

impl ChatCallbacks for RecordingCallbacks {
    fn on_chat_state_changed(&self, update: ChatStateUpdate) {
        self.record(CallbackEvent::StateChanged(update));
    }

    fn on_inbound_message(&self, chat_id: ChatId, message: InboundMessage, ack: Ack) {
        self.record(CallbackEvent::Message(chat_id, message));
        ack.done();
    }

    fn on_delete_messages(&self, chat_id: ChatId, random_ids: Vec<i64>, ack: Ack) {
        self.record(CallbackEvent::DeleteMessages(chat_id, random_ids));
        ack.done();
    }

    fn on_flush_history(&self, chat_id: ChatId, remove_from_dialog_list: bool, message_id: i32, ack: Ack) {
        self.record(CallbackEvent::FlushHistory(chat_id, remove_from_dialog_list, message_id));
        ack.done();
    }

    fn on_read_messages(&self, chat_id: ChatId, random_ids: Vec<i64>, ack: Ack) {
        self.record(CallbackEvent::ReadMessages(chat_id, random_ids));
        ack.done();
    }

    fn on_screenshot_taken(&self, chat_id: ChatId, _message_id: i32, _date: i32, random_id: i64, ack: Ack) {
        self.record(CallbackEvent::Screenshot(chat_id, random_id));
        ack.done();
    }

    fn on_set_ttl(&self, chat_id: ChatId, _message_id: i32, _date: i32, ttl: i32, _random_id: i64, ack: Ack) {
        self.record(CallbackEvent::SetTtl(chat_id, ttl));
        ack.done();
    }

    fn on_send_ok(&self, chat_id: ChatId, random_id: i64, _date: i32, _file: Option<EncryptedFile>) {
        self.record(CallbackEvent::SendOk(chat_id, random_id));
    }

    fn on_send_error(&self, chat_id: ChatId, random_id: i64, error: String, ack: Ack) {
        self.record(CallbackEvent::SendError(chat_id, random_id, error));
        ack.done();
    }

    fn on_send_ack(&self, chat_id: ChatId, random_id: i64) {
        self.record(CallbackEvent::SendAck(chat_id, random_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_crash_drops_unsynced_writes() {
        let binlog = MemoryBinlog::new();
        let kept = binlog.append(b"kept".to_vec()).unwrap();
        binlog.sync().await.unwrap();
        let erased = binlog.append(b"erased".to_vec()).unwrap();
        binlog.sync().await.unwrap();

        binlog.erase(erased).unwrap();
        binlog.rewrite(kept, b"changed".to_vec()).unwrap();
        binlog.append(b"lost".to_vec()).unwrap();

        let restarted = binlog.crash_copy();
        assert_eq!(
            restarted.replay().unwrap(),
            vec![(kept, b"kept".to_vec()), (erased, b"erased".to_vec())]
        );

        let next = restarted.append(b"next".to_vec()).unwrap();
        assert!(next > erased);
    }

    #[test]
    fn test_rewrite_unknown_record_fails() {
        let binlog = MemoryBinlog::new();
        assert!(binlog.rewrite(LogId(9), Vec::new()).is_err());
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100);
        clock.advance(5);
        assert_eq!(clock.now(), 105);
    }
}
