//! Collaborators shared by every chat.

use crate::config::ChatConfig;
use crate::rpc::RpcDispatcher;
use crate::traits::{Binlog, ChatCallbacks, Clock, KeyValueStore};
use crate::{Error, Result};
use sechat_core::{ChatId, DurableRecord};
use sechat_crypto::{DhConfig, PrimeCache};
use std::sync::{Arc, RwLock};

/// Last DH parameters returned by the server.
#[derive(Debug, Default)]
pub struct DhConfigCache {
    config: RwLock<Option<DhConfig>>,
}

impl DhConfigCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached parameters.
    pub fn get(&self) -> Option<DhConfig> {
        self.config.read().ok().and_then(|config| config.clone())
    }

    /// Replaces the cached parameters.
    pub fn set(&self, config: DhConfig) {
        if let Ok(mut slot) = self.config.write() {
            *slot = Some(config);
        }
    }
}

/// Everything a chat needs from the outside world.
#[derive(Clone)]
pub struct ChatContext {
    /// Write-ahead log.
    pub binlog: Arc<dyn Binlog>,
    /// Compact state store.
    pub kv: Arc<dyn KeyValueStore>,
    /// Server transport.
    pub rpc: Arc<dyn RpcDispatcher>,
    /// Application.
    pub callbacks: Arc<dyn ChatCallbacks>,
    /// Wall clock.
    pub clock: Arc<dyn Clock>,
    /// Validated primes.
    pub primes: Arc<PrimeCache>,
    /// Server DH parameters.
    pub dh_config: Arc<DhConfigCache>,
    /// Options.
    pub config: ChatConfig,
}

/// One chat's scope inside the key-value store.
#[derive(Clone)]
pub struct SecretChatDb {
    kv: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl SecretChatDb {
    /// Scope for `chat_id`.
    pub fn new(kv: Arc<dyn KeyValueStore>, chat_id: ChatId) -> Self {
        Self {
            kv,
            prefix: format!("secret{}", chat_id.0),
        }
    }

    fn key<T: DurableRecord>(&self) -> String {
        format!("{}{}", self.prefix, T::KEY)
    }

    /// Stores a record.
    pub fn set_value<T: DurableRecord>(&self, value: &T) -> Result<()> {
        self.kv.set(&self.key::<T>(), value.store())
    }

    /// Loads a record, `None` if it was never stored.
    pub fn get_value<T: DurableRecord>(&self) -> Result<Option<T>> {
        match self.kv.get(&self.key::<T>())? {
            Some(data) => T::parse(&data).map(Some).map_err(Error::from),
            None => Ok(None),
        }
    }

    /// Removes a record.
    pub fn erase_value<T: DurableRecord>(&self) -> Result<()> {
        self.kv.erase(&self.key::<T>())
    }
}
