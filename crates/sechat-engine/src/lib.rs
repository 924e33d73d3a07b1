//! Async runtime for secret chats.
//!
//! Every chat runs as its own tokio task owning all of its state:
//! - The initial key exchange and discard (`sechat_core::lifecycle`)
//! - Sequenced inbound and outbound message pipelines
//! - Forward-secrecy key rotation interleaved with regular traffic
//! - Write-ahead durability: every message is logged and synced before it
//!   becomes visible, and replayed after a crash
//!
//! The outside world is reached through the traits in [`traits`] and
//! [`rpc`], bundled in a [`ChatContext`]. [`ChatRegistry`] owns the chats of
//! one account; [`SecretChatHandle`] talks to one of them.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod actor;
pub mod change_log;
pub mod config;
pub mod context;
pub mod error;
pub mod handle;
pub mod mock;
pub mod registry;
pub mod rpc;
pub mod sync_queue;
pub mod traits;

pub use config::{ChatConfig, RetryPolicy};
pub use context::{ChatContext, DhConfigCache, SecretChatDb};
pub use error::{Error, Result, RpcError};
pub use handle::{ChatSnapshot, EncryptedMessage, SecretChatHandle};
pub use registry::ChatRegistry;
pub use rpc::{RpcDispatcher, RpcRequest, RpcResponse};
pub use traits::{
    Ack, Binlog, ChatCallbacks, ChatStateUpdate, Clock, InboundMessage, KeyValueStore, SystemClock,
};
