//! Server requests issued by a chat.

use crate::config::RetryPolicy;
use crate::error::RpcError;
use async_trait::async_trait;
use sechat_core::{ChatId, EncryptedChat, EncryptedFile, InputEncryptedFile, UserId};
use sechat_crypto::DhConfig;
use std::time::Duration;

/// Request handed to the RPC layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcRequest {
    /// Fetch DH parameters newer than `version`.
    GetDhConfig {
        /// Version we already hold, 0 for none.
        version: i32,
    },
    /// Invite a user to a new chat.
    RequestEncryption {
        /// Invited user.
        user_id: UserId,
        /// Access hash of the invited user.
        user_access_hash: i64,
        /// Random id; the server uses it as the chat id.
        random_id: i32,
        /// Our public value.
        g_a: Vec<u8>,
    },
    /// Accept an invitation.
    AcceptEncryption {
        /// Chat id.
        chat_id: ChatId,
        /// Access hash of the chat.
        access_hash: i64,
        /// Our public value.
        g_b: Vec<u8>,
        /// Fingerprint of the derived key.
        key_fingerprint: i64,
    },
    /// Discard a chat.
    DiscardEncryption {
        /// Chat id.
        chat_id: ChatId,
        /// Whether the peer should delete the history too.
        delete_history: bool,
    },
    /// Deliver an encrypted packet to the peer.
    SendEncrypted {
        /// Chat id.
        chat_id: ChatId,
        /// Access hash of the chat.
        access_hash: i64,
        /// Correlation id.
        random_id: i64,
        /// Encrypted packet.
        data: Vec<u8>,
        /// Attached file.
        file: Option<InputEncryptedFile>,
        /// Service delivery, the peer's user is not notified.
        is_service: bool,
        /// Deliver without sound.
        silent: bool,
    },
    /// Typing indicator.
    SetTyping {
        /// Chat id.
        chat_id: ChatId,
        /// Access hash of the chat.
        access_hash: i64,
        /// Whether we are typing.
        typing: bool,
    },
    /// Mark history read up to a date.
    ReadHistory {
        /// Chat id.
        chat_id: ChatId,
        /// Access hash of the chat.
        access_hash: i64,
        /// Date of the last read message.
        max_date: i32,
    },
}

impl RpcRequest {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            RpcRequest::GetDhConfig { .. } => "GetDhConfig",
            RpcRequest::RequestEncryption { .. } => "RequestEncryption",
            RpcRequest::AcceptEncryption { .. } => "AcceptEncryption",
            RpcRequest::DiscardEncryption { .. } => "DiscardEncryption",
            RpcRequest::SendEncrypted { .. } => "SendEncrypted",
            RpcRequest::SetTyping { .. } => "SetTyping",
            RpcRequest::ReadHistory { .. } => "ReadHistory",
        }
    }
}

/// Successful server answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcResponse {
    /// New DH parameters.
    DhConfig(DhConfig),
    /// The cached DH parameters are current.
    DhConfigNotModified,
    /// Chat envelope answering a handshake request.
    Chat(EncryptedChat),
    /// Packet stored for the peer.
    Sent {
        /// Server date.
        date: i32,
        /// Server-side copy of the attached file.
        file: Option<EncryptedFile>,
    },
    /// Plain acknowledgement.
    Ok,
}

/// Transport to the server.
#[async_trait]
pub trait RpcDispatcher: Send + Sync {
    /// Performs one request.
    async fn send(&self, request: RpcRequest) -> Result<RpcResponse, RpcError>;
}

/// Sends `request`, retrying transient failures with exponential backoff.
///
/// The request is resent unchanged. After `policy.max_retries` retries the
/// last transient error is returned.
pub async fn call_with_retry(
    rpc: &dyn RpcDispatcher,
    request: RpcRequest,
    policy: &RetryPolicy,
) -> Result<RpcResponse, RpcError> {
    let mut attempt: u32 = 0;
    loop {
        match rpc.send(request.clone()).await {
            Err(RpcError::Transient(reason)) if attempt < policy.max_retries => {
                let delay = policy.backoff(attempt);
                tracing::debug!(
                    request = request.name(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Retrying RPC"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl RpcDispatcher for Flaky {
        async fn send(&self, _request: RpcRequest) -> Result<RpcResponse, RpcError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(RpcError::Transient("timeout".into()))
            } else {
                Ok(RpcResponse::Ok)
            }
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(10), Duration::from_secs(1));
        assert_eq!(policy.backoff(999), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let rpc = Flaky {
            failures: 3,
            calls: AtomicU32::new(0),
        };
        let result = call_with_retry(&rpc, RpcRequest::GetDhConfig { version: 0 }, &fast_policy(5)).await;
        assert_eq!(result, Ok(RpcResponse::Ok));
        assert_eq!(rpc.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_retries_are_capped() {
        let rpc = Flaky {
            failures: 10,
            calls: AtomicU32::new(0),
        };
        let result = call_with_retry(&rpc, RpcRequest::GetDhConfig { version: 0 }, &fast_policy(2)).await;
        assert!(matches!(result, Err(RpcError::Transient(_))));
        assert_eq!(rpc.calls.load(Ordering::SeqCst), 3);
    }
}
