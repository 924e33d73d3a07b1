//! Per-chat engine options.

use sechat_core::RekeyPolicy;
use std::time::Duration;

/// How RPC failures are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries before a transient failure becomes final.
    pub max_retries: u32,
    /// Delay before the first retry; doubles after each one.
    pub base_delay: Duration,
    /// Upper bound on a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1000,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Chat configuration.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Forward-secrecy rotation thresholds.
    pub rekey: RekeyPolicy,
    /// Close a chat whose handshake has not finished after this many seconds.
    pub handshake_timeout: Option<i64>,
    /// Retry behaviour of every RPC.
    pub retry: RetryPolicy,
    /// How often deadlines are checked.
    pub tick_interval: Duration,
    /// Capacity of each chat's command queue.
    pub command_buffer: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            rekey: RekeyPolicy::default(),
            handshake_timeout: Some(7 * 24 * 60 * 60),
            retry: RetryPolicy::default(),
            tick_interval: Duration::from_secs(1),
            command_buffer: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChatConfig::default();
        assert_eq!(config.rekey.message_threshold, 100);
        assert_eq!(config.rekey.max_key_age, 7 * 24 * 60 * 60);
        assert_eq!(config.retry.max_retries, 1000);
        assert_eq!(config.handshake_timeout, Some(604_800));
    }
}
