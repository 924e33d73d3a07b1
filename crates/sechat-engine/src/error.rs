//! Engine errors.

use thiserror::Error;

/// Result type alias.
pub type Result<T> = core::result::Result<T, Error>;

/// Engine errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Protocol error from core.
    #[error("Protocol error: {0}")]
    Protocol(#[from] sechat_core::Error),

    /// RPC failed.
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    /// Durable storage failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The chat task is gone.
    #[error("Chat {0} is stopped")]
    Stopped(sechat_core::ChatId),

    /// No chat with this id.
    #[error("Unknown chat {0}")]
    UnknownChat(sechat_core::ChatId),
}

/// Failure reported by the RPC dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// Worth retrying (timeout, flood wait, lost connection).
    #[error("Transient RPC failure: {0}")]
    Transient(String),

    /// The server rejected the request.
    #[error("RPC rejected: {0}")]
    Permanent(String),
}

impl RpcError {
    /// Whether the request may be retried unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, RpcError::Transient(_))
    }
}

impl From<Error> for sechat_core::Error {
    fn from(error: Error) -> Self {
        match error {
            Error::Protocol(error) => error,
            Error::Rpc(error) => sechat_core::Error::Network(error.to_string()),
            Error::Storage(reason) => sechat_core::Error::Persistence(reason),
            Error::Stopped(_) | Error::UnknownChat(_) => sechat_core::Error::ChatClosed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sechat_core::ErrorClass;

    #[test]
    fn test_storage_failure_is_fatal() {
        let core: sechat_core::Error = Error::Storage("disk full".into()).into();
        assert_eq!(core.class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_rpc_failure_is_transient() {
        let core: sechat_core::Error = Error::Rpc(RpcError::Transient("timeout".into())).into();
        assert_eq!(core.class(), ErrorClass::Transient);
        assert!(!RpcError::Permanent("ENCRYPTION_DECLINED".into()).is_transient());
    }
}
