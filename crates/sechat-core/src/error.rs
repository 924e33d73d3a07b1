//! Error types for secret chat protocol operations.

use thiserror::Error;

/// Result type alias for protocol operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Protocol operation errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Protocol inconsistency (bad parity, fingerprint mismatch, unexpected peer value).
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The peer skipped sequence numbers.
    #[error("Sequence gap: expected out_seq_no {expected}, got {received}")]
    SeqNoGap {
        /// Next expected peer counter.
        expected: i32,
        /// Counter carried by the message.
        received: i32,
    },

    /// The message was already admitted.
    #[error("Stale message: out_seq_no {received} is below {expected}")]
    StaleSeqNo {
        /// Next expected peer counter.
        expected: i32,
        /// Counter carried by the message.
        received: i32,
    },

    /// Packet is encrypted with a key we do not hold.
    #[error("Unknown auth key {0:#018x}")]
    UnknownAuthKey(u64),

    /// Forward-secrecy exchange aborted or stale.
    #[error("Rekey aborted: {0}")]
    RekeyAborted(String),

    /// RPC failure or timeout.
    #[error("Network error: {0}")]
    Network(String),

    /// Durable write failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Invalid state transition.
    #[error("Invalid state transition")]
    InvalidState,

    /// Chat is closed.
    #[error("Chat is closed")]
    ChatClosed,

    /// Chat has no established key yet.
    #[error("Chat is not ready")]
    ChatNotReady,

    /// Invalid record or envelope format.
    #[error("Invalid frame format: {0}")]
    InvalidFrame(String),

    /// Insufficient data.
    #[error("Insufficient data: need {0} bytes")]
    InsufficientData(usize),

    /// Cryptographic error.
    #[error("Crypto error: {0}")]
    Crypto(#[from] sechat_crypto::Error),
}

/// How the engine reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Close the chat and report the reason.
    Fatal,
    /// Retry with backoff.
    Transient,
    /// Abort the rekey and keep the current key.
    Recoverable,
    /// Log and drop the message.
    Ignorable,
}

impl Error {
    /// Classifies the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::StaleSeqNo { .. } | Error::UnknownAuthKey(_) => ErrorClass::Ignorable,
            Error::RekeyAborted(_) => ErrorClass::Recoverable,
            Error::Network(_) => ErrorClass::Transient,
            Error::ProtocolViolation(_)
            | Error::SeqNoGap { .. }
            | Error::Persistence(_)
            | Error::InvalidState
            | Error::ChatClosed
            | Error::ChatNotReady
            | Error::InvalidFrame(_)
            | Error::InsufficientData(_)
            | Error::Crypto(_) => ErrorClass::Fatal,
        }
    }

    /// Whether the error must close the chat.
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(Error::SeqNoGap {
            expected: 1,
            received: 3
        }
        .is_fatal());
        assert_eq!(
            Error::StaleSeqNo {
                expected: 3,
                received: 1
            }
            .class(),
            ErrorClass::Ignorable
        );
        assert_eq!(Error::UnknownAuthKey(7).class(), ErrorClass::Ignorable);
        assert_eq!(
            Error::RekeyAborted("stale".into()).class(),
            ErrorClass::Recoverable
        );
        assert_eq!(Error::Network("timeout".into()).class(), ErrorClass::Transient);
        assert!(Error::from(sechat_crypto::Error::Decryption("tag".into())).is_fatal());
    }

    #[test]
    fn test_display() {
        let err = Error::SeqNoGap {
            expected: 0,
            received: 2,
        };
        assert_eq!(err.to_string(), "Sequence gap: expected out_seq_no 0, got 2");
    }
}
