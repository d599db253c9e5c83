//! Error taxonomy shared by the channel and every workload.
//!
//! Each variant maps onto a numeric wire code so a requester can tell
//! retryable failures (timeouts, contention) from permanent ones (malformed
//! input, unknown message types).

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Numeric error codes carried in `{"type": "error"}` bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Timeout,
    NodeNotFound,
    NotSupported,
    TemporarilyUnavailable,
    MalformedRequest,
    Crash,
    Abort,
    KeyDoesNotExist,
    KeyAlreadyExists,
    PreconditionFailed,
    TxnConflict,
    Other(u32),
}

impl ErrorCode {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Timeout,
            1 => Self::NodeNotFound,
            10 => Self::NotSupported,
            11 => Self::TemporarilyUnavailable,
            12 => Self::MalformedRequest,
            13 => Self::Crash,
            14 => Self::Abort,
            20 => Self::KeyDoesNotExist,
            21 => Self::KeyAlreadyExists,
            22 => Self::PreconditionFailed,
            30 => Self::TxnConflict,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::Timeout => 0,
            Self::NodeNotFound => 1,
            Self::NotSupported => 10,
            Self::TemporarilyUnavailable => 11,
            Self::MalformedRequest => 12,
            Self::Crash => 13,
            Self::Abort => 14,
            Self::KeyDoesNotExist => 20,
            Self::KeyAlreadyExists => 21,
            Self::PreconditionFailed => 22,
            Self::TxnConflict => 30,
            Self::Other(code) => code,
        }
    }

    /// Whether a requester may reasonably try the same operation again.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::TemporarilyUnavailable
                | Self::Crash
                | Self::Abort
                | Self::PreconditionFailed
                | Self::TxnConflict
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Timeout => "timeout",
            Self::NodeNotFound => "node-not-found",
            Self::NotSupported => "not-supported",
            Self::TemporarilyUnavailable => "temporarily-unavailable",
            Self::MalformedRequest => "malformed-request",
            Self::Crash => "crash",
            Self::Abort => "abort",
            Self::KeyDoesNotExist => "key-does-not-exist",
            Self::KeyAlreadyExists => "key-already-exists",
            Self::PreconditionFailed => "precondition-failed",
            Self::TxnConflict => "txn-conflict",
            Self::Other(code) => return write!(f, "error-{code}"),
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NodeError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("unknown message type `{0}`")]
    UnknownMessageType(String),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("compare-and-swap failed: {0}")]
    CasFailed(String),
    #[error("gave up on `{key}` after {attempts} contended attempts")]
    ConcurrencyExhausted { key: String, attempts: u32 },
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("key does not exist: {0}")]
    KeyDoesNotExist(String),
    #[error("store holds an unusable value under `{key}`: {detail}")]
    CorruptValue { key: String, detail: String },
    #[error("handler for `{0}` is already registered")]
    DuplicateHandler(String),
    #[error("outbound channel closed")]
    ChannelClosed,
    #[error("{code}: {text}")]
    Remote { code: ErrorCode, text: String },
}

impl NodeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MalformedRequest(_) => ErrorCode::MalformedRequest,
            Self::UnknownMessageType(_) => ErrorCode::NotSupported,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::CasFailed(_) => ErrorCode::PreconditionFailed,
            Self::ConcurrencyExhausted { .. } => ErrorCode::TxnConflict,
            Self::StoreUnavailable(_) => ErrorCode::TemporarilyUnavailable,
            Self::KeyDoesNotExist(_) => ErrorCode::KeyDoesNotExist,
            Self::CorruptValue { .. } | Self::DuplicateHandler(_) | Self::ChannelClosed => {
                ErrorCode::Crash
            }
            Self::Remote { code, .. } => *code,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    /// Rebuilds a typed error from an `error` reply received off the wire.
    pub fn from_wire(code: u32, text: String) -> Self {
        match ErrorCode::from_code(code) {
            ErrorCode::MalformedRequest => Self::MalformedRequest(text),
            ErrorCode::TemporarilyUnavailable => Self::StoreUnavailable(text),
            ErrorCode::KeyDoesNotExist => Self::KeyDoesNotExist(text),
            ErrorCode::PreconditionFailed => Self::CasFailed(text),
            code => Self::Remote { code, text },
        }
    }

    pub(crate) fn malformed(err: impl fmt::Display) -> Self {
        Self::MalformedRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_wire_numbers() {
        for raw in [0, 1, 10, 11, 12, 13, 14, 20, 21, 22, 30, 1000] {
            assert_eq!(ErrorCode::from_code(raw).code(), raw);
        }
    }

    #[test]
    fn retryable_split_matches_taxonomy() {
        assert!(NodeError::Timeout(Duration::from_millis(5)).is_retryable());
        assert!(NodeError::CasFailed("stale".into()).is_retryable());
        assert!(NodeError::StoreUnavailable("down".into()).is_retryable());
        assert!(
            NodeError::ConcurrencyExhausted {
                key: "counter".into(),
                attempts: 3
            }
            .is_retryable()
        );

        assert!(!NodeError::MalformedRequest("missing delta".into()).is_retryable());
        assert!(!NodeError::UnknownMessageType("bogus".into()).is_retryable());
        assert!(!NodeError::KeyDoesNotExist("counter".into()).is_retryable());
    }

    #[test]
    fn corrupt_store_value_is_not_blamed_on_the_request() {
        let err = NodeError::CorruptValue {
            key: "counter".into(),
            detail: "\"oops\" is not an integer".into(),
        };
        assert_eq!(err.code(), ErrorCode::Crash);
        assert_eq!(err.code().code(), 13);
    }

    #[test]
    fn wire_errors_become_typed_variants() {
        assert_eq!(
            NodeError::from_wire(22, "expected 1".into()),
            NodeError::CasFailed("expected 1".into())
        );
        assert_eq!(
            NodeError::from_wire(20, "missing".into()),
            NodeError::KeyDoesNotExist("missing".into())
        );
        assert!(matches!(
            NodeError::from_wire(14, "aborted".into()),
            NodeError::Remote {
                code: ErrorCode::Abort,
                ..
            }
        ));
    }
}
