use std::time::Duration;

use latchkey_common::LatchError;
use thiserror::Error;

/// Failures reaching or interpreting the coordination store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The key holds state of a different kind than the operation expects
    #[error("key '{key}' holds {found}, expected {expected}")]
    WrongType {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    /// The expiry `now + ttl` is past what the store's clock can represent
    #[error("ttl {ttl:?} for key '{key}' is out of range")]
    TtlOutOfRange { key: String, ttl: Duration },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for LatchError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::TtlOutOfRange { .. } | StoreError::InvalidArgument(_) => {
                LatchError::Configuration(e.to_string())
            }
            _ => LatchError::StoreUnavailable(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_maps_to_unavailable() {
        let err: LatchError = StoreError::Unavailable("connection refused".to_string()).into();
        assert_eq!(
            err,
            LatchError::StoreUnavailable("store unavailable: connection refused".to_string())
        );

        let err: LatchError = StoreError::WrongType {
            key: "rate_limit:k".to_string(),
            expected: "window",
            found: "value",
        }
        .into();
        assert!(matches!(err, LatchError::StoreUnavailable(_)));

        let err: LatchError = StoreError::TtlOutOfRange {
            key: "token:pay:1".to_string(),
            ttl: Duration::MAX,
        }
        .into();
        assert!(matches!(err, LatchError::Configuration(_)));
    }
}
