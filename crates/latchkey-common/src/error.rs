//! Error types and error codes for latchkey
//!
//! This module defines:
//! - `LatchError`: the error taxonomy shared by locks, rate limiting and tokens
//! - `ErrorCode`: structured error codes for callers that report failures

use serde::{Deserialize, Serialize};

use crate::crypto::CryptoError;

/// Errors surfaced by the coordination primitives
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LatchError {
    /// The wait budget ran out, or a fail-fast attempt hit a held lock
    #[error("lock '{key}' not acquired: {message}")]
    LockAcquisitionTimeout { key: String, message: String },

    /// A key template named a missing argument or an argument bound to null
    #[error("key resolution error: {0}")]
    KeyResolution(String),

    #[error("rate limit exceeded for '{key}': {limit} calls per {window_secs}s")]
    RateLimitExceeded {
        key: String,
        limit: u64,
        window_secs: u64,
    },

    /// Decrypt failure, malformed payload, or an already-consumed/unknown token
    #[error("token invalid: {0}")]
    TokenInvalid(String),

    #[error("coordination store unavailable: {0}")]
    StoreUnavailable(String),

    /// Setup-time validation failure
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The token cipher failed at run time
    #[error("token cipher error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Result type used across latchkey crates
pub type LatchResult<T> = Result<T, LatchError>;

impl LatchError {
    /// Shorthand for a lock acquisition failure
    pub fn lock_timeout(key: impl Into<String>, message: impl Into<String>) -> Self {
        LatchError::LockAcquisitionTimeout {
            key: key.into(),
            message: message.into(),
        }
    }

    /// The stable error code for this error
    pub fn error_code(&self) -> ErrorCode<'static> {
        match self {
            LatchError::LockAcquisitionTimeout { .. } => LOCK_ACQUISITION_TIMEOUT,
            LatchError::KeyResolution(_) => KEY_RESOLUTION_ERROR,
            LatchError::RateLimitExceeded { .. } => RATE_LIMIT_EXCEEDED,
            LatchError::TokenInvalid(_) => TOKEN_INVALID,
            LatchError::StoreUnavailable(_) => STORE_UNAVAILABLE,
            LatchError::Configuration(_) => CONFIGURATION_ERROR,
            LatchError::Crypto(_) => TOKEN_CIPHER_ERROR,
        }
    }

    /// Whether a caller may try the same call again later.
    ///
    /// The primitives themselves never retry on the caller's behalf.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LatchError::LockAcquisitionTimeout { .. }
                | LatchError::RateLimitExceeded { .. }
                | LatchError::StoreUnavailable(_)
        )
    }

    /// Whether this error is an expected business outcome rather than a defect
    pub fn is_business_outcome(&self) -> bool {
        matches!(
            self,
            LatchError::LockAcquisitionTimeout { .. }
                | LatchError::RateLimitExceeded { .. }
                | LatchError::TokenInvalid(_)
        )
    }
}

/// Error code structure for reporting failures
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCode<'a> {
    pub code: i32,
    pub message: &'a str,
}

pub const LOCK_ACQUISITION_TIMEOUT: ErrorCode<'static> = ErrorCode {
    code: 30001,
    message: "lock acquisition timeout",
};

pub const KEY_RESOLUTION_ERROR: ErrorCode<'static> = ErrorCode {
    code: 30002,
    message: "key resolution error",
};

pub const RATE_LIMIT_EXCEEDED: ErrorCode<'static> = ErrorCode {
    code: 30003,
    message: "rate limit exceeded",
};

pub const TOKEN_INVALID: ErrorCode<'static> = ErrorCode {
    code: 30004,
    message: "token invalid",
};

pub const STORE_UNAVAILABLE: ErrorCode<'static> = ErrorCode {
    code: 30005,
    message: "coordination store unavailable",
};

pub const CONFIGURATION_ERROR: ErrorCode<'static> = ErrorCode {
    code: 30006,
    message: "configuration error",
};

pub const TOKEN_CIPHER_ERROR: ErrorCode<'static> = ErrorCode {
    code: 30007,
    message: "token cipher error",
};
