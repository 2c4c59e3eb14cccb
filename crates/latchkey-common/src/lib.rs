//! Latchkey Common - Shared types and utilities
//!
//! This crate provides the foundational types used across all latchkey components:
//! - Error taxonomy and error codes
//! - Token cipher (AES-GCM) for opaque single-use tokens
//! - Common constants

pub mod crypto;
pub mod error;

// Re-exports for convenience
pub use crypto::{CryptoError, CryptoResult, TokenCipher};
pub use error::{ErrorCode, LatchError, LatchResult};

/// Scene used for lock keys when none is configured
pub const DEFAULT_LOCK_SCENE: &str = "lock";

/// Scene used for rate limiter keys when none is configured
pub const DEFAULT_RATE_LIMIT_SCENE: &str = "rate_limit";

/// Scene used for anti-replay token keys when none is configured
pub const DEFAULT_TOKEN_SCENE: &str = "token";

/// Separator between a scene and the resolved key
pub const SCENE_SEPARATOR: char = ':';

/// Build the store key for a resolved key inside a scene (`{scene}:{key}`)
///
/// # Examples
///
/// ```
/// use latchkey_common::scoped_key;
///
/// assert_eq!(scoped_key("lock", "order:42"), "lock:order:42");
/// ```
pub fn scoped_key(scene: &str, key: &str) -> String {
    let mut scoped = String::with_capacity(scene.len() + 1 + key.len());
    scoped.push_str(scene);
    scoped.push(SCENE_SEPARATOR);
    scoped.push_str(key);
    scoped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_key() {
        assert_eq!(scoped_key("token", "pay:1001"), "token:pay:1001");
        assert_eq!(scoped_key("", "k"), ":k");
    }
}
