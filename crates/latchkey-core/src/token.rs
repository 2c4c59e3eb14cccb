//! Single-use anti-replay tokens
//!
//! `issue` stores `businessKey:nonce` under the business key and hands the
//! caller an encrypted copy. `validate` decrypts it and consumes the stored
//! value with one compare-and-delete, so among any number of concurrent
//! validations of the same token at most one succeeds. Issuing again for the
//! same business key replaces the previous token.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use latchkey_common::{DEFAULT_TOKEN_SCENE, LatchError, LatchResult, TokenCipher, scoped_key};
use latchkey_store::CoordinationStore;
use tracing::{debug, warn};
use uuid::Uuid;

/// Separator between the business key and the nonce in a token payload
pub const TOKEN_SEPARATOR: char = ':';

/// Default token lifetime
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(1800);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGuardConfig {
    pub scene: String,
    pub ttl: Duration,
}

impl Default for TokenGuardConfig {
    fn default() -> Self {
        Self {
            scene: DEFAULT_TOKEN_SCENE.to_string(),
            ttl: DEFAULT_TOKEN_TTL,
        }
    }
}

/// Issues and consumes single-use tokens
#[derive(Clone)]
pub struct TokenGuard {
    store: Arc<dyn CoordinationStore>,
    cipher: Arc<TokenCipher>,
    config: TokenGuardConfig,
}

impl TokenGuard {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        cipher: Arc<TokenCipher>,
        config: TokenGuardConfig,
    ) -> Self {
        Self {
            store,
            cipher,
            config,
        }
    }

    pub fn config(&self) -> &TokenGuardConfig {
        &self.config
    }

    /// Issue a token for `business_key` with the configured lifetime
    pub async fn issue(&self, business_key: &str) -> LatchResult<String> {
        self.issue_with_ttl(business_key, self.config.ttl).await
    }

    pub async fn issue_with_ttl(&self, business_key: &str, ttl: Duration) -> LatchResult<String> {
        if business_key.is_empty() {
            return Err(LatchError::Configuration(
                "token business key must not be empty".to_string(),
            ));
        }
        if ttl.is_zero() {
            return Err(LatchError::Configuration(
                "token ttl must not be zero".to_string(),
            ));
        }

        let raw = format!(
            "{}{}{}",
            business_key,
            TOKEN_SEPARATOR,
            Uuid::new_v4().simple()
        );
        let token = self.cipher.encrypt(&raw)?;

        let key = scoped_key(&self.config.scene, business_key);
        self.store.set(&key, Bytes::from(raw), ttl).await?;
        debug!(key = %key, ttl_secs = ttl.as_secs(), "Token issued");
        Ok(token)
    }

    /// Consume `token`, returning the business key it was issued for.
    ///
    /// Fails with `TokenInvalid` when the token does not decrypt, is
    /// malformed, was already consumed, has expired, or was superseded by a
    /// later issue for the same business key.
    pub async fn validate(&self, token: &str) -> LatchResult<String> {
        let raw = self.cipher.decrypt(token).map_err(|e| {
            warn!(error = %e, "Token rejected, decryption failed");
            LatchError::TokenInvalid("token cannot be decrypted".to_string())
        })?;

        let business_key = match raw.rsplit_once(TOKEN_SEPARATOR) {
            Some((business_key, nonce)) if !business_key.is_empty() && !nonce.is_empty() => {
                business_key.to_string()
            }
            _ => {
                warn!("Token rejected, malformed payload");
                return Err(LatchError::TokenInvalid(
                    "token payload is malformed".to_string(),
                ));
            }
        };

        let key = scoped_key(&self.config.scene, &business_key);
        match self.store.check_and_delete(&key, raw.as_bytes()).await? {
            Some(_) => {
                debug!(key = %key, "Token consumed");
                Ok(business_key)
            }
            None => {
                warn!(key = %key, "Token rejected, already consumed or unknown");
                Err(LatchError::TokenInvalid(
                    "token already consumed or unknown".to_string(),
                ))
            }
        }
    }

    /// Invalidate the outstanding token of `business_key`, if any
    pub async fn revoke(&self, business_key: &str) -> LatchResult<bool> {
        let key = scoped_key(&self.config.scene, business_key);
        let removed = self.store.delete(&key).await?;
        debug!(key = %key, removed, "Token revoked");
        Ok(removed)
    }
}

impl std::fmt::Debug for TokenGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGuard")
            .field("store", &self.store.name())
            .field("cipher", &self.cipher)
            .field("config", &self.config)
            .finish()
    }
}
