//! Windowed rate limiting over the coordination store
//!
//! Every admission is a single store-side `try_acquire`, so concurrent callers
//! on different nodes share one counter. The first call that creates a window
//! fixes its limit and length; later calls with different numbers do not
//! change a live window.

use std::sync::Arc;
use std::time::Duration;

use latchkey_common::{DEFAULT_RATE_LIMIT_SCENE, LatchError, LatchResult, scoped_key};
use latchkey_store::{CoordinationStore, RateWindow, StoreError, WindowAlgorithm};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// What to do when the store cannot be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Surface `StoreUnavailable` to the caller
    #[default]
    FailClosed,
    /// Admit the call and log a warning
    FailOpen,
}

/// Rate limiter configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    pub scene: String,
    pub algorithm: WindowAlgorithm,
    pub store_failure: StoreFailurePolicy,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            scene: DEFAULT_RATE_LIMIT_SCENE.to_string(),
            algorithm: WindowAlgorithm::FixedWindow,
            store_failure: StoreFailurePolicy::FailClosed,
        }
    }
}

/// Store-backed rate limiter shared by all callers of one process
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CoordinationStore>,
    config: RateLimiterConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CoordinationStore>, config: RateLimiterConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Record one call against `key` and report whether it is admitted.
    ///
    /// A limit of zero rejects every call. A zero-length window is a
    /// configuration error.
    pub async fn try_acquire(&self, key: &str, limit: u64, window_secs: u64) -> LatchResult<bool> {
        if window_secs == 0 {
            return Err(LatchError::Configuration(format!(
                "rate limit window for '{}' must be at least one second",
                key
            )));
        }
        let window = RateWindow {
            limit,
            window: Duration::from_secs(window_secs),
            algorithm: self.config.algorithm,
        };
        self.try_acquire_window(key, window).await
    }

    /// Like `try_acquire`, with an explicit window and algorithm
    pub async fn try_acquire_window(&self, key: &str, window: RateWindow) -> LatchResult<bool> {
        if window.window.is_zero() {
            return Err(LatchError::Configuration(format!(
                "rate limit window for '{}' must not be zero",
                key
            )));
        }

        let scoped = scoped_key(&self.config.scene, key);
        match self.store.try_acquire(&scoped, window).await {
            Ok(admitted) => {
                debug!(
                    key = %scoped,
                    limit = window.limit,
                    window_secs = window.window.as_secs(),
                    admitted,
                    "Rate limit check"
                );
                Ok(admitted)
            }
            Err(e @ (StoreError::TtlOutOfRange { .. } | StoreError::InvalidArgument(_))) => {
                Err(e.into())
            }
            Err(e) => match self.config.store_failure {
                StoreFailurePolicy::FailClosed => Err(e.into()),
                StoreFailurePolicy::FailOpen => {
                    warn!(
                        key = %scoped,
                        error = %e,
                        "Coordination store unavailable, admitting call (fail-open)"
                    );
                    Ok(true)
                }
            },
        }
    }

    /// Admit one call or return `RateLimitExceeded`
    pub async fn check(&self, key: &str, limit: u64, window_secs: u64) -> LatchResult<()> {
        if self.try_acquire(key, limit, window_secs).await? {
            Ok(())
        } else {
            Err(LatchError::RateLimitExceeded {
                key: key.to_string(),
                limit,
                window_secs,
            })
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("store", &self.store.name())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use latchkey_store::MemoryCoordinationStore;

    use super::*;

    fn limiter(algorithm: WindowAlgorithm) -> RateLimiter {
        RateLimiter::new(
            Arc::new(MemoryCoordinationStore::new()),
            RateLimiterConfig {
                algorithm,
                ..Default::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_sequence() {
        let limiter = limiter(WindowAlgorithm::FixedWindow);

        let mut results = Vec::new();
        for _ in 0..4 {
            results.push(limiter.try_acquire("sms:138", 3, 5).await.unwrap());
        }
        assert_eq!(results, vec![true, true, true, false]);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(limiter.try_acquire("sms:138", 3, 5).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stored_window_wins() {
        let limiter = limiter(WindowAlgorithm::FixedWindow);

        assert!(limiter.try_acquire("api", 1, 10).await.unwrap());
        // A larger limit on a live window has no effect
        assert!(!limiter.try_acquire("api", 100, 10).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_log_never_exceeds_limit() {
        let limiter = limiter(WindowAlgorithm::SlidingLog);

        assert!(limiter.try_acquire("login", 2, 10).await.unwrap());
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(limiter.try_acquire("login", 2, 10).await.unwrap());
        assert!(!limiter.try_acquire("login", 2, 10).await.unwrap());

        // First admission falls out of the log
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.try_acquire("login", 2, 10).await.unwrap());
        assert!(!limiter.try_acquire("login", 2, 10).await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_limit_rejects() {
        let limiter = limiter(WindowAlgorithm::FixedWindow);
        assert!(!limiter.try_acquire("closed", 0, 5).await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_window_is_configuration_error() {
        let limiter = limiter(WindowAlgorithm::FixedWindow);
        let err = limiter.try_acquire("k", 3, 0).await.unwrap_err();
        assert!(matches!(err, LatchError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_unrepresentable_window_is_configuration_error() {
        let limiter = limiter(WindowAlgorithm::FixedWindow);
        let err = limiter.try_acquire("k", 3, u64::MAX).await.unwrap_err();
        assert!(matches!(err, LatchError::Configuration(_)));

        // Fail-open covers outages, not bad arguments
        let open = RateLimiter::new(
            Arc::new(MemoryCoordinationStore::new()),
            RateLimiterConfig {
                store_failure: StoreFailurePolicy::FailOpen,
                ..Default::default()
            },
        );
        assert!(matches!(
            open.try_acquire("k", 3, u64::MAX).await,
            Err(LatchError::Configuration(_))
        ));
        assert!(open.try_acquire("k", 3, 60).await.unwrap());
    }

    #[tokio::test]
    async fn test_check_returns_rate_limit_exceeded() {
        let limiter = limiter(WindowAlgorithm::FixedWindow);

        limiter.check("export", 1, 60).await.unwrap();
        let err = limiter.check("export", 1, 60).await.unwrap_err();
        assert_eq!(
            err,
            LatchError::RateLimitExceeded {
                key: "export".to_string(),
                limit: 1,
                window_secs: 60,
            }
        );
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = limiter(WindowAlgorithm::FixedWindow);
        assert!(limiter.try_acquire("a", 1, 60).await.unwrap());
        assert!(limiter.try_acquire("b", 1, 60).await.unwrap());
        assert!(!limiter.try_acquire("a", 1, 60).await.unwrap());
    }

    #[test]
    fn test_store_failure_policy_serde() {
        let policy: StoreFailurePolicy = serde_json::from_str("\"fail_open\"").unwrap();
        assert_eq!(policy, StoreFailurePolicy::FailOpen);
        assert_eq!(StoreFailurePolicy::default(), StoreFailurePolicy::FailClosed);
    }
}
